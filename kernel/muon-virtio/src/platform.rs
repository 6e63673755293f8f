//! Device multiplexer.
//!
//! [`Platform`] owns one slot per device kind, discovers devices over PCI
//! or MMIO, routes kernel work to the right driver, and pumps completions
//! from the interrupt ring to the used rings once per scheduler iteration.
//!
//! Discovery is caller-driven: the PCI scan takes a [`PciScanConfig`]
//! naming the BAR assignment window and INTx vector base, the MMIO scan
//! takes a probe table of candidate register windows. Probing reads only
//! addresses the table lists; on real hardware the caller derives the
//! table from firmware data rather than using the hypervisor defaults
//! below.

use alloc::boxed::Box;
use alloc::vec::Vec;

use muon_driver_api::{
    DeviceKind, DmaAllocator, IrqControl, PciAddress, PciConfigAccess, PciDeviceInfo, WorkId,
    WorkItem, WorkResult, WorkSink, WorkState,
};

use crate::devices::{
    kind_for_device_type, BlkDevice, NetDevice, RngDevice, VirtioDevice,
};
use crate::pci::config::{self, regs};
use crate::pci::BarAllocator;
use crate::ring::IrqRing;
use crate::transport::pci::{virtio_device_type, PciTransport};
use crate::transport::{MmioTransport, Transport, VirtioTransport};

/// The VirtIO PCI vendor ID.
const VIRTIO_PCI_VENDOR: u16 = 0x1AF4;

/// One candidate virtio-mmio register window.
#[derive(Debug, Clone, Copy)]
pub struct MmioProbeSlot {
    /// Identity-mapped base of the register window.
    pub base: u64,
    /// Interrupt vector wired to this slot.
    pub irq: u32,
}

/// Probe table for QEMU's aarch64 `virt` machine: 0x200-byte windows from
/// 0x0a00_0000, wired to SPIs 16+ (GIC INTIDs 48+).
pub const MMIO_PROBE_ARM_VIRT: [MmioProbeSlot; 8] = [
    MmioProbeSlot { base: 0x0a00_0000, irq: 48 },
    MmioProbeSlot { base: 0x0a00_0200, irq: 49 },
    MmioProbeSlot { base: 0x0a00_0400, irq: 50 },
    MmioProbeSlot { base: 0x0a00_0600, irq: 51 },
    MmioProbeSlot { base: 0x0a00_0800, irq: 52 },
    MmioProbeSlot { base: 0x0a00_0a00, irq: 53 },
    MmioProbeSlot { base: 0x0a00_0c00, irq: 54 },
    MmioProbeSlot { base: 0x0a00_0e00, irq: 55 },
];

/// Probe table for QEMU's riscv64 `virt` machine: 4 KiB windows from
/// 0x1000_1000, wired to PLIC sources 1-8.
pub const MMIO_PROBE_RISCV_VIRT: [MmioProbeSlot; 8] = [
    MmioProbeSlot { base: 0x1000_1000, irq: 1 },
    MmioProbeSlot { base: 0x1000_2000, irq: 2 },
    MmioProbeSlot { base: 0x1000_3000, irq: 3 },
    MmioProbeSlot { base: 0x1000_4000, irq: 4 },
    MmioProbeSlot { base: 0x1000_5000, irq: 5 },
    MmioProbeSlot { base: 0x1000_6000, irq: 6 },
    MmioProbeSlot { base: 0x1000_7000, irq: 7 },
    MmioProbeSlot { base: 0x1000_8000, irq: 8 },
];

/// Parameters for the PCI scan.
#[derive(Debug, Clone, Copy)]
pub struct PciScanConfig {
    /// 4 KiB-aligned bus-address window BARs are assigned from.
    pub bar_window: u64,
    /// Vector base for INTx swizzling.
    pub irq_base: u32,
}

/// Warn about interrupt-ring overflow in steps of this many drops.
const OVERFLOW_WARN_STEP: u32 = 100;

/// The device multiplexer: one slot per device kind plus the
/// deferred-interrupt ring.
pub struct Platform {
    ring: IrqRing,
    rng: Option<RngDevice>,
    blk: Option<BlkDevice>,
    net: Option<NetDevice>,
    /// Overflow count already reported, for throttled warnings.
    overflow_warned: u32,
}

impl Platform {
    /// Creates an empty platform with no devices bound.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: IrqRing::new(),
            rng: None,
            blk: None,
            net: None,
            overflow_warned: 0,
        }
    }

    /// Whether a device of `kind` is bound and usable.
    #[must_use]
    pub fn has_device(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Entropy => self.rng.is_some(),
            DeviceKind::Block => self.blk.is_some(),
            DeviceKind::Net => self.net.is_some(),
        }
    }

    /// The deferred-interrupt ring (diagnostics).
    #[must_use]
    pub fn irq_ring(&self) -> &IrqRing {
        &self.ring
    }

    /// Bound block device, if any (capacity queries).
    #[must_use]
    pub fn blk(&self) -> Option<&BlkDevice> {
        self.blk.as_ref()
    }

    /// Bound network device, if any (MAC/MTU queries).
    #[must_use]
    pub fn net(&self) -> Option<&NetDevice> {
        self.net.as_ref()
    }

    fn device(&self, kind: DeviceKind) -> Option<&dyn VirtioDevice> {
        match kind {
            DeviceKind::Entropy => self.rng.as_ref().map(|d| d as &dyn VirtioDevice),
            DeviceKind::Block => self.blk.as_ref().map(|d| d as &dyn VirtioDevice),
            DeviceKind::Net => self.net.as_ref().map(|d| d as &dyn VirtioDevice),
        }
    }

    fn device_mut(&mut self, kind: DeviceKind) -> Option<&mut dyn VirtioDevice> {
        match kind {
            DeviceKind::Entropy => self.rng.as_mut().map(|d| d as &mut dyn VirtioDevice),
            DeviceKind::Block => self.blk.as_mut().map(|d| d as &mut dyn VirtioDevice),
            DeviceKind::Net => self.net.as_mut().map(|d| d as &mut dyn VirtioDevice),
        }
    }

    /// Runs a device's bring-up and stores it in its slot on success.
    ///
    /// A failed bring-up leaves the slot empty — later submissions surface
    /// `NoDevice` — and is logged once here.
    fn bind(&mut self, transport: Transport, kind: DeviceKind, dma: &dyn DmaAllocator) -> bool {
        let result = match kind {
            DeviceKind::Entropy => RngDevice::new(transport, dma).map(|d| self.rng = Some(d)),
            DeviceKind::Block => BlkDevice::new(transport, dma).map(|d| self.blk = Some(d)),
            DeviceKind::Net => NetDevice::new(transport, dma).map(|d| self.net = Some(d)),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("virtio: {kind} device bring-up failed: {err}");
                false
            }
        }
    }

    // -- Discovery ------------------------------------------------------------

    /// Scans PCI buses 0-3, slots 0-31, function 0 for VirtIO devices and
    /// brings up the first device of each kind.
    pub fn pci_scan(
        &mut self,
        cfg: &mut dyn PciConfigAccess,
        dma: &dyn DmaAllocator,
        irqs: &mut dyn IrqControl,
        scan: &PciScanConfig,
    ) {
        let mut allocator = BarAllocator::new(scan.bar_window);

        for bus in 0..4u8 {
            for slot in 0..32u8 {
                let addr = PciAddress::new(bus, slot, 0);
                if cfg.read_u16(addr, regs::VENDOR_ID) != VIRTIO_PCI_VENDOR {
                    continue;
                }
                let device_id = cfg.read_u16(addr, regs::DEVICE_ID);
                if !(0x1000..=0x107F).contains(&device_id) {
                    continue;
                }
                let Some(kind) = kind_for_device_type(virtio_device_type(device_id)) else {
                    continue;
                };
                if self.has_device(kind) {
                    continue;
                }

                log::info!("virtio: {kind} device {device_id:04x} at {addr}");

                let bars = allocator.assign(cfg, addr);
                config::enable_device(cfg, addr);

                let interrupt_pin = cfg.read_u8(addr, regs::INTERRUPT_PIN);
                let info = PciDeviceInfo {
                    address: addr,
                    vendor_id: VIRTIO_PCI_VENDOR,
                    device_id,
                    interrupt_pin,
                    bars,
                };

                // SAFETY: the BARs were just assigned out of the platform's
                // identity-mapped window.
                let transport = match unsafe { PciTransport::new(cfg, &info) } {
                    Ok(t) => t,
                    Err(err) => {
                        log::warn!("virtio: transport init failed at {addr}: {err}");
                        continue;
                    }
                };

                if !self.bind(Transport::Pci(transport), kind, dma) {
                    continue;
                }

                // Standard INTx swizzling maps (slot, pin) to a shared line.
                let pin = u32::from(interrupt_pin.clamp(1, 4));
                let vector = scan.irq_base + (u32::from(slot) + pin - 1) % 4;
                if irqs.register_irq(vector, kind).is_err() || irqs.enable_irq(vector).is_err() {
                    log::warn!("virtio: IRQ setup failed for {kind} at {addr}");
                }
            }
        }
    }

    /// Probes each candidate MMIO window and brings up the first device of
    /// each kind found.
    pub fn mmio_scan(
        &mut self,
        slots: &[MmioProbeSlot],
        dma: &dyn DmaAllocator,
        irqs: &mut dyn IrqControl,
    ) {
        for slot in slots {
            // SAFETY: the probe table lists mapped windows (caller contract).
            let Ok(transport) = (unsafe { MmioTransport::new(slot.base) }) else {
                continue;
            };
            let device_id = transport.device_id();
            if device_id == 0 {
                continue; // empty slot
            }
            let Some(kind) = kind_for_device_type(device_id) else {
                continue;
            };
            if self.has_device(kind) {
                continue;
            }

            log::info!("virtio: {kind} device at mmio {:#x}", slot.base);
            if !self.bind(Transport::Mmio(transport), kind, dma) {
                continue;
            }
            if irqs.register_irq(slot.irq, kind).is_err() || irqs.enable_irq(slot.irq).is_err() {
                log::warn!("virtio: IRQ setup failed for {kind} at mmio {:#x}", slot.base);
            }
        }
    }

    // -- Interrupt path -------------------------------------------------------

    /// The interrupt-context entry point: acknowledges the device and
    /// queues it for the next tick.
    ///
    /// Does exactly two things — transport ISR acknowledge and a ring
    /// enqueue — and must stay that way: no allocation, no completions, no
    /// used-ring walks in interrupt context. Returns `false` if the kind
    /// has no device or the ring was full (the work then coalesces into
    /// the next interrupt).
    pub fn irq_entry(&self, kind: DeviceKind) -> bool {
        let Some(device) = self.device(kind) else {
            return false;
        };
        device.ack_isr();
        self.ring.enqueue(kind)
    }

    // -- Base-context pump ----------------------------------------------------

    /// Drains the interrupt ring (bounded by a snapshot) and reaps each
    /// queued device's used rings. Called once per scheduler iteration.
    pub fn tick(&mut self, sink: &mut dyn WorkSink) {
        let overflows = self.ring.overflows();
        if overflows.wrapping_sub(self.overflow_warned) >= OVERFLOW_WARN_STEP {
            log::warn!("virtio: interrupt ring dropped {overflows} enqueues so far");
            self.overflow_warned = overflows;
        }

        // Devices that re-enqueue themselves while being processed are
        // deferred to the next tick by the snapshot bound.
        let end = self.ring.snapshot();
        while let Some(kind) = self.ring.dequeue_bounded(end) {
            if let Some(device) = self.device_mut(kind) {
                device.process_irq(sink);
            }
        }
    }

    // -- Submission -----------------------------------------------------------

    /// Routes a batch of submissions and cancellations.
    ///
    /// Cancellations are handled first and only ever affect the standing
    /// network receive; everything else is silently dropped. Submissions
    /// are routed by operation; work for an absent device kind completes
    /// immediately with `NoDevice`. Each touched queue is kicked once at
    /// the end of the batch.
    pub fn submit(
        &mut self,
        sink: &mut dyn WorkSink,
        submissions: Vec<Box<WorkItem>>,
        cancellations: &[WorkId],
    ) {
        for &id in cancellations {
            if let Some(net) = self.net.as_mut() {
                net.cancel_recv(sink, id);
            }
        }

        let mut touched = [false; 3];
        for mut work in submissions {
            let kind = work.device_kind();
            match self.device_mut(kind) {
                Some(device) => {
                    device.submit(sink, work);
                    touched[kind_index(kind)] = true;
                }
                None => {
                    work.state = WorkState::Completed;
                    sink.complete_work(work, WorkResult::NoDevice);
                }
            }
        }

        for kind in [DeviceKind::Entropy, DeviceKind::Block, DeviceKind::Net] {
            if touched[kind_index(kind)] {
                if let Some(device) = self.device_mut(kind) {
                    device.flush_notify();
                }
            }
        }
    }

    /// Re-arms one buffer of the standing network receive after the kernel
    /// has consumed it.
    pub fn net_buffer_release(&mut self, id: WorkId, buffer: usize) {
        if let Some(net) = self.net.as_mut() {
            net.buffer_release(id, buffer);
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_index(kind: DeviceKind) -> usize {
    match kind {
        DeviceKind::Entropy => 0,
        DeviceKind::Block => 1,
        DeviceKind::Net => 2,
    }
}
