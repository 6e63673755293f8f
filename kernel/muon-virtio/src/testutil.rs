//! Shared fixtures for host tests.
//!
//! Everything here stands in for hardware: a DMA arena backed by the host
//! allocator (identity map: pointer value == bus address), a device model
//! that plays the device side of the split-ring protocol, a passive MMIO
//! register window, a PCI configuration space with a capability list and
//! BAR-sizing emulation, and a recording [`WorkSink`].

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;

use muon_driver_api::{
    DeviceKind, DmaAllocator, DriverError, IrqControl, PciAddress, PciConfigAccess, WorkId,
    WorkItem, WorkResult, WorkSink, FRAME_SIZE,
};

use crate::queue::{DescFlags, VirtqDesc, Virtqueue};

// ---------------------------------------------------------------------------
// DMA arena
// ---------------------------------------------------------------------------

/// Frame allocator over the host heap. Frames are 4 KiB aligned and zeroed;
/// everything is freed when the arena drops, so tests must keep the arena
/// alive for as long as any queue or device uses its memory.
pub struct DmaArena {
    blocks: RefCell<Vec<(usize, Layout)>>,
    /// When set, allocations fail with `NoMemory` (for bring-up error paths).
    pub fail: RefCell<bool>,
}

impl DmaArena {
    pub fn new() -> Self {
        Self {
            blocks: RefCell::new(Vec::new()),
            fail: RefCell::new(false),
        }
    }

    /// Allocates a raw aligned buffer that is *not* a DMA frame run (for
    /// request payload buffers with specific alignment).
    pub fn buffer(&self, len: usize, align: usize) -> u64 {
        let layout = Layout::from_size_align(len.max(1), align).unwrap();
        // SAFETY: layout has non-zero size.
        let p = unsafe { alloc_zeroed(layout) };
        assert!(!p.is_null());
        self.blocks.borrow_mut().push((p as usize, layout));
        p as u64
    }
}

impl DmaAllocator for DmaArena {
    fn alloc_frames(&self, count: usize) -> Result<u64, DriverError> {
        if *self.fail.borrow() {
            return Err(DriverError::NoMemory);
        }
        let layout = Layout::from_size_align(count * FRAME_SIZE, FRAME_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let p = unsafe { alloc_zeroed(layout) };
        assert!(!p.is_null());
        self.blocks.borrow_mut().push((p as usize, layout));
        Ok(p as u64)
    }

    unsafe fn free_frames(&self, _phys_base: u64, _count: usize) {
        // Arena-owned; everything is released on drop.
    }
}

impl Drop for DmaArena {
    fn drop(&mut self) {
        for (p, layout) in self.blocks.borrow_mut().drain(..) {
            // SAFETY: allocated by this arena with the stored layout.
            unsafe { dealloc(p as *mut u8, layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// A [`WorkSink`] that records everything the stack hands back.
#[derive(Default)]
pub struct MockSink {
    pub completed: Vec<(Box<WorkItem>, WorkResult)>,
    pub delivered: Vec<(WorkId, usize, u32)>,
    pub cancelled: Vec<Box<WorkItem>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of the only completion recorded so far.
    pub fn single_result(&self) -> WorkResult {
        assert_eq!(self.completed.len(), 1, "expected exactly one completion");
        self.completed[0].1
    }
}

impl WorkSink for MockSink {
    fn complete_work(&mut self, work: Box<WorkItem>, result: WorkResult) {
        self.completed.push((work, result));
    }

    fn rx_deliver(&mut self, work: &mut WorkItem, buffer_index: usize, len: u32) {
        self.delivered.push((work.id, buffer_index, len));
    }

    fn cancel_work(&mut self, work: Box<WorkItem>) {
        self.cancelled.push(work);
    }
}

// ---------------------------------------------------------------------------
// Recording IRQ controller
// ---------------------------------------------------------------------------

/// An [`IrqControl`] that records registrations.
#[derive(Default)]
pub struct MockIrqs {
    pub registered: Vec<(u32, DeviceKind)>,
    pub enabled: Vec<u32>,
}

impl MockIrqs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IrqControl for MockIrqs {
    fn register_irq(&mut self, vector: u32, kind: DeviceKind) -> Result<(), DriverError> {
        self.registered.push((vector, kind));
        Ok(())
    }

    fn enable_irq(&mut self, vector: u32) -> Result<(), DriverError> {
        self.enabled.push(vector);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device model (the device side of a split ring)
// ---------------------------------------------------------------------------

/// Plays the device for one virtqueue: consumes the available ring, lets a
/// closure act on each descriptor chain, and publishes used entries.
pub struct VqModel {
    desc: usize,
    avail: usize,
    used: usize,
    size: u16,
    last_avail: u16,
    used_idx: u16,
}

impl VqModel {
    pub fn attach(vq: &Virtqueue) -> Self {
        Self {
            desc: vq.desc_phys() as usize,
            avail: vq.avail_phys() as usize,
            used: vq.used_phys() as usize,
            size: vq.size(),
            last_avail: 0,
            used_idx: 0,
        }
    }

    pub fn avail_idx(&self) -> u16 {
        // SAFETY: test-owned queue memory.
        unsafe { ptr::read_volatile((self.avail + 2) as *const u16) }
    }

    /// Pops the next published chain head, if any.
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.last_avail == self.avail_idx() {
            return None;
        }
        let slot = (self.last_avail % self.size) as usize;
        // SAFETY: test-owned queue memory.
        let head = unsafe { ptr::read_volatile((self.avail + 4 + slot * 2) as *const u16) };
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    /// Reads the descriptor chain starting at `head`.
    pub fn chain(&self, head: u16) -> Vec<VirtqDesc> {
        let mut out = Vec::new();
        let mut idx = head;
        loop {
            // SAFETY: test-owned queue memory.
            let d = unsafe { ptr::read_volatile((self.desc + idx as usize * 16) as *const VirtqDesc) };
            out.push(d);
            if d.flags & DescFlags::NEXT.bits() == 0 {
                break;
            }
            idx = d.next;
        }
        out
    }

    /// Publishes one used entry.
    pub fn push_used(&mut self, head: u16, len: u32) {
        let slot = (self.used_idx % self.size) as usize;
        // SAFETY: test-owned queue memory.
        unsafe {
            ptr::write_volatile((self.used + 4 + slot * 8) as *mut u32, u32::from(head));
            ptr::write_volatile((self.used + 4 + slot * 8 + 4) as *mut u32, len);
        }
        self.used_idx = self.used_idx.wrapping_add(1);
        // SAFETY: test-owned queue memory.
        unsafe { ptr::write_volatile((self.used + 2) as *mut u16, self.used_idx) };
    }

    /// Services every pending chain: `f(head, chain) -> bytes_written`.
    /// Returns the number of chains serviced.
    pub fn service<F: FnMut(u16, &[VirtqDesc]) -> u32>(&mut self, mut f: F) -> usize {
        let mut n = 0;
        while let Some(head) = self.pop_avail() {
            let chain = self.chain(head);
            let written = f(head, &chain);
            self.push_used(head, written);
            n += 1;
        }
        n
    }
}

/// Fills every device-writable descriptor of `chain` with `byte` and
/// returns the total number of bytes "written".
pub fn fill_writable(chain: &[VirtqDesc], byte: u8) -> u32 {
    let mut written = 0;
    for d in chain {
        if d.flags & DescFlags::WRITE.bits() != 0 {
            // SAFETY: descriptors in tests point at arena-owned buffers.
            unsafe { ptr::write_bytes(d.addr as usize as *mut u8, byte, d.len as usize) };
            written += d.len;
        }
    }
    written
}

// ---------------------------------------------------------------------------
// MMIO register window
// ---------------------------------------------------------------------------

/// A passive virtio-mmio register window: 0x200 bytes of registers plus the
/// device configuration space at +0x100.
///
/// Passive means reads return the last value written; the window is seeded
/// so the driver's probe/bring-up sequence sees a plausible device. Version
/// 1 (legacy) windows work end-to-end this way; version 2 windows are used
/// for transport-level tests where the test resets `QUEUE_READY` between
/// queue setups.
pub struct FakeMmio {
    mem: Box<[u32; 0xC0]>,
}

/// Device features value seeded in fake windows: bit 0 set, which reads as
/// an ignorable device feature on select 0 and as VERSION_1 on select 1.
pub const FAKE_FEATURES: u32 = 1;

impl FakeMmio {
    pub fn new(version: u32, device_id: u32, queue_max: u32) -> Self {
        let mut mmio = Self {
            mem: Box::new([0u32; 0xC0]),
        };
        mmio.write32(0x000, 0x7472_6976); // magic "virt"
        mmio.write32(0x004, version);
        mmio.write32(0x008, device_id);
        mmio.write32(0x00C, 0x554D_4F4E); // vendor
        mmio.write32(0x010, FAKE_FEATURES);
        mmio.write32(0x034, queue_max);
        mmio
    }

    pub fn base(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    pub fn read32(&self, offset: usize) -> u32 {
        // SAFETY: offset is within the window in all tests.
        unsafe { ptr::read_volatile(self.mem.as_ptr().add(offset / 4)) }
    }

    pub fn write32(&mut self, offset: usize, value: u32) {
        // SAFETY: offset is within the window in all tests.
        unsafe { ptr::write_volatile(self.mem.as_mut_ptr().add(offset / 4), value) };
    }

    /// Writes a device-config byte (config space starts at +0x100).
    pub fn write_config_bytes(&mut self, offset: usize, bytes: &[u8]) {
        let base = self.mem.as_mut_ptr().cast::<u8>();
        for (i, &b) in bytes.iter().enumerate() {
            // SAFETY: config offsets stay within the window in all tests.
            unsafe { ptr::write_volatile(base.add(0x100 + offset + i), b) };
        }
    }
}

// ---------------------------------------------------------------------------
// PCI configuration space
// ---------------------------------------------------------------------------

/// Kinds of BARs a fake device can expose.
#[derive(Clone, Copy)]
pub enum FakeBar {
    None,
    Mem32 { size: u32 },
    Io { size: u32 },
}

/// One emulated PCI function: 256 bytes of config space with BAR-sizing
/// behavior (writing all-ones latches the size mask until the next write).
pub struct FakePciFunction {
    config: [u8; 256],
    bars: [FakeBar; 6],
    sizing: [bool; 6],
}

impl FakePciFunction {
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut f = Self {
            config: [0; 256],
            bars: [FakeBar::None; 6],
            sizing: [false; 6],
        };
        f.config[0..2].copy_from_slice(&vendor.to_le_bytes());
        f.config[2..4].copy_from_slice(&device.to_le_bytes());
        f
    }

    pub fn set_bar(&mut self, index: usize, bar: FakeBar) {
        self.bars[index] = bar;
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.config[0x3D] = pin;
    }

    /// Appends a VirtIO vendor capability; returns its config offset.
    ///
    /// The capability chain must be built in order; `prev_offset` is the
    /// offset returned by the previous call (or 0 for the first).
    pub fn add_virtio_cap(
        &mut self,
        prev_offset: u8,
        at: u8,
        cfg_type: u8,
        bar: u8,
        offset: u32,
        length: u32,
        notify_multiplier: Option<u32>,
    ) -> u8 {
        // Mark the capability list as present and link the chain.
        self.config[0x06] |= 0x10; // status bit 4
        if prev_offset == 0 {
            self.config[0x34] = at;
        } else {
            self.config[prev_offset as usize + 1] = at;
        }
        let o = at as usize;
        self.config[o] = 0x09; // vendor-specific capability
        self.config[o + 1] = 0; // end of chain until linked further
        self.config[o + 2] = if notify_multiplier.is_some() { 20 } else { 16 };
        self.config[o + 3] = cfg_type;
        self.config[o + 4] = bar;
        self.config[o + 8..o + 12].copy_from_slice(&offset.to_le_bytes());
        self.config[o + 12..o + 16].copy_from_slice(&length.to_le_bytes());
        if let Some(mult) = notify_multiplier {
            self.config[o + 16..o + 20].copy_from_slice(&mult.to_le_bytes());
        }
        at
    }

    fn read_u32(&self, offset: u8) -> u32 {
        let o = offset as usize & 0xFC;
        if (0x10..0x28).contains(&o) {
            let idx = (o - 0x10) / 4;
            if self.sizing[idx] {
                return match self.bars[idx] {
                    FakeBar::None => 0,
                    FakeBar::Mem32 { size } => !(size - 1),
                    FakeBar::Io { size } => !(size - 1) | 0x1,
                };
            }
            match self.bars[idx] {
                FakeBar::None => return 0,
                FakeBar::Io { .. } => {
                    let raw = u32::from_le_bytes(self.config[o..o + 4].try_into().unwrap());
                    return raw | 0x1;
                }
                FakeBar::Mem32 { .. } => {
                    // fall through to stored value (type bits zero = mem32)
                }
            }
        }
        u32::from_le_bytes(self.config[o..o + 4].try_into().unwrap())
    }

    fn write_u32(&mut self, offset: u8, value: u32) {
        let o = offset as usize & 0xFC;
        if (0x10..0x28).contains(&o) {
            let idx = (o - 0x10) / 4;
            if value == 0xFFFF_FFFF {
                self.sizing[idx] = true;
                return;
            }
            self.sizing[idx] = false;
        }
        self.config[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// A bus of fake PCI functions implementing [`PciConfigAccess`].
#[derive(Default)]
pub struct FakePciHost {
    functions: HashMap<(u8, u8, u8), FakePciFunction>,
}

impl FakePciHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: PciAddress, function: FakePciFunction) {
        self.functions
            .insert((addr.bus, addr.device, addr.function), function);
    }

    pub fn function(&self, addr: PciAddress) -> &FakePciFunction {
        &self.functions[&(addr.bus, addr.device, addr.function)]
    }
}

impl PciConfigAccess for FakePciHost {
    fn read_u32(&self, addr: PciAddress, offset: u8) -> u32 {
        match self.functions.get(&(addr.bus, addr.device, addr.function)) {
            Some(f) => f.read_u32(offset),
            None => 0xFFFF_FFFF,
        }
    }

    fn write_u32(&mut self, addr: PciAddress, offset: u8, value: u32) {
        if let Some(f) = self
            .functions
            .get_mut(&(addr.bus, addr.device, addr.function))
        {
            f.write_u32(offset, value);
        }
    }
}

/// Builds a modern VirtIO PCI function whose four config windows live in a
/// single 4 KiB memory BAR 0 at the conventional offsets.
pub fn virtio_pci_function(device_id: u16, interrupt_pin: u8) -> FakePciFunction {
    let mut f = FakePciFunction::new(0x1AF4, device_id);
    f.set_bar(0, FakeBar::Mem32 { size: 0x1000 });
    f.set_interrupt_pin(interrupt_pin);
    let c = f.add_virtio_cap(0, 0x40, 1, 0, PCI_WINDOW_COMMON, 0x100, None);
    let c = f.add_virtio_cap(c, 0x54, 2, 0, PCI_WINDOW_NOTIFY, 0x100, Some(4));
    let c = f.add_virtio_cap(c, 0x6C, 3, 0, PCI_WINDOW_ISR, 0x20, None);
    f.add_virtio_cap(c, 0x80, 4, 0, PCI_WINDOW_DEVICE, 0x100, None);
    f
}

/// Offsets of the four config windows inside the fake device's BAR 0.
pub const PCI_WINDOW_COMMON: u32 = 0x000;
pub const PCI_WINDOW_NOTIFY: u32 = 0x400;
pub const PCI_WINDOW_ISR: u32 = 0x800;
pub const PCI_WINDOW_DEVICE: u32 = 0xC00;
