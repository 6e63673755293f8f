//! VirtIO network device driver (virtio-net).
//!
//! Two virtqueues: receive (0) and transmit (1). Every frame on the wire
//! is preceded by the 12-byte VirtIO net header; this driver writes zeros
//! on transmit (no offloads are negotiated) and ignores the header on
//! receive, delivering only the frame payload length.
//!
//! Receive is *standing* work: the kernel submits one request carrying up
//! to [`NET_RECV_MAX_BUFFERS`] buffers, the driver posts one two-descriptor
//! chain per buffer (header slot + buffer) and pins the chain heads to
//! buffer slots for the life of the request. A completion hands the filled
//! buffer to the kernel; releasing it re-publishes the same pinned chain.
//! Cancelling the standing request stops re-arming; its descriptors stay
//! pinned (cancellation implies teardown) and late fills are dropped.

use alloc::boxed::Box;
use core::ptr;

use muon_driver_api::{
    DmaAllocator, DriverError, NetRecv, NetSend, WorkId, WorkItem, WorkKind, WorkResult,
    WorkSink, WorkState, NET_RECV_MAX_BUFFERS,
};

use super::{begin_init, create_queue, driver_ok, negotiate_features, VirtioDevice};
use crate::queue::{DescFlags, Virtqueue, NO_DESC, QUEUE_SIZE};
use crate::transport::{Transport, VirtioTransport};

/// Receive queue index.
const RX_QUEUE: u16 = 0;
/// Transmit queue index.
const TX_QUEUE: u16 = 1;

/// Size of the VirtIO net header prepended to every frame.
const NET_HDR_SIZE: u32 = 12;

/// Fallback MTU (Ethernet header + 1500-byte payload).
const DEFAULT_MTU: u16 = 1514;

/// VirtIO network header (VirtIO 1.0 form, with `num_buffers`).
///
/// Device-readable on transmit, device-written on receive. This driver
/// zeroes it for transmit and does not act on it for receive.
#[repr(C)]
#[derive(Clone, Copy)]
struct VirtioNetHdr {
    flags: u8,
    gso_type: u8,
    hdr_len: u16,
    gso_size: u16,
    csum_start: u16,
    csum_offset: u16,
    num_buffers: u16,
}

const ZERO_HDR: VirtioNetHdr = VirtioNetHdr {
    flags: 0,
    gso_type: 0,
    hdr_len: 0,
    gso_size: 0,
    csum_start: 0,
    csum_offset: 0,
    num_buffers: 0,
};

/// Per-descriptor net headers for one queue, keyed by the header
/// descriptor's index. DMA-visible through the identity map.
#[repr(C)]
struct NetArena {
    headers: [VirtioNetHdr; QUEUE_SIZE],
}

impl NetArena {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            headers: [ZERO_HDR; QUEUE_SIZE],
        })
    }

    fn header_phys(&self, idx: u16) -> u64 {
        ptr::from_ref(&self.headers[idx as usize]) as u64
    }
}

/// Lifecycle of one pinned receive buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSlot {
    /// Chain published on the available ring; the device may fill it.
    Published,
    /// Filled buffer delivered to the kernel; awaiting release.
    HandedOut,
}

/// A VirtIO network device.
pub struct NetDevice {
    transport: Transport,
    rx: Virtqueue,
    tx: Virtqueue,
    rx_arena: Box<NetArena>,
    tx_arena: Box<NetArena>,
    /// The standing receive request, parked here across completions.
    rx_work: Option<Box<WorkItem>>,
    /// Pinned chain head per receive buffer; constant for the life of the
    /// standing request.
    rx_heads: [u16; NET_RECV_MAX_BUFFERS],
    /// Number of buffers in the standing request.
    rx_count: usize,
    /// Per-buffer slot state.
    rx_state: [RxSlot; NET_RECV_MAX_BUFFERS],
    /// In-flight transmits, keyed by chain-head descriptor index.
    tx_active: [Option<Box<WorkItem>>; QUEUE_SIZE],
    rx_pending_notify: bool,
    tx_pending_notify: bool,
    /// MAC address from device config.
    mac: [u8; 6],
    /// MTU from device config (Ethernet frame size).
    mtu: u16,
}

impl NetDevice {
    /// Brings up a network device on `transport`.
    pub fn new(mut transport: Transport, dma: &dyn DmaAllocator) -> Result<Self, DriverError> {
        begin_init(&transport);

        // Config space: MAC at 0-5, status at 6, MTU at 10.
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = transport.config_read_u8(i as u32).unwrap_or(0);
        }
        let mtu = match transport.config_read_u16(10).unwrap_or(0) {
            0 => DEFAULT_MTU,
            // The device reports the IP MTU; add the Ethernet header.
            n => n.saturating_add(14),
        };

        negotiate_features(&transport)?;
        let rx = create_queue(&mut transport, dma, RX_QUEUE)?;
        let tx = create_queue(&mut transport, dma, TX_QUEUE)?;
        driver_ok(&transport)?;

        log::info!(
            "virtio-net: ready, mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, mtu {mtu}",
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5]
        );
        Ok(Self {
            transport,
            rx,
            tx,
            rx_arena: NetArena::new_boxed(),
            tx_arena: NetArena::new_boxed(),
            rx_work: None,
            rx_heads: [NO_DESC; NET_RECV_MAX_BUFFERS],
            rx_count: 0,
            rx_state: [RxSlot::Published; NET_RECV_MAX_BUFFERS],
            tx_active: [const { None }; QUEUE_SIZE],
            rx_pending_notify: false,
            tx_pending_notify: false,
            mac,
            mtu,
        })
    }

    /// Device MAC address.
    #[must_use]
    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Maximum transmission unit (Ethernet frame size).
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    #[cfg(test)]
    pub(crate) fn rx_queue(&self) -> &Virtqueue {
        &self.rx
    }

    #[cfg(test)]
    pub(crate) fn tx_queue(&self) -> &Virtqueue {
        &self.tx
    }

    #[cfg(test)]
    pub(crate) fn pinned_heads(&self) -> [u16; NET_RECV_MAX_BUFFERS] {
        self.rx_heads
    }

    /// Posts the standing receive request: one pinned two-descriptor chain
    /// per buffer, all published before a single doorbell kick.
    fn submit_recv(&mut self, sink: &mut dyn WorkSink, mut work: Box<WorkItem>, recv: NetRecv) {
        if recv.buffer_count == 0
            || recv.buffer_count > NET_RECV_MAX_BUFFERS
            || self.rx_work.is_some()
        {
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::Invalid);
            return;
        }

        // Allocate every chain before publishing any of them, so a partial
        // allocation can be rolled back without the device seeing a thing.
        let mut heads = [NO_DESC; NET_RECV_MAX_BUFFERS];
        let mut data_descs = [NO_DESC; NET_RECV_MAX_BUFFERS];
        for i in 0..recv.buffer_count {
            let hdr = self.rx.alloc_desc();
            let data = self.rx.alloc_desc();
            match (hdr, data) {
                (Some(h), Some(d)) => {
                    heads[i] = h;
                    data_descs[i] = d;
                }
                (hdr, data) => {
                    if let Some(h) = hdr {
                        self.rx.free_desc(h);
                    }
                    if let Some(d) = data {
                        self.rx.free_desc(d);
                    }
                    for j in 0..i {
                        self.rx.free_desc(heads[j]);
                        self.rx.free_desc(data_descs[j]);
                    }
                    work.state = WorkState::Completed;
                    sink.complete_work(work, WorkResult::NoSpace);
                    return;
                }
            }
        }

        for i in 0..recv.buffer_count {
            let (head, data) = (heads[i], data_descs[i]);
            let buf = recv.buffers[i];
            // The device writes both the header and the frame.
            self.rx
                .set_desc(head, self.rx_arena.header_phys(head), NET_HDR_SIZE, DescFlags::WRITE);
            self.rx.link_desc(head, data);
            self.rx.set_desc(data, buf.addr, buf.len, DescFlags::WRITE);

            self.rx_heads[i] = head;
            self.rx_state[i] = RxSlot::Published;
            self.rx.publish(head);
        }

        self.rx_count = recv.buffer_count;
        work.state = WorkState::Live;
        self.rx_work = Some(work);
        self.rx_pending_notify = true;
    }

    /// Queues one transmit: header descriptor plus payload descriptor, both
    /// device-readable.
    fn submit_send(&mut self, sink: &mut dyn WorkSink, mut work: Box<WorkItem>, send: NetSend) {
        let Some(head) = self.tx.alloc_desc() else {
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::NoSpace);
            return;
        };
        let Some(data) = self.tx.alloc_desc() else {
            self.tx.free_desc(head);
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::NoSpace);
            return;
        };

        // No offloads: the wire header is all zeros.
        self.tx_arena.headers[head as usize] = ZERO_HDR;

        self.tx
            .set_desc(head, self.tx_arena.header_phys(head), NET_HDR_SIZE, DescFlags::empty());
        self.tx.link_desc(head, data);
        self.tx.set_desc(data, send.addr, send.len, DescFlags::empty());

        work.state = WorkState::Live;
        self.tx_active[head as usize] = Some(work);
        self.tx.publish(head);
        self.tx_pending_notify = true;
    }

    /// Cancels the standing receive if `id` names it; anything else is
    /// silently dropped. The pinned descriptors are *not* returned to the
    /// device — cancellation implies teardown or reconfiguration.
    pub(crate) fn cancel_recv(&mut self, sink: &mut dyn WorkSink, id: WorkId) {
        if let Some(mut work) = self.rx_work.take_if(|w| w.id == id) {
            work.state = WorkState::Completed;
            sink.cancel_work(work);
        }
    }

    /// Re-arms one released receive buffer: re-publishes its pinned chain
    /// head and kicks the device.
    pub(crate) fn buffer_release(&mut self, id: WorkId, buffer: usize) {
        if !self.rx_work.as_ref().is_some_and(|w| w.id == id) {
            return;
        }
        if buffer >= self.rx_count || self.rx_state[buffer] != RxSlot::HandedOut {
            return;
        }

        // The chain's descriptors are untouched since allocation; only the
        // ring entry needs re-publishing.
        self.rx_state[buffer] = RxSlot::Published;
        self.rx.publish(self.rx_heads[buffer]);
        self.transport.notify(RX_QUEUE);
    }
}

impl VirtioDevice for NetDevice {
    fn ack_isr(&self) {
        let isr = self.transport.read_isr();
        self.transport.ack_isr(isr);
    }

    fn submit(&mut self, sink: &mut dyn WorkSink, mut work: Box<WorkItem>) {
        match work.kind {
            WorkKind::NetRecv(recv) => self.submit_recv(sink, work, recv),
            WorkKind::NetSend(send) => self.submit_send(sink, work, send),
            _ => {
                work.state = WorkState::Completed;
                sink.complete_work(work, WorkResult::Invalid);
            }
        }
    }

    fn process_irq(&mut self, sink: &mut dyn WorkSink) {
        // Receive completions: deliver filled buffers of the standing
        // request; fills for a cancelled request are dropped silently.
        while let Some((head, len)) = self.rx.get_used() {
            let slot = if self.rx_work.is_some() {
                self.rx_heads[..self.rx_count]
                    .iter()
                    .position(|&h| h == head)
                    .filter(|&i| self.rx_state[i] == RxSlot::Published)
            } else {
                None
            };

            let Some(i) = slot else {
                log::debug!("virtio-net: dropping fill for dead receive chain {head}");
                continue;
            };

            self.rx_state[i] = RxSlot::HandedOut;
            let payload = len.saturating_sub(NET_HDR_SIZE);
            if let Some(work) = self.rx_work.as_mut() {
                sink.rx_deliver(work, i, payload);
            }
        }

        // Transmit completions.
        while let Some((head, _len)) = self.tx.get_used() {
            let Some(mut work) = self
                .tx_active
                .get_mut(head as usize)
                .and_then(Option::take)
            else {
                log::debug!("virtio-net: used entry for untracked transmit {head}");
                continue;
            };
            self.tx.free_chain(head);
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::Ok);
        }
    }

    fn flush_notify(&mut self) {
        if self.rx_pending_notify {
            self.rx_pending_notify = false;
            self.transport.notify(RX_QUEUE);
        }
        if self.tx_pending_notify {
            self.tx_pending_notify = false;
            self.transport.notify(TX_QUEUE);
        }
    }
}
