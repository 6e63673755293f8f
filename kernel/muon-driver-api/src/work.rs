//! Kernel work items and the completion contract.
//!
//! The kernel talks to the device stack in terms of [`WorkItem`]s: one
//! heap-allocated request object per operation, handed over at submission
//! and returned through a [`WorkSink`] when the device finishes. While a
//! request is in flight the stack owns the box; the kernel gets it back in
//! `complete_work` (one-shot operations) or `cancel_work` (cancelled
//! standing work). Standing receive work is the exception: it stays parked
//! in the network device across many per-buffer completions, which are
//! delivered by mutable borrow through [`WorkSink::rx_deliver`].

use alloc::boxed::Box;
use core::fmt;

/// The device personalities the stack can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// VirtIO entropy source (virtio-rng).
    Entropy,
    /// VirtIO block device (virtio-blk).
    Block,
    /// VirtIO network device (virtio-net).
    Net,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entropy => f.write_str("entropy"),
            Self::Block => f.write_str("block"),
            Self::Net => f.write_str("net"),
        }
    }
}

/// Kernel-assigned identity of a work item.
///
/// Used to name requests across the submission boundary (most importantly
/// for cancellation and receive-buffer release, where the kernel no longer
/// holds the request itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId(pub u64);

/// Lifecycle of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Accepted by the kernel, not yet on a device queue.
    Queued,
    /// Descriptors published; the device may be processing it.
    Live,
    /// Finished (successfully or not); owned by the kernel again.
    Completed,
}

/// Outcome of a completed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    /// The operation completed successfully.
    Ok,
    /// Descriptor allocation failed; the queue is momentarily full. Retry.
    NoSpace,
    /// The request violates a precondition (caller bug).
    Invalid,
    /// The device reported an error.
    IoError,
    /// No device of the required kind is bound.
    NoDevice,
}

impl fmt::Display for WorkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::NoSpace => f.write_str("queue full"),
            Self::Invalid => f.write_str("invalid request"),
            Self::IoError => f.write_str("device I/O error"),
            Self::NoDevice => f.write_str("no such device"),
        }
    }
}

/// Maximum buffers carried by one standing receive request.
pub const NET_RECV_MAX_BUFFERS: usize = 32;

/// Maximum scatter-gather segments in a block request.
pub const BLOCK_MAX_SEGMENTS: usize = 4;

/// One scatter-gather segment of a block request.
///
/// `addr` is a bus-visible (identity-mapped) physical address; block data
/// segments must be 4 KiB aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSegment {
    /// Physical address of the segment.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// Payload of an entropy read.
#[derive(Debug, Clone, Copy)]
pub struct RngRead {
    /// Physical address of the output buffer the device fills.
    pub buf: u64,
    /// Requested number of bytes.
    pub len: u32,
    /// Bytes the device actually wrote. Set on completion.
    pub filled: u32,
}

/// Payload of a block read or write.
#[derive(Debug, Clone, Copy)]
pub struct BlockIo {
    /// Starting sector (512-byte units, per the block device ABI).
    pub sector: u64,
    /// Number of sectors covered by the segments.
    pub num_sectors: u32,
    /// Scatter-gather segments. Only `segment_count` entries are valid.
    pub segments: [BlockSegment; BLOCK_MAX_SEGMENTS],
    /// Number of valid segments.
    pub segment_count: usize,
    /// Sectors actually transferred; either 0 or `num_sectors`.
    pub completed_sectors: u32,
}

/// One receive buffer of a standing receive request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetRxBuffer {
    /// Physical address of the buffer the device fills with a packet.
    pub addr: u64,
    /// Capacity of the buffer in bytes.
    pub len: u32,
}

/// Payload of a standing network receive.
#[derive(Debug, Clone, Copy)]
pub struct NetRecv {
    /// Receive buffers. Only `buffer_count` entries are valid.
    pub buffers: [NetRxBuffer; NET_RECV_MAX_BUFFERS],
    /// Number of valid buffers.
    pub buffer_count: usize,
}

/// Payload of a network transmit.
#[derive(Debug, Clone, Copy)]
pub struct NetSend {
    /// Physical address of the frame to transmit.
    pub addr: u64,
    /// Frame length in bytes.
    pub len: u32,
}

/// Operation tag plus per-operation payload.
#[derive(Debug, Clone, Copy)]
pub enum WorkKind {
    /// Fill a buffer with entropy.
    RngRead(RngRead),
    /// Read sectors from the block device.
    BlockRead(BlockIo),
    /// Write sectors to the block device.
    BlockWrite(BlockIo),
    /// Flush the block device's write cache.
    BlockFlush,
    /// Standing receive: post buffers, receive repeated completions.
    NetRecv(NetRecv),
    /// Transmit one frame.
    NetSend(NetSend),
}

/// A kernel request routed to a device.
#[derive(Debug)]
pub struct WorkItem {
    /// Kernel-assigned identity.
    pub id: WorkId,
    /// Lifecycle state.
    pub state: WorkState,
    /// Operation and payload.
    pub kind: WorkKind,
}

impl WorkItem {
    /// Creates a work item in the `Queued` state.
    #[must_use]
    pub fn new(id: WorkId, kind: WorkKind) -> Self {
        Self {
            id,
            state: WorkState::Queued,
            kind,
        }
    }

    /// The device kind this work is routed to.
    #[must_use]
    pub fn device_kind(&self) -> DeviceKind {
        match self.kind {
            WorkKind::RngRead(_) => DeviceKind::Entropy,
            WorkKind::BlockRead(_) | WorkKind::BlockWrite(_) | WorkKind::BlockFlush => {
                DeviceKind::Block
            }
            WorkKind::NetRecv(_) | WorkKind::NetSend(_) => DeviceKind::Net,
        }
    }

    /// Builds an entropy read request.
    #[must_use]
    pub fn rng_read(id: WorkId, buf: u64, len: u32) -> Self {
        Self::new(
            id,
            WorkKind::RngRead(RngRead {
                buf,
                len,
                filled: 0,
            }),
        )
    }

    /// Builds a single-segment block read request.
    #[must_use]
    pub fn block_read(id: WorkId, sector: u64, num_sectors: u32, segment: BlockSegment) -> Self {
        Self::new(id, WorkKind::BlockRead(Self::block_io(sector, num_sectors, segment)))
    }

    /// Builds a single-segment block write request.
    #[must_use]
    pub fn block_write(id: WorkId, sector: u64, num_sectors: u32, segment: BlockSegment) -> Self {
        Self::new(id, WorkKind::BlockWrite(Self::block_io(sector, num_sectors, segment)))
    }

    /// Builds a block flush request.
    #[must_use]
    pub fn block_flush(id: WorkId) -> Self {
        Self::new(id, WorkKind::BlockFlush)
    }

    /// Builds a standing receive request over the first
    /// [`NET_RECV_MAX_BUFFERS`] entries of `buffers`.
    #[must_use]
    pub fn net_recv(id: WorkId, buffers: &[NetRxBuffer]) -> Self {
        let count = buffers.len().min(NET_RECV_MAX_BUFFERS);
        let mut fixed = [NetRxBuffer::default(); NET_RECV_MAX_BUFFERS];
        fixed[..count].copy_from_slice(&buffers[..count]);
        Self::new(
            id,
            WorkKind::NetRecv(NetRecv {
                buffers: fixed,
                buffer_count: count,
            }),
        )
    }

    /// Builds a transmit request.
    #[must_use]
    pub fn net_send(id: WorkId, addr: u64, len: u32) -> Self {
        Self::new(id, WorkKind::NetSend(NetSend { addr, len }))
    }

    fn block_io(sector: u64, num_sectors: u32, segment: BlockSegment) -> BlockIo {
        let mut segments = [BlockSegment::default(); BLOCK_MAX_SEGMENTS];
        segments[0] = segment;
        BlockIo {
            sector,
            num_sectors,
            segments,
            segment_count: 1,
            completed_sectors: 0,
        }
    }
}

/// The kernel's completion surface, consumed by the device stack.
///
/// All errors are values delivered here; the stack itself never panics on
/// the request path.
pub trait WorkSink {
    /// Returns a finished one-shot work item to the kernel.
    fn complete_work(&mut self, work: Box<WorkItem>, result: WorkResult);

    /// Delivers one filled buffer of a standing receive.
    ///
    /// `len` is the packet length (the VirtIO net header has already been
    /// stripped). The work item stays with the device; the kernel re-arms
    /// the buffer later via the platform's `net_buffer_release`.
    fn rx_deliver(&mut self, work: &mut WorkItem, buffer_index: usize, len: u32);

    /// Returns a cancelled standing work item to the kernel.
    fn cancel_work(&mut self, work: Box<WorkItem>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_routing() {
        let rng = WorkItem::rng_read(WorkId(1), 0x1000, 16);
        assert_eq!(rng.device_kind(), DeviceKind::Entropy);

        let flush = WorkItem::block_flush(WorkId(2));
        assert_eq!(flush.device_kind(), DeviceKind::Block);

        let send = WorkItem::net_send(WorkId(3), 0x2000, 60);
        assert_eq!(send.device_kind(), DeviceKind::Net);
    }

    #[test]
    fn new_work_is_queued() {
        let w = WorkItem::block_flush(WorkId(9));
        assert_eq!(w.state, WorkState::Queued);
    }

    #[test]
    fn net_recv_truncates_to_limit() {
        let bufs = [NetRxBuffer { addr: 0x1000, len: 1514 }; 40];
        let w = WorkItem::net_recv(WorkId(4), &bufs);
        match w.kind {
            WorkKind::NetRecv(ref rx) => assert_eq!(rx.buffer_count, NET_RECV_MAX_BUFFERS),
            _ => unreachable!(),
        }
    }

    #[test]
    fn result_display() {
        assert_eq!(format!("{}", WorkResult::NoSpace), "queue full");
        assert_eq!(format!("{}", WorkResult::NoDevice), "no such device");
    }
}
