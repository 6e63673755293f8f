//! VirtIO block device driver (virtio-blk).
//!
//! Operates on the baseline feature set: no feature bits are negotiated,
//! and configuration fields gated by feature bits are read unconditionally
//! but trusted only when their zero defaults are sane (block size falls
//! back to 512, segment maximum to 1).
//!
//! Every read/write request is a three-descriptor chain — header, data,
//! status — and a flush omits the data descriptor. Headers and status
//! bytes live in a per-descriptor arena keyed by the chain-head index, so
//! the completion path can inspect the status byte without any dynamic
//! allocation.

use alloc::boxed::Box;
use core::ptr;

use muon_driver_api::{
    BlockIo, DmaAllocator, DriverError, WorkItem, WorkKind, WorkResult, WorkSink, WorkState,
};

use super::{begin_init, create_queue, driver_ok, negotiate_features, VirtioDevice};
use crate::queue::{DescFlags, Virtqueue, QUEUE_SIZE};
use crate::transport::{Transport, VirtioTransport};

/// The block device's single request queue.
const REQUEST_QUEUE: u16 = 0;

// -- VirtIO block request ABI -------------------------------------------------

/// Request type: read.
const VIRTIO_BLK_T_IN: u32 = 0;
/// Request type: write.
const VIRTIO_BLK_T_OUT: u32 = 1;
/// Request type: flush the write cache.
const VIRTIO_BLK_T_FLUSH: u32 = 4;

/// Status byte: success.
const VIRTIO_BLK_S_OK: u8 = 0;
/// Status byte: device I/O error.
const VIRTIO_BLK_S_IOERR: u8 = 1;
/// Status byte: request type unsupported.
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Status byte value while a request is in flight (no valid status).
const STATUS_PENDING: u8 = 0xFF;

/// Required alignment of data buffers.
const DATA_ALIGN: u64 = 4096;

/// Fallback sector size when the device reports none.
const DEFAULT_BLOCK_SIZE: u32 = 512;

/// VirtIO block request header, device-readable.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlkReqHeader {
    /// Request type.
    type_: u32,
    /// Reserved.
    reserved: u32,
    /// Starting sector (512-byte units).
    sector: u64,
}

/// Per-descriptor request headers and status bytes, keyed by chain head.
///
/// The arena is DMA-visible (identity map); a slot is owned by the driver
/// except while its chain is in flight, when the device reads the header
/// and writes the status byte.
#[repr(C)]
struct BlkArena {
    headers: [BlkReqHeader; QUEUE_SIZE],
    status: [u8; QUEUE_SIZE],
}

impl BlkArena {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            headers: [BlkReqHeader {
                type_: 0,
                reserved: 0,
                sector: 0,
            }; QUEUE_SIZE],
            status: [STATUS_PENDING; QUEUE_SIZE],
        })
    }

    fn header_phys(&self, idx: u16) -> u64 {
        ptr::from_ref(&self.headers[idx as usize]) as u64
    }

    fn status_phys(&self, idx: u16) -> u64 {
        ptr::from_ref(&self.status[idx as usize]) as u64
    }
}

/// A VirtIO block device.
pub struct BlkDevice {
    transport: Transport,
    queue: Virtqueue,
    arena: Box<BlkArena>,
    /// In-flight requests, keyed by chain-head descriptor index.
    active: [Option<Box<WorkItem>>; QUEUE_SIZE],
    /// Number of requests currently on the queue.
    outstanding: u32,
    /// Whether the queue needs a doorbell kick at the end of the batch.
    pending_notify: bool,
    /// Device capacity in 512-byte sectors.
    capacity: u64,
    /// Sector size in bytes.
    block_size: u32,
    /// Maximum scatter-gather segments the device accepts.
    seg_max: u32,
}

impl BlkDevice {
    /// Brings up a block device on `transport`.
    pub fn new(mut transport: Transport, dma: &dyn DmaAllocator) -> Result<Self, DriverError> {
        begin_init(&transport);

        // Config space: capacity at 0, seg_max at 12, blk_size at 20. The
        // latter two sit behind feature bits we do not negotiate, so zero
        // readings fall back to safe defaults.
        let capacity = transport.config_read_u64(0).unwrap_or(0);
        let seg_max = match transport.config_read_u32(12).unwrap_or(0) {
            0 => 1,
            n => n,
        };
        let block_size = match transport.config_read_u32(20).unwrap_or(0) {
            0 => DEFAULT_BLOCK_SIZE,
            n => n,
        };

        negotiate_features(&transport)?;
        let queue = create_queue(&mut transport, dma, REQUEST_QUEUE)?;
        driver_ok(&transport)?;

        log::info!(
            "virtio-blk: {capacity} sectors, sector size {block_size}, queue size {}",
            queue.size()
        );
        Ok(Self {
            transport,
            queue,
            arena: BlkArena::new_boxed(),
            active: [const { None }; QUEUE_SIZE],
            outstanding: 0,
            pending_notify: false,
            capacity,
            block_size,
            seg_max,
        })
    }

    /// Device capacity in 512-byte sectors.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Sector size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Maximum scatter-gather segments per request.
    #[must_use]
    pub fn seg_max(&self) -> u32 {
        self.seg_max
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &Virtqueue {
        &self.queue
    }

    /// Validates a read/write payload: exactly one segment, 4 KiB aligned.
    fn validate(io: &BlockIo) -> Result<(), WorkResult> {
        if io.segment_count != 1 {
            return Err(WorkResult::Invalid);
        }
        if io.segments[0].addr % DATA_ALIGN != 0 {
            return Err(WorkResult::Invalid);
        }
        Ok(())
    }

    /// Builds and publishes the descriptor chain for one request.
    ///
    /// On allocation failure every descriptor taken so far is returned to
    /// the free list and `Err(NoSpace)` is reported.
    fn enqueue_request(
        &mut self,
        req_type: u32,
        sector: u64,
        data: Option<(u64, u32, DescFlags)>,
    ) -> Result<u16, WorkResult> {
        let Some(head) = self.queue.alloc_desc() else {
            return Err(WorkResult::NoSpace);
        };

        let data_desc = if data.is_some() {
            match self.queue.alloc_desc() {
                Some(idx) => Some(idx),
                None => {
                    self.queue.free_desc(head);
                    return Err(WorkResult::NoSpace);
                }
            }
        } else {
            None
        };

        let Some(status_desc) = self.queue.alloc_desc() else {
            if let Some(idx) = data_desc {
                self.queue.free_desc(idx);
            }
            self.queue.free_desc(head);
            return Err(WorkResult::NoSpace);
        };

        self.arena.headers[head as usize] = BlkReqHeader {
            type_: req_type,
            reserved: 0,
            sector,
        };
        // The device owns the status byte until completion.
        // SAFETY: arena slot within bounds; volatile because the device
        // writes this byte via DMA.
        unsafe {
            ptr::write_volatile(&raw mut self.arena.status[head as usize], STATUS_PENDING);
        }

        self.queue
            .set_desc(head, self.arena.header_phys(head), 16, DescFlags::empty());
        if let (Some(idx), Some((addr, len, flags))) = (data_desc, data) {
            self.queue.link_desc(head, idx);
            self.queue.set_desc(idx, addr, len, flags);
            self.queue.link_desc(idx, status_desc);
        } else {
            self.queue.link_desc(head, status_desc);
        }
        self.queue
            .set_desc(status_desc, self.arena.status_phys(head), 1, DescFlags::WRITE);

        self.queue.publish(head);
        Ok(head)
    }
}

impl VirtioDevice for BlkDevice {
    fn ack_isr(&self) {
        let isr = self.transport.read_isr();
        self.transport.ack_isr(isr);
    }

    fn submit(&mut self, sink: &mut dyn WorkSink, mut work: Box<WorkItem>) {
        let (req_type, sector, data) = match work.kind {
            WorkKind::BlockRead(ref io) => {
                if let Err(result) = Self::validate(io) {
                    work.state = WorkState::Completed;
                    sink.complete_work(work, result);
                    return;
                }
                let seg = io.segments[0];
                (
                    VIRTIO_BLK_T_IN,
                    io.sector,
                    Some((seg.addr, seg.len, DescFlags::WRITE)),
                )
            }
            WorkKind::BlockWrite(ref io) => {
                if let Err(result) = Self::validate(io) {
                    work.state = WorkState::Completed;
                    sink.complete_work(work, result);
                    return;
                }
                let seg = io.segments[0];
                (
                    VIRTIO_BLK_T_OUT,
                    io.sector,
                    Some((seg.addr, seg.len, DescFlags::empty())),
                )
            }
            WorkKind::BlockFlush => (VIRTIO_BLK_T_FLUSH, 0, None),
            _ => {
                work.state = WorkState::Completed;
                sink.complete_work(work, WorkResult::Invalid);
                return;
            }
        };

        match self.enqueue_request(req_type, sector, data) {
            Ok(head) => {
                work.state = WorkState::Live;
                self.active[head as usize] = Some(work);
                self.outstanding += 1;
                self.pending_notify = true;
            }
            Err(result) => {
                work.state = WorkState::Completed;
                sink.complete_work(work, result);
            }
        }
    }

    fn process_irq(&mut self, sink: &mut dyn WorkSink) {
        while let Some((head, _len)) = self.queue.get_used() {
            let Some(mut work) = self
                .active
                .get_mut(head as usize)
                .and_then(Option::take)
            else {
                log::debug!("virtio-blk: used entry for untracked descriptor {head}");
                continue;
            };

            // The result comes from the in-memory status byte, not from the
            // used length (which only counts device-written bytes).
            // SAFETY: arena slot within bounds; device wrote it via DMA.
            let status =
                unsafe { ptr::read_volatile(&raw const self.arena.status[head as usize]) };
            let result = match status {
                VIRTIO_BLK_S_OK => WorkResult::Ok,
                VIRTIO_BLK_S_IOERR => WorkResult::IoError,
                VIRTIO_BLK_S_UNSUPP => WorkResult::Invalid,
                _ => WorkResult::IoError,
            };

            if result == WorkResult::Ok {
                match work.kind {
                    WorkKind::BlockRead(ref mut io) | WorkKind::BlockWrite(ref mut io) => {
                        io.completed_sectors = io.num_sectors;
                    }
                    _ => {}
                }
            }

            self.queue.free_chain(head);
            self.outstanding -= 1;
            work.state = WorkState::Completed;
            sink.complete_work(work, result);
        }
    }

    fn flush_notify(&mut self) {
        if self.pending_notify {
            self.pending_notify = false;
            self.transport.notify(REQUEST_QUEUE);
        }
    }
}
