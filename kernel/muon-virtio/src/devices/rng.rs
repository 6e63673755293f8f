//! VirtIO entropy device driver (virtio-rng).
//!
//! The simplest device personality: one virtqueue, no feature bits, no
//! configuration space. Each read request is a single device-writable
//! descriptor over the caller's output buffer; the used-ring length tells
//! how many bytes of entropy the device actually delivered.

use alloc::boxed::Box;

use muon_driver_api::{DmaAllocator, DriverError, WorkItem, WorkKind, WorkResult, WorkSink, WorkState};

use super::{begin_init, create_queue, driver_ok, negotiate_features, VirtioDevice};
use crate::queue::{DescFlags, Virtqueue, QUEUE_SIZE};
use crate::transport::{Transport, VirtioTransport};

/// The entropy device's single request queue.
const REQUEST_QUEUE: u16 = 0;

/// A VirtIO entropy source.
pub struct RngDevice {
    transport: Transport,
    queue: Virtqueue,
    /// In-flight requests, keyed by descriptor index.
    active: [Option<Box<WorkItem>>; QUEUE_SIZE],
    /// Whether the queue needs a doorbell kick at the end of the batch.
    pending_notify: bool,
}

impl RngDevice {
    /// Brings up an entropy device on `transport`.
    pub fn new(mut transport: Transport, dma: &dyn DmaAllocator) -> Result<Self, DriverError> {
        begin_init(&transport);
        // The entropy device has no configuration space to read.
        negotiate_features(&transport)?;
        let queue = create_queue(&mut transport, dma, REQUEST_QUEUE)?;
        driver_ok(&transport)?;

        log::info!("virtio-rng: ready, queue size {}", queue.size());
        Ok(Self {
            transport,
            queue,
            active: [const { None }; QUEUE_SIZE],
            pending_notify: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &Virtqueue {
        &self.queue
    }
}

impl VirtioDevice for RngDevice {
    fn ack_isr(&self) {
        let isr = self.transport.read_isr();
        self.transport.ack_isr(isr);
    }

    fn submit(&mut self, sink: &mut dyn WorkSink, mut work: Box<WorkItem>) {
        let WorkKind::RngRead(req) = work.kind else {
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::Invalid);
            return;
        };

        let Some(idx) = self.queue.alloc_desc() else {
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::NoSpace);
            return;
        };

        self.queue
            .set_desc(idx, req.buf, req.len, DescFlags::WRITE);
        work.state = WorkState::Live;
        self.active[idx as usize] = Some(work);
        self.queue.publish(idx);
        self.pending_notify = true;
    }

    fn process_irq(&mut self, sink: &mut dyn WorkSink) {
        while let Some((head, len)) = self.queue.get_used() {
            let Some(mut work) = self
                .active
                .get_mut(head as usize)
                .and_then(Option::take)
            else {
                log::debug!("virtio-rng: used entry for untracked descriptor {head}");
                continue;
            };

            if let WorkKind::RngRead(ref mut req) = work.kind {
                req.filled = len;
            }
            self.queue.free_desc(head);
            work.state = WorkState::Completed;
            sink.complete_work(work, WorkResult::Ok);
        }
    }

    fn flush_notify(&mut self) {
        if self.pending_notify {
            self.pending_notify = false;
            self.transport.notify(REQUEST_QUEUE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fill_writable, DmaArena, FakeMmio, MockSink, VqModel};
    use crate::transport::MmioTransport;
    use muon_driver_api::WorkId;

    fn rng_fixture(arena: &DmaArena, queue_max: u32) -> (FakeMmio, RngDevice) {
        let window = FakeMmio::new(1, super::super::VIRTIO_ID_ENTROPY, queue_max);
        // SAFETY: the fake window outlives the device in every test.
        let transport = Transport::Mmio(unsafe { MmioTransport::new(window.base()) }.unwrap());
        let dev = RngDevice::new(transport, arena).unwrap();
        (window, dev)
    }

    #[test]
    fn entropy_read_end_to_end() {
        let arena = DmaArena::new();
        let (_window, mut dev) = rng_fixture(&arena, 64);
        assert_eq!(dev.queue().size(), 64);

        let buf = arena.buffer(16, 16);
        let mut sink = MockSink::new();
        dev.submit(&mut sink, Box::new(WorkItem::rng_read(WorkId(1), buf, 16)));
        dev.flush_notify();
        assert_eq!(dev.queue().avail_idx(), 1);
        assert_eq!(dev.queue().num_free(), 63);

        let mut model = VqModel::attach(dev.queue());
        let served = model.service(|_head, chain| {
            assert_eq!(chain.len(), 1);
            assert_eq!(chain[0].len, 16);
            fill_writable(chain, 0x5A)
        });
        assert_eq!(served, 1);

        dev.process_irq(&mut sink);
        assert_eq!(sink.single_result(), WorkResult::Ok);
        let (work, _) = &sink.completed[0];
        assert_eq!(work.state, WorkState::Completed);
        match work.kind {
            WorkKind::RngRead(ref req) => assert_eq!(req.filled, 16),
            _ => unreachable!(),
        }
        // All descriptors are back on the free list.
        assert_eq!(dev.queue().num_free(), 64);

        // The device wrote the caller's buffer.
        // SAFETY: test-owned buffer.
        let first = unsafe { core::ptr::read_volatile(buf as usize as *const u8) };
        assert_eq!(first, 0x5A);
    }

    #[test]
    fn exhausted_queue_completes_no_space() {
        let arena = DmaArena::new();
        let (_window, mut dev) = rng_fixture(&arena, 1);

        let mut sink = MockSink::new();
        let buf = arena.buffer(8, 8);
        dev.submit(&mut sink, Box::new(WorkItem::rng_read(WorkId(1), buf, 8)));
        dev.submit(&mut sink, Box::new(WorkItem::rng_read(WorkId(2), buf, 8)));
        dev.flush_notify();

        assert_eq!(sink.completed.len(), 1);
        let (work, result) = &sink.completed[0];
        assert_eq!(work.id, WorkId(2));
        assert_eq!(*result, WorkResult::NoSpace);
    }

    #[test]
    fn batch_submission_notifies_once() {
        let arena = DmaArena::new();
        let (mut window, mut dev) = rng_fixture(&arena, 64);

        let mut sink = MockSink::new();
        for i in 0..3 {
            let buf = arena.buffer(32, 8);
            dev.submit(&mut sink, Box::new(WorkItem::rng_read(WorkId(i), buf, 32)));
        }
        // No doorbell until the batch is flushed.
        window.write32(0x050, 0xFFFF_FFFF);
        dev.flush_notify();
        assert_eq!(window.read32(0x050), 0); // queue index 0 written
        assert_eq!(dev.queue().avail_idx(), 3);

        // A second flush with nothing pending stays silent.
        window.write32(0x050, 0xFFFF_FFFF);
        dev.flush_notify();
        assert_eq!(window.read32(0x050), 0xFFFF_FFFF);
    }

    #[test]
    fn wrong_operation_is_invalid() {
        let arena = DmaArena::new();
        let (_window, mut dev) = rng_fixture(&arena, 64);

        let mut sink = MockSink::new();
        dev.submit(&mut sink, Box::new(WorkItem::block_flush(WorkId(7))));
        assert_eq!(sink.single_result(), WorkResult::Invalid);
    }
}
