//! Deferred-interrupt ring.
//!
//! A lock-free single-producer/single-consumer ring carrying device tags
//! from interrupt context to the cooperative poll phase. The producer is
//! the per-CPU interrupt handler (non-reentrant on this kernel); the
//! consumer is [`Platform::tick`](crate::platform::Platform::tick).
//!
//! The consumer drains with a *snapshot bound*: it reads the producer
//! cursor once and dequeues only entries published before the snapshot.
//! A device that re-enqueues itself while being processed is therefore
//! picked up on the next tick, never in the current one, which keeps every
//! tick bounded.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_driver_api::DeviceKind;

/// Ring capacity. A power of two, sized above the largest expected
/// interrupt burst.
pub const IRQ_RING_CAPACITY: usize = 64;

const _: () = assert!(IRQ_RING_CAPACITY.is_power_of_two());

/// SPSC ring of device tags with a saturating overflow counter.
///
/// A full ring drops the enqueue and counts it; nothing is lost, because
/// the device's used ring still reflects the work and the next successful
/// enqueue coalesces it.
pub struct IrqRing {
    /// Slot storage. Only the producer writes a slot, and only between
    /// checking for space and publishing `write + 1`.
    slots: [UnsafeCell<DeviceKind>; IRQ_RING_CAPACITY],
    /// Producer cursor, monotonically increasing.
    write: AtomicU32,
    /// Consumer cursor, monotonically increasing.
    read: AtomicU32,
    /// Saturating count of dropped enqueues.
    overflows: AtomicU32,
}

// SAFETY: Single producer (interrupt context) and single consumer (base
// context) by construction; slot accesses are ordered by release stores
// and acquire loads of the cursors.
unsafe impl Sync for IrqRing {}

impl IrqRing {
    /// Creates an empty ring.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(DeviceKind::Entropy) }; IRQ_RING_CAPACITY],
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
            overflows: AtomicU32::new(0),
        }
    }

    /// Enqueues a device tag from interrupt context.
    ///
    /// Returns `false` (and bumps the overflow counter) if the ring is
    /// full. The interrupt is still acknowledged by the transport in that
    /// case; the work coalesces into the next interrupt.
    pub fn enqueue(&self, kind: DeviceKind) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= IRQ_RING_CAPACITY as u32 {
            // Saturating increment; only the producer touches this.
            let n = self.overflows.load(Ordering::Relaxed);
            if n != u32::MAX {
                self.overflows.store(n + 1, Ordering::Relaxed);
            }
            return false;
        }

        let slot = write as usize & (IRQ_RING_CAPACITY - 1);
        // SAFETY: `write - read < capacity`, so the consumer is not reading
        // this slot; the release store below publishes it.
        unsafe { *self.slots[slot].get() = kind };

        self.write.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Returns the current producer cursor for a bounded drain.
    #[must_use]
    pub fn snapshot(&self) -> u32 {
        self.write.load(Ordering::Acquire)
    }

    /// Dequeues one entry, stopping at the snapshot `end`.
    ///
    /// Returns `None` once the cursor reaches `end` or the ring is empty.
    pub fn dequeue_bounded(&self, end: u32) -> Option<DeviceKind> {
        let read = self.read.load(Ordering::Relaxed);
        if read == end {
            return None;
        }
        let write = self.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }

        let slot = read as usize & (IRQ_RING_CAPACITY - 1);
        // SAFETY: `read < write`, so this slot was published by the
        // producer's release store, made visible by the acquire load above.
        let kind = unsafe { *self.slots[slot].get() };

        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(kind)
    }

    /// Total number of dropped enqueues so far (saturating).
    #[must_use]
    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.write
            .load(Ordering::Acquire)
            .wrapping_sub(self.read.load(Ordering::Acquire))
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IrqRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ring = IrqRing::new();
        assert!(ring.enqueue(DeviceKind::Block));
        assert!(ring.enqueue(DeviceKind::Net));
        assert!(ring.enqueue(DeviceKind::Entropy));

        let end = ring.snapshot();
        assert_eq!(ring.dequeue_bounded(end), Some(DeviceKind::Block));
        assert_eq!(ring.dequeue_bounded(end), Some(DeviceKind::Net));
        assert_eq!(ring.dequeue_bounded(end), Some(DeviceKind::Entropy));
        assert_eq!(ring.dequeue_bounded(end), None);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let ring = IrqRing::new();
        for _ in 0..IRQ_RING_CAPACITY {
            assert!(ring.enqueue(DeviceKind::Net));
        }
        for _ in 0..36 {
            assert!(!ring.enqueue(DeviceKind::Net));
        }
        assert_eq!(ring.overflows(), 36);
        assert_eq!(ring.len(), IRQ_RING_CAPACITY as u32);
    }

    #[test]
    fn snapshot_bounds_the_drain() {
        let ring = IrqRing::new();
        ring.enqueue(DeviceKind::Block);
        ring.enqueue(DeviceKind::Block);
        let end = ring.snapshot();

        // Entries published after the snapshot are not visible to this drain.
        ring.enqueue(DeviceKind::Net);

        assert_eq!(ring.dequeue_bounded(end), Some(DeviceKind::Block));
        assert_eq!(ring.dequeue_bounded(end), Some(DeviceKind::Block));
        assert_eq!(ring.dequeue_bounded(end), None);

        let end2 = ring.snapshot();
        assert_eq!(ring.dequeue_bounded(end2), Some(DeviceKind::Net));
        assert_eq!(ring.dequeue_bounded(end2), None);
    }

    #[test]
    fn drains_after_overflow_allow_new_enqueues() {
        let ring = IrqRing::new();
        for _ in 0..IRQ_RING_CAPACITY {
            ring.enqueue(DeviceKind::Entropy);
        }
        assert!(!ring.enqueue(DeviceKind::Entropy));

        let end = ring.snapshot();
        while ring.dequeue_bounded(end).is_some() {}
        assert!(ring.is_empty());
        assert!(ring.enqueue(DeviceKind::Entropy));
        assert_eq!(ring.overflows(), 1);
    }

    #[test]
    fn cursor_wraparound() {
        let ring = IrqRing::new();
        // Push/pop enough times to wrap the slot index several times.
        for i in 0..(IRQ_RING_CAPACITY * 5) {
            let kind = if i % 2 == 0 {
                DeviceKind::Block
            } else {
                DeviceKind::Net
            };
            assert!(ring.enqueue(kind));
            assert_eq!(ring.dequeue_bounded(ring.snapshot()), Some(kind));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.overflows(), 0);
    }
}
