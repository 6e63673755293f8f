//! VirtIO split virtqueue engine.
//!
//! Provides [`Virtqueue`], which manages the descriptor table, available
//! ring, and used ring inside a single contiguous DMA block. The block is
//! laid out in the fixed order the VirtIO split-ring ABI mandates:
//!
//! ```text
//! +0                         descriptor table   (size * 16 bytes)
//! +desc_bytes                available ring     (4 + 2*size + 2 bytes)
//! +used_offset (4 KiB up)    used ring          (4 + 8*size + 2 bytes)
//! ```
//!
//! The used ring is padded up to a 4 KiB boundary, which both satisfies the
//! modern split-address programming and the legacy PFN transport (where the
//! device derives all three regions from a single page frame number). The
//! trailing `used_event` / `avail_event` slots are reserved but never used.
//!
//! The queue is single-owner by construction (the base context); it is not
//! thread-safe and does not need to be.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use muon_driver_api::FRAME_SIZE;

/// Build-time maximum queue capacity. Per-descriptor tracking arrays in the
/// device drivers are sized to this regardless of the negotiated size.
pub const QUEUE_SIZE: usize = 256;

/// Free-list sentinel: no descriptor.
pub const NO_DESC: u16 = 0xFFFF;

/// Size of a single descriptor in bytes.
const DESC_SIZE: usize = 16;

bitflags::bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Descriptor continues via the `next` field.
        const NEXT = 1;
        /// Buffer is device-writable (otherwise device-readable).
        const WRITE = 2;
        /// Indirect descriptor table. Reserved; this driver never sets it.
        const INDIRECT = 4;
    }
}

/// A single virtqueue descriptor as shared with the device.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Descriptor flags ([`DescFlags`]).
    pub flags: u16,
    /// Index of the next descriptor if `NEXT` is set; free-list link while
    /// the descriptor is unallocated.
    pub next: u16,
}

// -- Available ring layout ----------------------------------------------------
// struct virtq_avail {
//     flags: u16,        // offset 0
//     idx: u16,          // offset 2
//     ring: [u16; N],    // offset 4
//     used_event: u16,   // offset 4 + 2*N (reserved, not used)
// }

const AVAIL_IDX_OFFSET: usize = 2;
const AVAIL_RING_OFFSET: usize = 4;

// -- Used ring layout ---------------------------------------------------------
// struct virtq_used {
//     flags: u16,          // offset 0
//     idx: u16,            // offset 2
//     ring: [UsedElem; N], // offset 4
//     avail_event: u16,    // (reserved, not used)
// }
// struct UsedElem { id: u32, len: u32 } — 8 bytes each

const USED_IDX_OFFSET: usize = 2;
const USED_RING_OFFSET: usize = 4;
const USED_ELEM_SIZE: usize = 8;

/// Rounds `size` up to the next multiple of `align` (a power of two).
const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Bytes occupied by the descriptor table for a queue of `size` entries.
#[must_use]
pub const fn desc_bytes(size: u16) -> usize {
    size as usize * DESC_SIZE
}

/// Bytes occupied by the available ring (including the reserved event slot).
#[must_use]
pub const fn avail_bytes(size: u16) -> usize {
    4 + 2 * size as usize + 2
}

/// Bytes occupied by the used ring (including the reserved event slot).
#[must_use]
pub const fn used_bytes(size: u16) -> usize {
    4 + USED_ELEM_SIZE * size as usize + 2
}

/// Offset of the used ring within the queue memory block.
#[must_use]
pub const fn used_offset(size: u16) -> usize {
    align_up(desc_bytes(size) + avail_bytes(size), FRAME_SIZE)
}

/// Total footprint of the queue memory block in bytes.
#[must_use]
pub const fn total_bytes(size: u16) -> usize {
    used_offset(size) + used_bytes(size)
}

/// DMA frames needed for a queue of `size` entries.
#[must_use]
pub const fn frames_for(size: u16) -> usize {
    align_up(total_bytes(size), FRAME_SIZE) / FRAME_SIZE
}

/// A VirtIO split virtqueue.
///
/// Owns the driver-side state (free list, ring cursors) for one queue whose
/// shared memory lives at an identity-mapped physical address.
pub struct Virtqueue {
    /// Identity-mapped physical base of the queue memory block.
    base: u64,
    /// Negotiated queue size (number of descriptors).
    size: u16,
    /// Byte offset of the available ring.
    avail_off: usize,
    /// Byte offset of the used ring.
    used_off: usize,
    /// Number of free descriptors.
    num_free: u16,
    /// Head of the free descriptor list (linked via `next`).
    free_head: u16,
    /// Driver's cursor into the used ring.
    last_used_idx: u16,
    /// Shadow of the available ring's monotone index.
    avail_idx: u16,
}

impl Virtqueue {
    /// Initializes a virtqueue over a freshly allocated memory block.
    ///
    /// Zeroes the block, threads all descriptors onto the free list, and
    /// clears both ring headers (available-ring flags cleared = interrupts
    /// requested).
    ///
    /// # Safety
    ///
    /// `base` must be the identity-mapped physical address of at least
    /// [`frames_for`]`(size)` DMA frames, 4 KiB aligned, exclusively owned
    /// by this queue for its lifetime.
    pub unsafe fn new(base: u64, size: u16) -> Self {
        let avail_off = desc_bytes(size);
        let used_off = used_offset(size);

        // SAFETY: Caller guarantees the block covers total_bytes(size).
        unsafe {
            ptr::write_bytes(base as usize as *mut u8, 0, total_bytes(size));
        }

        let mut vq = Self {
            base,
            size,
            avail_off,
            used_off,
            num_free: size,
            free_head: 0,
            last_used_idx: 0,
            avail_idx: 0,
        };

        // Thread the free list through the descriptor `next` fields.
        for i in 0..size {
            let next = if i + 1 < size { i + 1 } else { NO_DESC };
            vq.write_desc(
                i,
                VirtqDesc {
                    addr: 0,
                    len: 0,
                    flags: 0,
                    next,
                },
            );
        }

        vq
    }

    // -- Accessors ------------------------------------------------------------

    /// Physical address of the descriptor table.
    #[must_use]
    pub fn desc_phys(&self) -> u64 {
        self.base
    }

    /// Physical address of the available ring.
    #[must_use]
    pub fn avail_phys(&self) -> u64 {
        self.base + self.avail_off as u64
    }

    /// Physical address of the used ring.
    #[must_use]
    pub fn used_phys(&self) -> u64 {
        self.base + self.used_off as u64
    }

    /// Negotiated queue size.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Number of free descriptors.
    #[must_use]
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Shadow of the available ring index.
    #[must_use]
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    // -- Raw descriptor access ------------------------------------------------

    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        debug_assert!(idx < self.size);
        (self.base as usize + idx as usize * DESC_SIZE) as *mut VirtqDesc
    }

    fn read_desc(&self, idx: u16) -> VirtqDesc {
        // SAFETY: idx is within the descriptor table (type invariant).
        unsafe { ptr::read_volatile(self.desc_ptr(idx)) }
    }

    fn write_desc(&mut self, idx: u16, desc: VirtqDesc) {
        // SAFETY: idx is within the descriptor table (type invariant).
        unsafe { ptr::write_volatile(self.desc_ptr(idx), desc) }
    }

    // -- Descriptor allocation ------------------------------------------------

    /// Pops one descriptor off the free list, or `None` if the queue is
    /// momentarily full.
    pub fn alloc_desc(&mut self) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let head = self.free_head;
        self.free_head = self.read_desc(head).next;
        self.num_free -= 1;
        Some(head)
    }

    /// Pushes one descriptor back onto the free list.
    pub fn free_desc(&mut self, idx: u16) {
        let mut desc = self.read_desc(idx);
        desc.flags = 0;
        desc.next = self.free_head;
        self.write_desc(idx, desc);
        self.free_head = idx;
        self.num_free += 1;
    }

    /// Frees a whole chain by walking `next` links while `NEXT` is set.
    pub fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let desc = self.read_desc(idx);
            self.free_desc(idx);
            if desc.flags & DescFlags::NEXT.bits() == 0 {
                break;
            }
            idx = desc.next;
        }
    }

    /// Writes a descriptor's buffer address, length, and flags. The `next`
    /// link is left untouched; use [`link_desc`](Self::link_desc) to chain.
    pub fn set_desc(&mut self, idx: u16, addr: u64, len: u32, flags: DescFlags) {
        let mut desc = self.read_desc(idx);
        desc.addr = addr;
        desc.len = len;
        desc.flags = flags.bits();
        self.write_desc(idx, desc);
    }

    /// Chains descriptor `a` to descriptor `b` (sets `NEXT` and the link).
    pub fn link_desc(&mut self, a: u16, b: u16) {
        let mut desc = self.read_desc(a);
        desc.flags |= DescFlags::NEXT.bits();
        desc.next = b;
        self.write_desc(a, desc);
    }

    /// Reads back a descriptor. Intended for completion-path inspection.
    #[must_use]
    pub fn desc(&self, idx: u16) -> VirtqDesc {
        self.read_desc(idx)
    }

    // -- Publish / reap -------------------------------------------------------

    /// Publishes a chain head on the available ring.
    ///
    /// The full fence between the ring-slot store and the index store keeps
    /// the device from observing the new index before the slot (and the
    /// descriptors it names) are globally visible.
    pub fn publish(&mut self, head: u16) {
        let slot = (self.avail_idx % self.size) as usize;
        let ring_ptr =
            (self.base as usize + self.avail_off + AVAIL_RING_OFFSET + slot * 2) as *mut u16;
        // SAFETY: slot is within the available ring (type invariant).
        unsafe { ptr::write_volatile(ring_ptr, head) };

        fence(Ordering::SeqCst);

        self.avail_idx = self.avail_idx.wrapping_add(1);
        let idx_ptr = (self.base as usize + self.avail_off + AVAIL_IDX_OFFSET) as *mut u16;
        // SAFETY: The index field is within the available ring.
        unsafe { ptr::write_volatile(idx_ptr, self.avail_idx) };
    }

    fn device_used_idx(&self) -> u16 {
        let idx_ptr = (self.base as usize + self.used_off + USED_IDX_OFFSET) as *const u16;
        // SAFETY: The index field is within the used ring.
        unsafe { ptr::read_volatile(idx_ptr) }
    }

    /// Whether the device has published completions we have not reaped.
    #[must_use]
    pub fn has_used(&self) -> bool {
        self.device_used_idx() != self.last_used_idx
    }

    /// Reaps one used-ring entry: `(chain head, bytes written)`.
    ///
    /// Does *not* free the chain — the caller owns the head-indexed request
    /// tracking and frees (or re-arms) the chain itself.
    pub fn get_used(&mut self) -> Option<(u16, u32)> {
        let used_idx = self.device_used_idx();
        if used_idx == self.last_used_idx {
            return None;
        }

        // Entry contents were published before the device's index store.
        fence(Ordering::Acquire);

        let slot = (self.last_used_idx % self.size) as usize;
        let elem_ptr =
            (self.base as usize + self.used_off + USED_RING_OFFSET + slot * USED_ELEM_SIZE)
                as *const u32;
        // SAFETY: slot is within the used ring (type invariant).
        let (id, len) = unsafe {
            (
                ptr::read_volatile(elem_ptr),
                ptr::read_volatile(elem_ptr.add(1)),
            )
        };

        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some((id as u16, len))
    }
}
