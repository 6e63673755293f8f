//! Bare-metal BAR sizing and assignment.
//!
//! The hypervisor does not pre-program Base Address Registers on this
//! platform, so discovery assigns them: write all-ones to learn each BAR's
//! size mask, align a running cursor up to the BAR's natural alignment, and
//! write the assigned address back. 64-bit BARs consume two consecutive
//! slots; I/O BARs are skipped (nothing in this stack uses port I/O
//! windows). The cursor is rounded up to 4 KiB after each assignment so
//! neighbouring devices never share a page.

use muon_driver_api::{PciAddress, PciBar, PciConfigAccess};

use super::config::regs;

/// Assigns addresses to memory BARs from a fixed bus-address window.
pub struct BarAllocator {
    cursor: u64,
}

impl BarAllocator {
    /// Creates an allocator handing out addresses from `base` upward.
    /// `base` must be 4 KiB aligned.
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self { cursor: base }
    }

    /// Next unassigned bus address.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Sizes and assigns all six BAR slots of one function.
    pub fn assign(&mut self, cfg: &mut dyn PciConfigAccess, addr: PciAddress) -> [PciBar; 6] {
        let mut bars = [PciBar::Unused; 6];

        let mut i = 0;
        while i < 6 {
            let offset = regs::BAR0 + (i as u8) * 4;

            cfg.write_u32(addr, offset, 0xFFFF_FFFF);
            let sizing = cfg.read_u32(addr, offset);

            if sizing == 0 || sizing == 0xFFFF_FFFF {
                i += 1;
                continue;
            }

            if sizing & 1 != 0 {
                // I/O BAR: record the size, assign nothing.
                let mask = sizing & !0x03;
                let size = (!mask).wrapping_add(1) & 0xFFFF;
                if size > 0 {
                    bars[i] = PciBar::Io { base: 0, size };
                }
                i += 1;
                continue;
            }

            let bar_type = (sizing >> 1) & 0x03;
            let prefetchable = sizing & 0x08 != 0;
            let is_64bit = bar_type == 2;

            if is_64bit && i + 1 < 6 {
                let high_offset = regs::BAR0 + ((i + 1) as u8) * 4;
                cfg.write_u32(addr, high_offset, 0xFFFF_FFFF);
                let sizing_high = cfg.read_u32(addr, high_offset);

                let mask64 = (u64::from(sizing_high) << 32) | u64::from(sizing & !0x0F);
                let size = (!mask64).wrapping_add(1);

                let base = self.place(size);
                cfg.write_u32(addr, offset, base as u32);
                cfg.write_u32(addr, high_offset, (base >> 32) as u32);

                bars[i] = PciBar::Memory {
                    base,
                    size,
                    prefetchable,
                    is_64bit: true,
                };
                // Next BAR slot is consumed by the upper 32 bits.
                i += 2;
            } else {
                let mask = sizing & !0x0F;
                let size = u64::from((!mask).wrapping_add(1));

                let base = self.place(size);
                cfg.write_u32(addr, offset, base as u32);

                bars[i] = PciBar::Memory {
                    base,
                    size,
                    prefetchable,
                    is_64bit: false,
                };
                i += 1;
            }
        }

        bars
    }

    /// Reserves `size` bytes at the BAR's natural alignment and rounds the
    /// cursor to the next 4 KiB boundary afterwards.
    fn place(&mut self, size: u64) -> u64 {
        let align = size.max(16);
        let base = (self.cursor + align - 1) & !(align - 1);
        self.cursor = (base + size + 0xFFF) & !0xFFF;
        base
    }
}
