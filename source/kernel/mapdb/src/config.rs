// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-architecture mapping database configuration and tree-size policy
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbConfig, SIZE_FACTOR, SIZE_ID_MAX, DEPTH_MAX
//! DEPENDS_ON: addr
//! INVARIANTS: Superpage shift > PAGE_SHIFT; RAM range is page aligned and non-empty

use core::ops::Range;

use static_assertions::const_assert;

use crate::addr::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// Smallest mapping-tree capacity; capacities are `SIZE_FACTOR << size_id`.
pub const SIZE_FACTOR: usize = 4;
/// Largest size id a mapping tree may grow to.
pub const SIZE_ID_MAX: u8 = 8;
/// Deepest derivation chain a tree may record.
pub const DEPTH_MAX: u8 = 252;

const_assert!(SIZE_ID_MAX <= 15);
const_assert!(SIZE_FACTOR.is_power_of_two());
const_assert!(DEPTH_MAX < u8::MAX);

/// Returns the slot capacity for a given size id.
#[inline]
pub const fn capacity_for(size_id: u8) -> usize {
    SIZE_FACTOR << size_id
}

/// Static description of the machine the mapping database runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapdbConfig {
    /// Physical memory covered by the database. Frames outside bypass it.
    pub ram: Range<PhysAddr>,
    /// Log2 of the superpage size.
    pub superpage_shift: u32,
    /// Whether the CPU supports superpages at all.
    pub superpages: bool,
    /// First virtual address that is not user accessible.
    pub user_max: usize,
    /// Align flexpage bases to their size instead of to a page.
    pub backward_compatibility: bool,
}

impl MapdbConfig {
    /// IA-32 with PSE: 4 MiB superpages, 3 GiB user space.
    pub const fn ia32(ram: Range<PhysAddr>) -> Self {
        Self {
            ram,
            superpage_shift: 22,
            superpages: true,
            user_max: 0xC000_0000,
            backward_compatibility: true,
        }
    }

    /// AMD64: 2 MiB superpages, canonical lower half for user space.
    pub const fn amd64(ram: Range<PhysAddr>) -> Self {
        Self {
            ram,
            superpage_shift: 21,
            superpages: true,
            user_max: 0x0000_8000_0000_0000,
            backward_compatibility: true,
        }
    }

    /// Disables superpage support (CPU without PSE).
    pub const fn without_superpages(mut self) -> Self {
        self.superpages = false;
        self
    }

    #[inline]
    pub const fn superpage_size(&self) -> usize {
        1 << self.superpage_shift
    }

    #[inline]
    pub const fn superpage_mask(&self) -> usize {
        !(self.superpage_size() - 1)
    }

    /// Size of the largest page a sender can hand out.
    #[inline]
    pub const fn largest_page(&self) -> usize {
        if self.superpages {
            self.superpage_size()
        } else {
            PAGE_SIZE
        }
    }

    /// Number of base frames covered by the RAM range.
    pub fn frame_count(&self) -> usize {
        let start = self.ram.start.raw() >> PAGE_SHIFT;
        let end = self.ram.end.raw() >> PAGE_SHIFT;
        end.saturating_sub(start)
    }

    /// Returns `true` if `phys` is backed by the mapping database.
    #[inline]
    pub fn covers(&self, phys: PhysAddr) -> bool {
        self.ram.contains(&phys)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.superpage_shift > PAGE_SHIFT
            && self.superpage_shift < usize::BITS
            && self.ram.start.raw() % PAGE_SIZE == 0
            && self.ram.end.raw() % PAGE_SIZE == 0
            && self.ram.start < self.ram.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_follow_size_factor() {
        assert_eq!(capacity_for(0), 4);
        assert_eq!(capacity_for(1), 8);
        assert_eq!(capacity_for(SIZE_ID_MAX), 1024);
    }

    #[test]
    fn arch_variants_differ_in_superpage_size() {
        let ram = PhysAddr::new(0)..PhysAddr::new(0x80_0000);
        assert_eq!(MapdbConfig::ia32(ram.clone()).superpage_size(), 4 << 20);
        assert_eq!(MapdbConfig::amd64(ram.clone()).superpage_size(), 2 << 20);
        assert_eq!(MapdbConfig::ia32(ram.clone()).frame_count(), 0x800);
        assert_eq!(MapdbConfig::ia32(ram).without_superpages().largest_page(), PAGE_SIZE);
    }

    #[test]
    fn rejects_unaligned_ram() {
        let cfg = MapdbConfig::ia32(PhysAddr::new(0x10)..PhysAddr::new(0x2000));
        assert!(!cfg.is_valid());
        let cfg = MapdbConfig::ia32(PhysAddr::new(0x2000)..PhysAddr::new(0x2000));
        assert!(!cfg.is_valid());
    }
}
