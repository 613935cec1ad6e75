// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address and identifier newtypes shared by the mapping database
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysAddr, VirtAddr, SpaceId, Tag, PAGE_SHIFT, PAGE_SIZE
//! DEPENDS_ON: -
//! INVARIANTS: Page numbers are always derived with PAGE_SHIFT; SpaceId is opaque
//!
//! The mapping database never dereferences any of these values. Space
//! identifiers are compared and forwarded to the memory-space collaborator,
//! physical addresses only select a frame slot.

use core::fmt;

/// Log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;
/// Size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Rounds `addr` down to a multiple of `size` (a power of two).
#[inline]
pub const fn align_down(addr: usize, size: usize) -> usize {
    addr & !(size - 1)
}

/// Physical address of a page frame (or any byte within it).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn align_down(self, size: usize) -> Self {
        Self(align_down(self.0, size))
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// Virtual address inside some address space.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Page number of this address.
    #[inline]
    pub const fn page(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn from_page(page: usize) -> Self {
        Self(page << PAGE_SHIFT)
    }

    #[inline]
    pub const fn align_down(self, size: usize) -> Self {
        Self(align_down(self.0, size))
    }

    #[inline]
    pub const fn is_aligned(self, size: usize) -> bool {
        self.0 & (size - 1) == 0
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// Address-space identifier as carried in every mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    /// The initial address space; owns the root of every mapping tree.
    pub const SIGMA0: Self = Self(2);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_sigma0(self) -> bool {
        self.0 == Self::SIGMA0.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sigma0() {
            write!(f, "sigma0")
        } else {
            write!(f, "space#{}", self.0)
        }
    }
}

/// Access-path tag chosen by the granter.
///
/// Restricted flushes and restricted iteration only descend into direct
/// children carrying the requested tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Tag(u8);

impl Tag {
    /// Tag of mappings created without an explicit access path.
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1234, PAGE_SIZE), 0x1000);
        assert_eq!(align_down(0x2000, PAGE_SIZE), 0x2000);
        assert_eq!(align_down(0x40_3000, 0x40_0000), 0x40_0000);
    }

    #[test]
    fn page_numbers_round_trip() {
        let va = VirtAddr::new(0x0804_8123);
        assert_eq!(VirtAddr::from_page(va.page()), VirtAddr::new(0x0804_8000));
        assert_eq!(PhysAddr::new(0x3000).pfn(), 3);
    }

    #[test]
    fn sigma0_is_recognised() {
        assert!(SpaceId::SIGMA0.is_sigma0());
        assert!(!SpaceId::from_raw(7).is_sigma0());
    }
}
