// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Flexpage descriptors as carried in IPC map items and unmap calls.
//!
//! Word layout (low to high): grant bit, write bit, log2 size (6 bits), four
//! reserved bits, page-aligned base address.

use bitflags::bitflags;

use crate::addr::{VirtAddr, PAGE_MASK};
use crate::config::MapdbConfig;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Access rights transferred with a flexpage.
    pub struct FpageRights: usize {
        const GRANT = 1 << 0;
        const WRITE = 1 << 1;
    }
}

const SIZE_SHIFT: u32 = 2;
const SIZE_MASK: usize = 0x3f << SIZE_SHIFT;
/// log2 sizes at or above this value denote the whole user address space.
pub const WHOLE_SPACE_LOG2: u8 = 32;

/// Marker of x86 I/O-port flexpages (bits 31..28 set, nothing above).
const IO_MARK: usize = 0xf000_0000;

/// A flexpage: a size-aligned virtual region plus rights.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Fpage(usize);

/// Virtual region a flexpage resolves to on a given machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FpageRegion {
    pub start: VirtAddr,
    pub size: usize,
    /// Alignment mask of the region size; 0 for the whole space.
    pub size_mask: usize,
}

impl FpageRegion {
    #[inline]
    pub fn end(&self) -> usize {
        self.start.raw().saturating_add(self.size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Fpage {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Memory flexpage of `2^log2_size` bytes at `base`.
    pub fn mem(base: VirtAddr, log2_size: u8, rights: FpageRights) -> Self {
        let size = ((log2_size as usize) << SIZE_SHIFT) & SIZE_MASK;
        Self((base.raw() & PAGE_MASK) | size | rights.bits())
    }

    /// Flexpage covering the whole user address space.
    pub fn whole_space(rights: FpageRights) -> Self {
        Self::mem(VirtAddr::new(0), WHOLE_SPACE_LOG2, rights)
    }

    #[inline]
    pub fn page(self) -> VirtAddr {
        VirtAddr::new(self.0 & PAGE_MASK)
    }

    #[inline]
    pub fn log2_size(self) -> u8 {
        ((self.0 & SIZE_MASK) >> SIZE_SHIFT) as u8
    }

    #[inline]
    pub fn rights(self) -> FpageRights {
        FpageRights::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        self.rights().contains(FpageRights::WRITE)
    }

    #[inline]
    pub fn is_grant(self) -> bool {
        self.rights().contains(FpageRights::GRANT)
    }

    #[inline]
    pub fn is_whole_space(self) -> bool {
        self.log2_size() >= WHOLE_SPACE_LOG2
    }

    #[inline]
    pub fn is_io(self) -> bool {
        self.0 & !0xfff_ffff == IO_MARK
    }

    /// Resolves the descriptor against `cfg`.
    ///
    /// Sizes below one page resolve to an empty region. With
    /// `backward_compatibility` the base is aligned to the flexpage size,
    /// otherwise only to a page.
    pub fn region(self, cfg: &MapdbConfig) -> FpageRegion {
        let (size, size_mask) = if self.is_whole_space() {
            (cfg.user_max, 0)
        } else {
            let size = (1usize << self.log2_size()) & PAGE_MASK;
            (size, !size.wrapping_sub(1))
        };
        let start = if cfg.backward_compatibility {
            self.page().raw() & size_mask
        } else {
            self.page().raw()
        };
        FpageRegion { start: VirtAddr::new(start), size, size_mask }
    }
}
