// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One address space's claim on a frame, as stored in a mapping tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mapping, MappingRef
//! DEPENDS_ON: addr
//! INVARIANTS: depth(child) == depth(parent) + 1; root has depth 0 and belongs to sigma0

use core::fmt;

use crate::addr::{SpaceId, Tag, VirtAddr, PAGE_SHIFT};

/// A single node of a mapping tree.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    space: SpaceId,
    page: usize,
    depth: u8,
    size_shift: u8,
    tag: Tag,
    submap: bool,
}

impl Mapping {
    pub(crate) const fn new(space: SpaceId, va: VirtAddr, depth: u8, size_shift: u8, tag: Tag) -> Self {
        Self { space, page: va.page(), depth, size_shift, tag, submap: false }
    }

    /// Root mapping of a frame: sigma0 maps every frame at its physical address.
    pub(crate) const fn root(pfn: usize) -> Self {
        Self {
            space: SpaceId::SIGMA0,
            page: pfn,
            depth: 0,
            size_shift: PAGE_SHIFT as u8,
            tag: Tag::NONE,
            submap: false,
        }
    }

    /// Address space holding this mapping.
    #[inline]
    pub const fn space(&self) -> SpaceId {
        self.space
    }

    /// Page number of the mapping within its address space.
    #[inline]
    pub const fn page(&self) -> usize {
        self.page
    }

    /// Virtual address at which the frame is mapped.
    #[inline]
    pub const fn vaddr(&self) -> VirtAddr {
        VirtAddr::from_page(self.page)
    }

    /// Distance from the tree root.
    #[inline]
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    /// Size of the mapped region in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        1 << self.size_shift
    }

    #[inline]
    pub const fn size_shift(&self) -> u8 {
        self.size_shift
    }

    #[inline]
    pub const fn is_superpage(&self) -> bool {
        self.size_shift as u32 > PAGE_SHIFT
    }

    #[inline]
    pub const fn tag(&self) -> Tag {
        self.tag
    }

    /// `true` once smaller-sized mappings have been derived from this one.
    #[inline]
    pub const fn is_submap(&self) -> bool {
        self.submap
    }

    #[inline]
    pub const fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Whether this entry answers a lookup for `(space, va)`.
    #[inline]
    pub(crate) fn matches(&self, space: SpaceId, va: VirtAddr) -> bool {
        self.space == space && self.page == va.align_down(self.size()).page()
    }

    pub(crate) fn relabel(&mut self, space: SpaceId, va: VirtAddr) {
        self.space = space;
        self.page = va.align_down(self.size()).page();
    }

    pub(crate) fn mark_submap(&mut self) {
        self.submap = true;
    }

    pub(crate) fn clear_submap(&mut self) {
        self.submap = false;
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("space", &self.space)
            .field("vaddr", &self.vaddr())
            .field("depth", &self.depth)
            .field("size", &self.size())
            .field("tag", &self.tag.raw())
            .field("submap", &self.submap)
            .finish()
    }
}

/// Handle to a mapping inside a locked frame.
///
/// A reference is only meaningful within the lookup/free cycle that produced
/// it: it records the frame and the tree generation, and every access through
/// a [`FrameGuard`](crate::frame::FrameGuard) re-validates both. Inserting and
/// the pack at the end of every cycle bump the generation, so handles taken
/// before either are rejected with [`MapdbError::StaleMapping`](crate::MapdbError::StaleMapping).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappingRef {
    pub(crate) frame: u32,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl MappingRef {
    /// Index of the frame slot this mapping lives in.
    #[inline]
    pub const fn frame_index(&self) -> usize {
        self.frame as usize
    }

    /// Array slot inside the frame's mapping tree.
    #[inline]
    pub const fn slot(&self) -> usize {
        self.slot as usize
    }
}
