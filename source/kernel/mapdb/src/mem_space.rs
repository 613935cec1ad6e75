// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table collaborator of the map/unmap glue
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemSpace, SpaceDirectory, PageAttribs, PageEntry, InsertStatus,
//!             SoftMemSpace, SpaceTable
//! DEPENDS_ON: addr, bitflags
//! INVARIANTS: Entries never overlap; a superpage entry is aligned to its size
//!
//! The mapping database never touches page tables itself. The glue in
//! [`map_util`](crate::map_util) drives an implementation of [`MemSpace`] per
//! address space. [`SoftMemSpace`] is a software page table with the same
//! semantics, used by hosted builds and tests.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::addr::{align_down, PhysAddr, SpaceId, VirtAddr, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Attributes of a page-table entry.
    pub struct PageAttribs: u32 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const NONCACHEABLE = 1 << 2;
        /// Set by hardware on access.
        const REFERENCED = 1 << 3;
        /// Set by hardware on write.
        const DIRTY = 1 << 4;
    }
}

impl PageAttribs {
    /// Bits reported back to the caller of an unmap.
    pub const ACCESS_STATUS: Self = Self::REFERENCED.union(Self::DIRTY);
}

/// One translation as reported by [`MemSpace::v_lookup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    /// Physical base of the page (aligned to `size`).
    pub phys: PhysAddr,
    pub size: usize,
    pub attribs: PageAttribs,
}

/// Result of [`MemSpace::v_insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    /// New entry created.
    Ok,
    /// Identical entry already present.
    WarnExists,
    /// Entry for the same frame present; attributes were widened.
    WarnAttribUpgrade,
    /// No memory for page-table pages.
    ErrNomem,
    /// A different frame is mapped at the address.
    ErrExists,
}

/// Page table of one address space.
pub trait MemSpace {
    fn id(&self) -> SpaceId;

    /// Translation of the page containing `va`.
    fn v_lookup(&self, va: VirtAddr) -> Option<PageEntry>;

    /// Size of the unmapped region around `va` (for an address with no
    /// translation). A result at least the superpage size means a superpage
    /// fits there.
    fn hole_size(&self, _va: VirtAddr) -> usize {
        PAGE_SIZE
    }

    fn v_insert(&mut self, phys: PhysAddr, va: VirtAddr, size: usize, attribs: PageAttribs) -> InsertStatus;

    /// Removes `revoke` from every entry in `[va, va + size)`; an entry loses
    /// its translation when `revoke` is [`PageAttribs::all`]. Returns the union
    /// of the attributes the entries held, access-status bits included, and
    /// clears the reported access-status bits.
    fn v_delete(&mut self, va: VirtAddr, size: usize, revoke: PageAttribs) -> PageAttribs;
}

/// Resolves space identifiers to page tables.
pub trait SpaceDirectory {
    type Space: MemSpace;

    fn get(&self, id: SpaceId) -> Option<&Self::Space>;

    fn get_mut(&mut self, id: SpaceId) -> Option<&mut Self::Space>;

    /// Stale translations of `id` may be cached and must be flushed.
    fn flush_tlb(&mut self, _id: SpaceId) {}
}

/// Software page table keyed by virtual base address.
#[derive(Debug)]
pub struct SoftMemSpace {
    id: SpaceId,
    superpage_size: usize,
    entries: BTreeMap<usize, PageEntry>,
    limit: Option<usize>,
}

impl SoftMemSpace {
    pub fn new(id: SpaceId, superpage_shift: u32) -> Self {
        Self { id, superpage_size: 1 << superpage_shift, entries: BTreeMap::new(), limit: None }
    }

    /// Refuses inserts with `ErrNomem` once `entries` translations exist.
    pub fn with_limit(mut self, entries: usize) -> Self {
        self.limit = Some(entries);
        self
    }

    /// Number of translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Simulates a hardware access to `va`.
    pub fn touch(&mut self, va: VirtAddr, write: bool) -> bool {
        let Some(base) = self.covering(va.raw()) else { return false };
        match self.entries.get_mut(&base) {
            Some(e) => {
                e.attribs |= PageAttribs::REFERENCED;
                if write {
                    e.attribs |= PageAttribs::DIRTY;
                }
                true
            }
            None => false,
        }
    }

    fn covering(&self, va: usize) -> Option<usize> {
        let (&base, e) = self.entries.range(..=va).next_back()?;
        (va - base < e.size).then_some(base)
    }
}

impl MemSpace for SoftMemSpace {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn v_lookup(&self, va: VirtAddr) -> Option<PageEntry> {
        let base = self.covering(va.raw())?;
        self.entries.get(&base).copied()
    }

    fn hole_size(&self, va: VirtAddr) -> usize {
        let base = align_down(va.raw(), self.superpage_size);
        let free = self.covering(base).is_none()
            && self.entries.range(base..base.saturating_add(self.superpage_size)).next().is_none();
        if free {
            self.superpage_size
        } else {
            PAGE_SIZE
        }
    }

    fn v_insert(&mut self, phys: PhysAddr, va: VirtAddr, size: usize, attribs: PageAttribs) -> InsertStatus {
        let va = va.raw();
        let attribs = attribs - PageAttribs::ACCESS_STATUS;
        if let Some(base) = self.covering(va) {
            let Some(e) = self.entries.get_mut(&base) else { return InsertStatus::ErrExists };
            if size > e.size || e.phys.offset(va - base) != phys {
                return InsertStatus::ErrExists;
            }
            if e.attribs.contains(attribs) {
                return InsertStatus::WarnExists;
            }
            e.attribs |= attribs;
            return InsertStatus::WarnAttribUpgrade;
        }
        if self.entries.range(va..va.saturating_add(size)).next().is_some() {
            return InsertStatus::ErrExists;
        }
        if self.limit.is_some_and(|limit| self.entries.len() >= limit) {
            return InsertStatus::ErrNomem;
        }
        self.entries.insert(va, PageEntry { phys, size, attribs });
        InsertStatus::Ok
    }

    fn v_delete(&mut self, va: VirtAddr, size: usize, revoke: PageAttribs) -> PageAttribs {
        let va = va.raw();
        let mut bases: Vec<usize> = self.covering(va).into_iter().collect();
        bases.extend(self.entries.range(va..va.saturating_add(size)).map(|(&b, _)| b));
        bases.dedup();

        let mut prior = PageAttribs::empty();
        for base in bases {
            if revoke == PageAttribs::all() {
                if let Some(e) = self.entries.remove(&base) {
                    prior |= e.attribs;
                }
            } else if let Some(e) = self.entries.get_mut(&base) {
                prior |= e.attribs;
                e.attribs.remove(revoke | PageAttribs::ACCESS_STATUS);
            }
        }
        prior
    }
}

/// Directory of software page tables, counting TLB flush requests.
#[derive(Debug, Default)]
pub struct SpaceTable {
    spaces: BTreeMap<SpaceId, SoftMemSpace>,
    tlb_flushes: BTreeMap<SpaceId, usize>,
}

impl SpaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, space: SoftMemSpace) {
        self.spaces.insert(space.id(), space);
    }

    pub fn remove(&mut self, id: SpaceId) -> Option<SoftMemSpace> {
        self.spaces.remove(&id)
    }

    /// TLB flushes requested for `id` so far.
    pub fn tlb_flushes(&self, id: SpaceId) -> usize {
        self.tlb_flushes.get(&id).copied().unwrap_or(0)
    }
}

impl SpaceDirectory for SpaceTable {
    type Space = SoftMemSpace;

    fn get(&self, id: SpaceId) -> Option<&SoftMemSpace> {
        self.spaces.get(&id)
    }

    fn get_mut(&mut self, id: SpaceId) -> Option<&mut SoftMemSpace> {
        self.spaces.get_mut(&id)
    }

    fn flush_tlb(&mut self, id: SpaceId) {
        *self.tlb_flushes.entry(id).or_insert(0) += 1;
    }
}
