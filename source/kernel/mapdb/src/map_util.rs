// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Flexpage map/grant/unmap on top of the mapping database and page tables
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: mem_map(), mem_fpage_unmap(), fpage_unmap(), MapOutcome, FlushMode
//! DEPENDS_ON: mapdb, mem_space, fpage
//! INVARIANTS: Every page-table entry created for a RAM frame has a mapdb entry whose
//!             parent is the sender's (or sigma0's) mapping; a frame lock is held for
//!             at most one page at a time
//! ADR: docs/adr/0001-mapping-database.md
//!
//! Sigma0 owns every frame by identity: it is never looked up in a page table
//! and its mappings are the roots of the mapping trees. A base page carved out
//! of a superpage at a nonzero offset derives from the sigma0 root of its own
//! frame rather than from the superpage mapping.

extern crate alloc;

use alloc::collections::BTreeSet;

use crate::addr::{align_down, PhysAddr, SpaceId, Tag, VirtAddr, PAGE_MASK, PAGE_SIZE};
use crate::error::IpcError;
use crate::fpage::Fpage;
use crate::frame::FrameGuard;
use crate::iter::Restriction;
use crate::mapdb::Mapdb;
use crate::mapping::{Mapping, MappingRef};
use crate::mem_space::{InsertStatus, MemSpace, PageAttribs, PageEntry, SpaceDirectory};
use crate::tree::SubmapOps;

/// What a map operation achieved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapOutcome {
    /// At least one page reached the receiver.
    pub received: bool,
    /// Pages entered, upgraded or granted.
    pub pages: usize,
}

/// How an unmap treats the affected page-table entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Remove translations and mapping-database entries.
    Unmap,
    /// Keep everything but drop write access of the derived mappings.
    RevokeWrite,
}

impl FlushMode {
    fn revoke(self) -> PageAttribs {
        match self {
            FlushMode::Unmap => PageAttribs::all(),
            FlushMode::RevokeWrite => PageAttribs::WRITABLE,
        }
    }
}

const SIGMA0_ATTRIBS: PageAttribs = PageAttribs::WRITABLE.union(PageAttribs::USER);

/// Maps (or grants) the region of `from_fpage` in `from` into the region of
/// `to_fpage` in `to`.
///
/// The transfer covers the smaller of the two windows. `offset` picks which
/// aligned chunk of the larger window takes part: a chunk of the send window
/// sized like the receive window, or the other way round. Pages the sender
/// has no translation for are skipped, as are receiver addresses already
/// holding a different frame.
#[allow(clippy::too_many_arguments)]
pub fn mem_map<D: SpaceDirectory>(
    mapdb: &Mapdb,
    spaces: &mut D,
    from: SpaceId,
    from_fpage: Fpage,
    to: SpaceId,
    to_fpage: Fpage,
    offset: usize,
    tag: Tag,
) -> Result<MapOutcome, IpcError> {
    let cfg = mapdb.config();
    let snd = from_fpage.region(cfg);
    let rcv = to_fpage.region(cfg);
    if snd.is_empty() || rcv.is_empty() {
        log_debug!(target: "map_util", "fpage transfer {} -> {} is a no-op", from, to);
        return Ok(MapOutcome::default());
    }
    if spaces.get(to).is_none() || (!from.is_sigma0() && spaces.get(from).is_none()) {
        return Err(IpcError::NotFound);
    }

    let offset = offset & PAGE_MASK;
    let len = snd.size.min(rcv.size);
    let (mut snd_addr, mut rcv_addr) = if snd.size > rcv.size {
        (snd.start.raw().saturating_add(align_down(offset % snd.size, rcv.size)), rcv.start.raw())
    } else if rcv.size > snd.size {
        (snd.start.raw(), rcv.start.raw().saturating_add(align_down(offset % rcv.size, snd.size)))
    } else {
        (snd.start.raw(), rcv.start.raw())
    };
    let mut transfer = Transfer {
        mapdb,
        spaces,
        from,
        to,
        write: from_fpage.is_write(),
        grant: from_fpage.is_grant(),
        tag,
        rcv_end: rcv_addr.saturating_add(len),
        outcome: MapOutcome::default(),
    };

    let mut left = len;
    while left > 0 && rcv_addr < cfg.user_max && snd_addr < cfg.user_max {
        let size = transfer.page(VirtAddr::new(snd_addr), left, VirtAddr::new(rcv_addr))?;
        left = left.saturating_sub(size);
        snd_addr = snd_addr.saturating_add(size);
        rcv_addr = rcv_addr.saturating_add(size);
    }
    Ok(transfer.outcome)
}

struct Transfer<'a, D: SpaceDirectory> {
    mapdb: &'a Mapdb,
    spaces: &'a mut D,
    from: SpaceId,
    to: SpaceId,
    write: bool,
    grant: bool,
    tag: Tag,
    rcv_end: usize,
    outcome: MapOutcome,
}

impl<'a, D: SpaceDirectory> Transfer<'a, D> {
    /// Transfers the page at `snd_addr`; returns how many bytes were consumed.
    fn page(&mut self, snd_addr: VirtAddr, left: usize, rcv_addr: VirtAddr) -> Result<usize, IpcError> {
        let mapdb: &'a Mapdb = self.mapdb;
        let cfg = mapdb.config();
        let entry = if self.from.is_sigma0() {
            let size = cfg.largest_page();
            PageEntry {
                phys: PhysAddr::new(align_down(snd_addr.raw(), size)),
                size,
                attribs: SIGMA0_ATTRIBS,
            }
        } else {
            match self.spaces.get(self.from).and_then(|s| s.v_lookup(snd_addr)) {
                Some(entry) => entry,
                None => return Ok(PAGE_SIZE),
            }
        };

        let mut phys = entry.phys;
        let mut size = entry.size;
        let mut attribs = entry.attribs - PageAttribs::ACCESS_STATUS;
        let mut parent_space = self.from;
        let mut parent_addr = snd_addr;
        let mut grant = self.grant;

        let existing = self.spaces.get(self.to).and_then(|s| s.v_lookup(rcv_addr));
        if size > PAGE_SIZE {
            let room = match existing {
                Some(_) => size,
                None => self.spaces.get(self.to).map_or(PAGE_SIZE, |s| s.hole_size(rcv_addr)),
            };
            let fits = size <= left
                && rcv_addr.is_aligned(size)
                && rcv_addr.raw().saturating_add(size) <= self.rcv_end
                && room >= size;
            if !fits {
                if grant {
                    log_warn!(
                        target: "map_util",
                        "cannot grant part of a superpage ({} {:?} -> {} {:?}), mapping instead",
                        self.from,
                        snd_addr,
                        self.to,
                        rcv_addr
                    );
                    grant = false;
                }
                size = PAGE_SIZE;
                let super_offset = snd_addr.raw() & (entry.size - 1) & PAGE_MASK;
                if super_offset != 0 {
                    phys = phys.offset(super_offset);
                    parent_space = SpaceId::SIGMA0;
                    parent_addr = VirtAddr::new(phys.raw());
                }
            }
        }

        let tracked = mapdb.covers(phys);
        let mut cycle: Option<(MappingRef, FrameGuard<'a>)> = None;
        if let Some(r) = existing {
            let r_base = align_down(rcv_addr.raw(), r.size);
            let same_frame = if r.size >= size {
                r.phys.offset(rcv_addr.raw() - r_base) == phys
            } else {
                phys.offset(snd_addr.raw() & (size - 1)) == r.phys
            };
            if !same_frame {
                return Ok(size);
            }
            if tracked {
                // Upgrade only what was derived from the sender.
                let Ok((mine, guard)) = mapdb.lookup(self.to, rcv_addr, r.phys) else {
                    return Ok(size);
                };
                let Ok(Some(parent)) = guard.parent(mine) else { return Ok(size) };
                if guard.get(parent).map(Mapping::space) != Ok(parent_space) {
                    return Ok(size);
                }
                cycle = Some((parent, guard));
            }
        } else if tracked {
            match mapdb.lookup(parent_space, parent_addr, phys) {
                Ok(found) => cycle = Some(found),
                Err(e) => {
                    log_debug!(
                        target: "map_util",
                        "no parent mapping {} {:?} for {:?}: {}",
                        parent_space,
                        parent_addr,
                        phys,
                        e
                    );
                    return Ok(size);
                }
            }
        }

        if !self.write {
            attribs.remove(PageAttribs::WRITABLE);
        }
        let status = match self.spaces.get_mut(self.to) {
            Some(s) => s.v_insert(phys, rcv_addr, size, attribs),
            None => return Err(IpcError::NotFound),
        };

        let mut result = Ok(size);
        match status {
            InsertStatus::Ok | InsertStatus::WarnExists | InsertStatus::WarnAttribUpgrade => {
                if grant {
                    if let Some((node, guard)) = cycle.as_mut() {
                        if let Err(e) = mapdb.grant(guard, *node, self.to, rcv_addr, &mut ()) {
                            log_warn!(target: "map_util", "grant from {} failed: {}", self.from, e);
                            if status == InsertStatus::Ok {
                                self.unmap_receiver(rcv_addr, size);
                            }
                            result = Err(e.into());
                        }
                    }
                    if result.is_ok() && !self.from.is_sigma0() {
                        if let Some(s) = self.spaces.get_mut(self.from) {
                            s.v_delete(snd_addr, size, PageAttribs::all());
                        }
                        self.spaces.flush_tlb(self.from);
                    }
                } else if status == InsertStatus::Ok {
                    if let Some((parent, guard)) = cycle.as_mut() {
                        if let Err(e) = mapdb.insert(guard, *parent, self.to, rcv_addr, size, self.tag)
                        {
                            log_warn!(
                                target: "map_util",
                                "mapdb insert for {} {:?} failed: {}, rolling back",
                                self.to,
                                rcv_addr,
                                e
                            );
                            self.unmap_receiver(rcv_addr, size);
                            result = Err(e.into());
                        }
                    }
                }
                if result.is_ok() {
                    self.outcome.received = true;
                    self.outcome.pages += 1;
                }
            }
            InsertStatus::ErrNomem => result = Err(IpcError::RemapFailed),
            InsertStatus::ErrExists => {
                log_debug!(target: "map_util", "{} already maps another frame at {:?}", self.to, rcv_addr);
            }
        }
        drop(cycle);
        result
    }

    fn unmap_receiver(&mut self, va: VirtAddr, size: usize) {
        if let Some(s) = self.spaces.get_mut(self.to) {
            s.v_delete(va, size, PageAttribs::all());
        }
    }
}

/// Page-table side of an unmap: applies the revocation to every affected
/// space and collects access-status bits.
struct UnmapOps<'d, D: SpaceDirectory> {
    spaces: &'d mut D,
    revoke: PageAttribs,
    access: PageAttribs,
    touched: BTreeSet<SpaceId>,
}

impl<D: SpaceDirectory> UnmapOps<'_, D> {
    fn delete(&mut self, space: SpaceId, va: VirtAddr, size: usize) {
        // A destroyed space may still own mapdb entries.
        if let Some(s) = self.spaces.get_mut(space) {
            self.access |= s.v_delete(va, size, self.revoke);
            self.touched.insert(space);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn unmap_page(
        &mut self,
        mapdb: &Mapdb,
        space: SpaceId,
        va: VirtAddr,
        phys: PhysAddr,
        entry: (usize, usize),
        me_too: bool,
        restriction: Option<&Restriction>,
        mode: FlushMode,
    ) {
        let (base, size) = entry;
        let subpage = size > PAGE_SIZE && va.raw() != base;
        let lookup = if subpage {
            mapdb.lookup(SpaceId::SIGMA0, VirtAddr::new(phys.raw()), phys)
        } else {
            mapdb.lookup(space, va, phys)
        };
        let (node, mut guard) = match lookup {
            Ok(found) => found,
            Err(e) => {
                log_error!(
                    target: "map_util",
                    "{} maps {:?} at {:?} without mapdb entry: {}",
                    space,
                    phys,
                    va,
                    e
                );
                return;
            }
        };

        if me_too && !subpage && !space.is_sigma0() {
            self.delete(space, VirtAddr::new(base), size);
        }

        match mode {
            FlushMode::Unmap => {
                let me_too = me_too && !guard.get(node).map_or(true, Mapping::is_root);
                if let Err(e) = guard.flush(node, me_too, restriction, self) {
                    log_error!(target: "map_util", "flush below {:?} failed: {}", phys, e);
                }
            }
            FlushMode::RevokeWrite => match guard.descendants(node, restriction.cloned()) {
                Ok(derived) => {
                    for (_, m) in derived {
                        self.delete(m.space(), m.vaddr(), m.size());
                    }
                }
                Err(e) => log_error!(target: "map_util", "walk below {:?} failed: {}", phys, e),
            },
        }
        guard.free();
    }
}

impl<D: SpaceDirectory> SubmapOps for UnmapOps<'_, D> {
    fn flushed(&mut self, mapping: &Mapping) {
        self.delete(mapping.space(), mapping.vaddr(), mapping.size());
    }
}

/// Revokes the region `fpage` of `space` from every space it was mapped into,
/// and from `space` itself if `me_too`.
///
/// Returns the union of the referenced/dirty bits of the affected entries.
/// Superpages that lie only partly inside the region are left alone when
/// `me_too` is set.
pub fn mem_fpage_unmap<D: SpaceDirectory>(
    mapdb: &Mapdb,
    spaces: &mut D,
    space: SpaceId,
    fpage: Fpage,
    me_too: bool,
    restriction: Option<&Restriction>,
    mode: FlushMode,
) -> Result<PageAttribs, IpcError> {
    let cfg = mapdb.config();
    let region = fpage.region(cfg);
    let end = region.end().min(cfg.user_max);
    let sigma0 = space.is_sigma0();
    if !sigma0 && spaces.get(space).is_none() {
        return Err(IpcError::NotFound);
    }

    let mut ops = UnmapOps {
        spaces,
        revoke: mode.revoke(),
        access: PageAttribs::empty(),
        touched: BTreeSet::new(),
    };
    let mut address = region.start.raw();
    while address < end {
        let va = VirtAddr::new(address);
        let entry = if sigma0 {
            Some(PageEntry {
                phys: PhysAddr::new(address & PAGE_MASK),
                size: PAGE_SIZE,
                attribs: SIGMA0_ATTRIBS,
            })
        } else {
            ops.spaces.get(space).and_then(|s| s.v_lookup(va))
        };
        let Some(entry) = entry else {
            let hole = ops.spaces.get(space).map_or(PAGE_SIZE, |s| s.hole_size(va));
            address = align_down(address, hole).saturating_add(hole);
            continue;
        };

        let base = align_down(address, entry.size);
        let next = base.saturating_add(entry.size);
        if entry.size > PAGE_SIZE && me_too && (next > end || address != base) {
            log_warn!(target: "map_util", "cannot split superpage of {} at {:#x} in unmap", space, base);
            address = next;
            continue;
        }

        if !mapdb.covers(entry.phys) {
            if me_too && !sigma0 {
                ops.delete(space, VirtAddr::new(base), entry.size);
            }
            address = next;
            continue;
        }

        let mut phys = entry.phys.offset(address - base);
        while address < end && address < next {
            ops.unmap_page(
                mapdb,
                space,
                VirtAddr::new(address),
                phys,
                (base, entry.size),
                me_too,
                restriction,
                mode,
            );
            address += PAGE_SIZE;
            phys = phys.offset(PAGE_SIZE);
        }
    }

    let UnmapOps { spaces, access, touched, .. } = ops;
    for id in touched {
        spaces.flush_tlb(id);
    }
    Ok(access & PageAttribs::ACCESS_STATUS)
}

/// Unmap entry point for flexpages of any kind. Only memory flexpages are
/// supported.
pub fn fpage_unmap<D: SpaceDirectory>(
    mapdb: &Mapdb,
    spaces: &mut D,
    space: SpaceId,
    fpage: Fpage,
    me_too: bool,
    mode: FlushMode,
) -> Result<PageAttribs, IpcError> {
    if fpage.is_io() {
        log_debug!(target: "map_util", "I/O flexpage {:#x} rejected", fpage.raw());
        return Err(IpcError::InvalidFpage);
    }
    mem_fpage_unmap(mapdb, spaces, space, fpage, me_too, None, mode)
}
