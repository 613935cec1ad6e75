// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-frame lock and the guard that scopes one lookup/free cycle
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameGuard, register_context_id()
//! DEPENDS_ON: spin::mutex::TicketMutex, tree, iter, stats
//! INVARIANTS: At most one insert per cycle; the tree is packed before the lock is
//!             released; a context never re-acquires a frame it already holds
//! ADR: docs/adr/0001-mapping-database.md

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::mutex::{TicketMutex, TicketMutexGuard};

use crate::addr::{SpaceId, Tag, VirtAddr, PAGE_SHIFT};
use crate::error::MapdbError;
use crate::iter::{Children, Descendants, Restriction};
use crate::mapping::{Mapping, MappingRef};
use crate::stats::Counters;
use crate::tree::{MappingTree, PackOutcome, SubmapOps};

/// Context-id source used for re-entrancy detection. Returns 0 when unknown.
static CONTEXT_ID_FN: AtomicPtr<()> = AtomicPtr::new(no_context as fn() -> usize as *mut ());

fn no_context() -> usize {
    0
}

/// Registers the function naming the running execution context (CPU or
/// thread). Once set, locking a frame the current context already holds
/// panics instead of deadlocking.
pub fn register_context_id(f: fn() -> usize) {
    CONTEXT_ID_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn current_context() -> usize {
    let ptr = CONTEXT_ID_FN.load(Ordering::Acquire);
    // SAFETY: The pointer was stored via `register_context_id`, which takes a
    // valid `fn() -> usize`, or it's the initial `no_context`.
    let f: fn() -> usize = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Lock plus mapping tree of one physical frame.
pub(crate) struct Frame {
    tree: TicketMutex<MappingTree>,
    holder: AtomicUsize,
}

impl Frame {
    pub(crate) fn new(tree: MappingTree) -> Self {
        Self { tree: TicketMutex::new(tree), holder: AtomicUsize::new(0) }
    }

    fn check_reentry(&self, index: u32) -> usize {
        let ctx = current_context();
        if ctx != 0 && self.holder.load(Ordering::Acquire) == ctx {
            log_error!(target: "mapdb", "frame {}: re-entrant lock by context {}", index, ctx);
            panic!("mapdb: re-entrant frame lock");
        }
        ctx
    }

    /// Runs `f` on the tree under the frame lock without starting a lookup
    /// cycle: nothing is packed on release.
    pub(crate) fn inspect<R>(&self, index: u32, f: impl FnOnce(&MappingTree) -> R) -> R {
        self.check_reentry(index);
        let tree = self.tree.lock();
        f(&tree)
    }

    pub(crate) fn lock<'a>(&'a self, index: u32, stats: &'a Counters) -> FrameGuard<'a> {
        let ctx = self.check_reentry(index);
        let tree = match self.tree.try_lock() {
            Some(tree) => tree,
            None => {
                log_trace!(target: "mapdb", "frame {}: contended", index);
                self.tree.lock()
            }
        };
        self.holder.store(ctx, Ordering::Release);
        FrameGuard { frame: self, tree, index, inserted: false, stats }
    }
}

/// Exclusive access to one frame's mapping tree.
///
/// Obtained from [`Mapdb::lookup`](crate::Mapdb::lookup). Every
/// [`MappingRef`] handed out is tied to this guard's frame and tree
/// generation. Dropping the guard (or calling [`free`](Self::free)) packs the
/// tree so that the next cycle can insert, then releases the lock.
pub struct FrameGuard<'a> {
    frame: &'a Frame,
    tree: TicketMutexGuard<'a, MappingTree>,
    index: u32,
    inserted: bool,
    stats: &'a Counters,
}

impl<'a> FrameGuard<'a> {
    /// Frame slot this guard locks.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Read-only view of the locked tree.
    #[inline]
    pub fn tree(&self) -> &MappingTree {
        &self.tree
    }

    fn slot_of(&self, r: MappingRef) -> Result<usize, MapdbError> {
        if r.frame != self.index || r.generation != self.tree.generation() {
            return Err(MapdbError::StaleMapping);
        }
        match self.tree.get(r.slot()) {
            Some(_) => Ok(r.slot()),
            None => Err(MapdbError::StaleMapping),
        }
    }

    #[inline]
    fn handle(&self, slot: usize) -> MappingRef {
        MappingRef { frame: self.index, slot: slot as u32, generation: self.tree.generation() }
    }

    pub fn get(&self, r: MappingRef) -> Result<&Mapping, MapdbError> {
        let slot = self.slot_of(r)?;
        self.tree.get(slot).ok_or(MapdbError::StaleMapping)
    }

    /// The sigma0 root of the frame.
    pub fn root(&self) -> MappingRef {
        self.handle(0)
    }

    /// Mapping `space` holds at `va` in this frame, if any.
    pub fn find(&self, space: SpaceId, va: VirtAddr) -> Option<MappingRef> {
        self.tree.find(space, va).map(|slot| self.handle(slot))
    }

    /// Parent of `r`; `None` for the root.
    pub fn parent(&self, r: MappingRef) -> Result<Option<MappingRef>, MapdbError> {
        let slot = self.slot_of(r)?;
        Ok(self.tree.parent(slot).map(|p| self.handle(p)))
    }

    /// Next live mapping after `r` in preorder, across the whole tree.
    pub fn next_iter(&self, r: MappingRef) -> Result<Option<MappingRef>, MapdbError> {
        let slot = self.slot_of(r)?;
        Ok(self.tree.next_iter(slot).map(|s| self.handle(s)))
    }

    /// Next direct child of `parent` after `cursor`; pass `parent` as the
    /// cursor to get the first child.
    pub fn next_child(
        &self,
        parent: MappingRef,
        cursor: MappingRef,
    ) -> Result<Option<MappingRef>, MapdbError> {
        let p = self.slot_of(parent)?;
        let c = self.slot_of(cursor)?;
        Ok(self.tree.next_child(p, c).map(|s| self.handle(s)))
    }

    pub fn children(&self, r: MappingRef) -> Result<Children<'_>, MapdbError> {
        let slot = self.slot_of(r)?;
        Ok(Children::new(&self.tree, self.index, slot))
    }

    /// Preorder walk over everything derived from `r`, optionally limited to
    /// one access path.
    pub fn descendants(
        &self,
        r: MappingRef,
        restriction: Option<Restriction>,
    ) -> Result<Descendants<'_>, MapdbError> {
        let slot = self.slot_of(r)?;
        Ok(Descendants::new(&self.tree, self.index, slot, restriction))
    }

    /// Records that `space` received `1 << size_shift` bytes at `va` from `parent`.
    ///
    /// Only one insert may succeed per cycle. Every handle taken before the
    /// insert, except the returned one, is stale afterwards.
    pub fn insert(
        &mut self,
        parent: MappingRef,
        space: SpaceId,
        va: VirtAddr,
        size_shift: u8,
        tag: Tag,
    ) -> Result<MappingRef, MapdbError> {
        if self.inserted {
            return Err(MapdbError::InsertLimit);
        }
        let slot = self.slot_of(parent)?;
        let parent_map = *self.tree.get(slot).ok_or(MapdbError::StaleMapping)?;
        // The root stands for sigma0's identity mapping and may hand out any size.
        if (size_shift as u32) < PAGE_SHIFT
            || size_shift as u32 >= usize::BITS
            || (!parent_map.is_root() && size_shift > parent_map.size_shift())
        {
            return Err(MapdbError::UnsupportedSize);
        }
        let new = self.tree.insert(slot, space, va, size_shift, tag)?;
        self.inserted = true;
        self.stats.insert();
        log_trace!(
            target: "mapdb",
            "frame {}: {} -> {} at {:?}",
            self.index,
            parent_map.space(),
            space,
            va
        );
        Ok(self.handle(new))
    }

    /// Removes what was derived from `node` (and `node` itself if `me_too`).
    /// Returns the number of mappings removed.
    pub fn flush<O: SubmapOps>(
        &mut self,
        node: MappingRef,
        me_too: bool,
        restriction: Option<&Restriction>,
        ops: &mut O,
    ) -> Result<usize, MapdbError> {
        let slot = self.slot_of(node)?;
        let removed = self.tree.flush(slot, me_too, restriction, ops)?;
        self.stats.flushed(removed);
        Ok(removed)
    }

    /// Moves `node` to `space`/`va`; its descendants stay attached.
    pub fn grant<O: SubmapOps>(
        &mut self,
        node: MappingRef,
        space: SpaceId,
        va: VirtAddr,
        ops: &mut O,
    ) -> Result<(), MapdbError> {
        let slot = self.slot_of(node)?;
        self.tree.grant(slot, space, va, ops)?;
        self.stats.grant();
        Ok(())
    }

    /// Ends the cycle. Equivalent to dropping the guard.
    pub fn free(self) {}
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.tree.pack();
        self.stats.packed(outcome);
        if outcome == PackOutcome::Exhausted {
            log_warn!(
                target: "mapdb",
                "frame {}: tree full at {} mappings, next insert will fail",
                self.index,
                self.tree.count()
            );
        }
        self.frame.holder.store(0, Ordering::Release);
    }
}
