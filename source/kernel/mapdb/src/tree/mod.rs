// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Array-backed, depth-annotated preorder encoding of one frame's derivation tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MappingTree, SubmapOps, PackOutcome
//! DEPENDS_ON: mapping, config (size policy), iter::Restriction
//! INVARIANTS: Slot 0 is the sigma0 root; a node's subtree is the maximal run of later
//!             live entries deeper than the node; count/empty match the slot array
//! ADR: docs/adr/0001-mapping-database.md
//!
//! Example encoding (slot, depth):
//!
//! ```text
//! 0 0   root            0
//! 1 1   child of 0    /   \
//! 2 2   child of 1   1     5
//! 3 2   child of 1  / \
//! 4 3   child of 3 2   3
//! 5 1   child of 0     |
//!                      4
//! ```
//!
//! Flushed entries become holes (`None`) and stay in place until the next
//! [`MappingTree::pack`], so every handle to a surviving entry stays valid for
//! the rest of the lock cycle. Holes at the tail are trimmed immediately.

extern crate alloc;

use alloc::vec::Vec;

use crate::addr::{SpaceId, Tag, VirtAddr};
use crate::config::{capacity_for, DEPTH_MAX, SIZE_ID_MAX};
use crate::error::MapdbError;
use crate::iter::Restriction;
use crate::mapping::Mapping;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicUsize, Ordering};

/// Page-table side effects of tree mutations.
///
/// The mapping database only edits its own bookkeeping; whoever drives a flush
/// or grant supplies an implementation that mirrors each change into the
/// affected page tables.
pub trait SubmapOps {
    /// Called once per mapping removed by a flush, in preorder.
    fn flushed(&mut self, _mapping: &Mapping) {}

    /// Called after `old` has been relabelled to `new` by a grant.
    fn granted(&mut self, _old: &Mapping, _new: &Mapping) {}
}

/// Bookkeeping only; no page-table updates.
impl SubmapOps for () {}

/// What [`MappingTree::pack`] did to guarantee room for the next insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackOutcome {
    /// Last slot already free; nothing moved.
    Unchanged,
    /// Copied into the next smaller array.
    Shrunk,
    /// Holes squeezed out in place.
    Compacted,
    /// Copied into the next larger array.
    Grown,
    /// Growth was needed but impossible; the tree may refuse the next insert.
    Exhausted,
}

/// Frame number plus one whose next allocation fails; 0 when disarmed.
#[cfg(feature = "failpoints")]
static DENY_NEXT_ALLOC: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_NEXT_ALLOC;
    use core::sync::atomic::Ordering;

    /// Forces the next resize of frame `pfn`'s mapping tree to fail with
    /// `OutOfMemory`. Creating a tree is not affected.
    pub fn deny_next_alloc(pfn: usize) {
        DENY_NEXT_ALLOC.store(pfn + 1, Ordering::SeqCst);
    }
}

/// Derivation tree of one frame.
#[derive(Debug)]
pub struct MappingTree {
    entries: Vec<Option<Mapping>>,
    count: usize,
    empty: usize,
    size_id: u8,
    generation: u32,
}

fn alloc_slots(pfn: usize, size_id: u8) -> Result<Vec<Option<Mapping>>, MapdbError> {
    #[cfg(feature = "failpoints")]
    if size_id > 0
        && DENY_NEXT_ALLOC
            .compare_exchange(pfn + 1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        return Err(MapdbError::OutOfMemory);
    }
    #[cfg(not(feature = "failpoints"))]
    let _ = pfn;
    let mut slots = Vec::new();
    slots.try_reserve_exact(capacity_for(size_id)).map_err(|_| MapdbError::OutOfMemory)?;
    Ok(slots)
}

impl MappingTree {
    /// Creates the smallest tree holding only the sigma0 root of frame `pfn`.
    pub fn new(pfn: usize) -> Result<Self, MapdbError> {
        let mut entries = alloc_slots(pfn, 0)?;
        entries.push(Some(Mapping::root(pfn)));
        Ok(Self { entries, count: 1, empty: 0, size_id: 0, generation: 0 })
    }

    /// Copies the live entries into a fresh array of class `size_id`.
    fn resized(&self, size_id: u8) -> Result<Self, MapdbError> {
        debug_assert!(self.count < capacity_for(size_id));
        let mut entries = alloc_slots(self.root().page(), size_id)?;
        entries.extend(self.entries.iter().copied().filter(Option::is_some));
        Ok(Self {
            entries,
            count: self.count,
            empty: 0,
            size_id,
            generation: self.generation.wrapping_add(1),
        })
    }

    /// Number of slots in the backing array.
    #[inline]
    pub fn capacity(&self) -> usize {
        capacity_for(self.size_id)
    }

    /// Number of live mappings, root included.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of flushed slots awaiting compaction.
    #[inline]
    pub fn holes(&self) -> usize {
        self.empty
    }

    #[inline]
    pub fn size_id(&self) -> u8 {
        self.size_id
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Length of the used slot region (live entries plus holes).
    #[inline]
    pub(crate) fn used_len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Option<&Mapping> {
        self.entries.get(slot).and_then(Option::as_ref)
    }

    #[inline]
    pub fn root(&self) -> &Mapping {
        match self.entries.first() {
            Some(Some(root)) => root,
            _ => panic!("mapdb: mapping tree lost its root"),
        }
    }

    /// `true` when at least one insert is guaranteed to find a slot.
    #[inline]
    pub fn last_slot_free(&self) -> bool {
        self.entries.len() < self.capacity() || matches!(self.entries.last(), Some(None))
    }

    /// Live slots in preorder.
    pub fn live_slots(&self) -> impl Iterator<Item = (usize, &Mapping)> + '_ {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| entry.as_ref().map(|m| (slot, m)))
    }

    /// Slot of the mapping `space` holds at `va`, if any.
    pub fn find(&self, space: SpaceId, va: VirtAddr) -> Option<usize> {
        self.live_slots().find(|(_, m)| m.matches(space, va)).map(|(slot, _)| slot)
    }

    /// Next live slot after `slot` in preorder.
    pub fn next_iter(&self, slot: usize) -> Option<usize> {
        let start = slot.checked_add(1)?;
        (start..self.entries.len()).find(|&i| self.entries[i].is_some())
    }

    /// Next slot after `cursor` that still lies inside `parent`'s subtree.
    pub fn next_descendant(&self, parent: usize, cursor: usize) -> Option<usize> {
        let depth = self.get(parent)?.depth();
        let next = self.next_iter(cursor)?;
        match self.get(next) {
            Some(m) if m.depth() > depth => Some(next),
            _ => None,
        }
    }

    /// Next direct child of `parent` after `cursor`.
    ///
    /// Passing `parent` itself as cursor yields the first child. Grandchildren
    /// are stepped over, so a cursor on a child resumes at its next sibling.
    pub fn next_child(&self, parent: usize, cursor: usize) -> Option<usize> {
        let child_depth = self.get(parent)?.depth() + 1;
        let mut at = cursor;
        while let Some(next) = self.next_descendant(parent, at) {
            if self.get(next).map(Mapping::depth) == Some(child_depth) {
                return Some(next);
            }
            at = next;
        }
        None
    }

    /// Parent slot of `slot`; `None` for the root.
    pub fn parent(&self, slot: usize) -> Option<usize> {
        let depth = self.get(slot)?.depth();
        if depth == 0 {
            return None;
        }
        (0..slot).rev().find(|&i| matches!(self.entries[i], Some(m) if m.depth() < depth))
    }

    /// Inserts a new child below `parent`, after the parent's existing children.
    ///
    /// Entries following the insertion point may move by one slot.
    pub fn insert(
        &mut self,
        parent: usize,
        space: SpaceId,
        va: VirtAddr,
        size_shift: u8,
        tag: Tag,
    ) -> Result<usize, MapdbError> {
        let parent_map = *self.get(parent).ok_or(MapdbError::StaleMapping)?;
        if !self.last_slot_free() {
            return Err(MapdbError::TreeFull);
        }
        if parent_map.depth() >= DEPTH_MAX {
            return Err(MapdbError::DepthExhausted);
        }
        let depth = parent_map.depth();

        // Find the insertion point (before a sibling that follows a hole, or
        // at the end of the subtree) and the last hole before it.
        let mut insert_at = None;
        let mut hole = None;
        for i in parent + 1..self.entries.len() {
            match self.entries[i] {
                Some(m) if m.depth() <= depth => {
                    insert_at = Some(i);
                    break;
                }
                None => hole = Some(i),
                Some(m) if hole.is_some() && m.depth() <= depth + 1 => {
                    insert_at = Some(i);
                    break;
                }
                Some(_) => {}
            }
        }
        let insert_at = insert_at.unwrap_or(self.entries.len());

        let slot = if let Some(hole) = hole {
            // Move the tail of the previous sibling up into the hole.
            self.entries[hole..insert_at].rotate_left(1);
            self.empty -= 1;
            insert_at - 1
        } else if let Some(hole) = (insert_at..self.entries.len()).find(|&i| self.entries[i].is_none()) {
            self.entries[insert_at..=hole].rotate_right(1);
            self.empty -= 1;
            insert_at
        } else {
            // last_slot_free() guarantees the array has room to grow by one.
            self.entries.insert(insert_at, None);
            insert_at
        };

        let child_va = va.align_down(1 << size_shift);
        self.entries[slot] = Some(Mapping::new(space, child_va, depth + 1, size_shift, tag));
        self.count += 1;
        if size_shift < parent_map.size_shift() {
            // The parent sits before the insertion point and never moves.
            if let Some(Some(p)) = self.entries.get_mut(parent) {
                p.mark_submap();
            }
        }
        self.generation = self.generation.wrapping_add(1);
        self.debug_verify();
        Ok(slot)
    }

    /// Removes the subtree below `slot` and, if `me_too`, the node itself.
    ///
    /// With a restriction only the subtrees of admitted direct children are
    /// removed; the restriction is ignored when `me_too` removes the node, as
    /// no descendant may outlive it. The root is never removed. Returns the
    /// number of mappings deleted.
    pub fn flush<O: SubmapOps>(
        &mut self,
        slot: usize,
        me_too: bool,
        restriction: Option<&Restriction>,
        ops: &mut O,
    ) -> Result<usize, MapdbError> {
        let node = *self.get(slot).ok_or(MapdbError::StaleMapping)?;
        let remove_self = me_too && !node.is_root();
        let restriction = if remove_self { None } else { restriction };
        let mut removed = 0;

        if remove_self {
            ops.flushed(&node);
            self.entries[slot] = None;
            removed += 1;
        }

        let mut in_scope = true;
        for i in slot + 1..self.entries.len() {
            let Some(m) = self.entries[i] else { continue };
            if m.depth() <= node.depth() {
                break;
            }
            if m.depth() == node.depth() + 1 {
                in_scope = restriction.map_or(true, |r| r.admits(&node, &m));
            }
            if in_scope {
                ops.flushed(&m);
                self.entries[i] = None;
                removed += 1;
            }
        }

        self.count -= removed;
        self.empty += removed;
        while let Some(None) = self.entries.last() {
            self.entries.pop();
            self.empty -= 1;
        }
        if !remove_self && self.next_child(slot, slot).is_none() {
            if let Some(Some(m)) = self.entries.get_mut(slot) {
                m.clear_submap();
            }
        }
        self.debug_verify();
        Ok(removed)
    }

    /// Hands the mapping in `slot` to `space` at `va`, keeping its position and
    /// therefore all of its descendants.
    pub fn grant<O: SubmapOps>(
        &mut self,
        slot: usize,
        space: SpaceId,
        va: VirtAddr,
        ops: &mut O,
    ) -> Result<(), MapdbError> {
        let entry = match self.entries.get_mut(slot) {
            Some(Some(m)) => m,
            _ => return Err(MapdbError::StaleMapping),
        };
        if entry.is_root() {
            return Err(MapdbError::RootImmutable);
        }
        let old = *entry;
        entry.relabel(space, va);
        let new = *entry;
        ops.granted(&old, &new);
        Ok(())
    }

    /// Squeezes holes out of the array in place.
    fn compact(&mut self) {
        if self.empty == 0 {
            return;
        }
        self.entries.retain(Option::is_some);
        self.empty = 0;
    }

    /// End-of-cycle maintenance: afterwards the last slot is free unless the
    /// tree is at its largest size and completely full, or memory ran out.
    ///
    /// Order of preference: shrink when under a quarter full, keep when the
    /// last slot is free, compact when under three quarters full (or no larger
    /// size exists), otherwise grow.
    pub fn pack(&mut self) -> PackOutcome {
        let capacity = self.capacity();
        let outcome = 'policy: {
            if self.size_id > 0 && self.count * 4 < capacity {
                if let Ok(smaller) = self.resized(self.size_id - 1) {
                    *self = smaller;
                    break 'policy PackOutcome::Shrunk;
                }
            }
            if self.last_slot_free() {
                break 'policy PackOutcome::Unchanged;
            }
            let at_max = self.size_id == SIZE_ID_MAX;
            if self.count < capacity / 4 + capacity / 2 || at_max {
                self.compact();
                if at_max && !self.last_slot_free() {
                    break 'policy PackOutcome::Exhausted;
                }
                break 'policy PackOutcome::Compacted;
            }
            match self.resized(self.size_id + 1) {
                Ok(larger) => {
                    *self = larger;
                    PackOutcome::Grown
                }
                Err(_) => {
                    self.compact();
                    if self.last_slot_free() {
                        PackOutcome::Compacted
                    } else {
                        PackOutcome::Exhausted
                    }
                }
            }
        };
        self.generation = self.generation.wrapping_add(1);
        self.debug_verify();
        outcome
    }

    /// Full structural consistency check.
    pub fn check_integrity(&self) -> Result<(), &'static str> {
        if self.entries.len() > self.capacity() {
            return Err("slot region exceeds capacity");
        }
        match self.entries.first() {
            Some(Some(root)) if root.depth() == 0 && root.space().is_sigma0() => {}
            _ => return Err("slot 0 is not the sigma0 root"),
        }
        let mut live = 0;
        let mut holes = 0;
        let mut prev_depth = 0u8;
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                None => holes += 1,
                Some(m) => {
                    live += 1;
                    if i > 0 && (m.depth() == 0 || m.depth() > prev_depth + 1) {
                        return Err("depth breaks preorder encoding");
                    }
                    prev_depth = m.depth();
                }
            }
        }
        if matches!(self.entries.last(), Some(None)) {
            return Err("trailing hole not trimmed");
        }
        if live != self.count {
            return Err("live count mismatch");
        }
        if holes != self.empty {
            return Err("hole count mismatch");
        }
        Ok(())
    }

    #[inline]
    fn debug_verify(&self) {
        if cfg!(any(debug_assertions, feature = "debug_tree_verify")) {
            if let Err(violation) = self.check_integrity() {
                panic!("mapdb: tree integrity violated: {violation}");
            }
        }
    }
}


#[cfg(test)]
mod tests_prop;
