// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cursors over a locked mapping tree, optionally restricted to one access path
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Restriction, Children, Descendants
//! DEPENDS_ON: tree::MappingTree, mapping
//! INVARIANTS: Iterators borrow the frame guard, so they cannot outlive the lock cycle
//!             nor coexist with a mutation or with free()

use core::ops::Range;

use crate::addr::{Tag, VirtAddr};
use crate::mapping::{Mapping, MappingRef};
use crate::tree::MappingTree;

/// Scope of a restricted flush or iteration.
///
/// A direct child of the starting node is admitted when its tag matches (if a
/// tag is set) and the region it covers, placed at the parent's virtual
/// address, overlaps `va`. Everything below an admitted child is admitted too;
/// everything below a rejected child is skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Restriction {
    tag: Option<Tag>,
    va: Range<VirtAddr>,
}

impl Restriction {
    /// Admits every child.
    pub const fn all() -> Self {
        Self { tag: None, va: VirtAddr::new(0)..VirtAddr::new(usize::MAX) }
    }

    /// Admits only children created with `tag`.
    pub const fn tag(tag: Tag) -> Self {
        Self { tag: Some(tag), va: VirtAddr::new(0)..VirtAddr::new(usize::MAX) }
    }

    /// Narrows the restriction to the parent-side address window `[start, end)`.
    pub const fn within(mut self, start: VirtAddr, end: VirtAddr) -> Self {
        self.va = start..end;
        self
    }

    /// Whether the subtree of `child` (a direct child of `parent`) is in scope.
    pub fn admits(&self, parent: &Mapping, child: &Mapping) -> bool {
        if let Some(tag) = self.tag {
            if child.tag() != tag {
                return false;
            }
        }
        let lo = parent.vaddr().raw();
        let hi = lo.saturating_add(child.size());
        lo < self.va.end.raw() && hi > self.va.start.raw()
    }
}

impl Default for Restriction {
    fn default() -> Self {
        Self::all()
    }
}

fn handle(tree: &MappingTree, frame: u32, slot: usize) -> MappingRef {
    MappingRef { frame, slot: slot as u32, generation: tree.generation() }
}

/// Direct children of one mapping, in preorder.
pub struct Children<'t> {
    tree: &'t MappingTree,
    frame: u32,
    parent: usize,
    cursor: Option<usize>,
}

impl<'t> Children<'t> {
    pub(crate) fn new(tree: &'t MappingTree, frame: u32, parent: usize) -> Self {
        Self { tree, frame, parent, cursor: Some(parent) }
    }
}

impl<'t> Iterator for Children<'t> {
    type Item = (MappingRef, &'t Mapping);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.tree.next_child(self.parent, self.cursor?);
        self.cursor = next;
        let slot = next?;
        Some((handle(self.tree, self.frame, slot), self.tree.get(slot)?))
    }
}

/// All transitive descendants of one mapping, in preorder.
///
/// With a [`Restriction`], subtrees of direct children that are not admitted
/// are skipped as a whole.
pub struct Descendants<'t> {
    tree: &'t MappingTree,
    frame: u32,
    parent: usize,
    cursor: Option<usize>,
    restriction: Option<Restriction>,
    skipping: bool,
}

impl<'t> Descendants<'t> {
    pub(crate) fn new(
        tree: &'t MappingTree,
        frame: u32,
        parent: usize,
        restriction: Option<Restriction>,
    ) -> Self {
        Self { tree, frame, parent, cursor: Some(parent), restriction, skipping: false }
    }
}

impl<'t> Iterator for Descendants<'t> {
    type Item = (MappingRef, &'t Mapping);

    fn next(&mut self) -> Option<Self::Item> {
        let parent = *self.tree.get(self.parent)?;
        loop {
            let next = self.tree.next_descendant(self.parent, self.cursor?);
            self.cursor = next;
            let slot = next?;
            let m = self.tree.get(slot)?;
            if m.depth() == parent.depth() + 1 {
                self.skipping = match &self.restriction {
                    Some(r) => !r.admits(&parent, m),
                    None => false,
                };
            }
            if !self.skipping {
                return Some((handle(self.tree, self.frame, slot), m));
            }
        }
    }
}
