// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the mapping tree
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Random map/unmap/grant histories must keep
//!       the preorder encoding and the revocation guarantees intact.
//!
//! TEST_SCOPE:
//!   - Preorder encoding and counters after arbitrary operation sequences
//!   - Recursive revocation and grant semantics
//!   - Room for one insert after every pack
//!   - Tag-restricted flushes
//!
//! TEST_SCENARIOS:
//!   - random_histories_keep_encoding(): integrity + parent depth after every step
//!   - flush_removes_whole_subtree(): nothing derived from a flushed node survives
//!   - grant_keeps_descendants(): subtree identical after relabelling its root
//!   - pack_leaves_room_for_one_insert(): insert below the root succeeds after pack
//!   - restricted_flush_spares_other_tags(): only admitted children and below go

use super::{MappingTree, PackOutcome};
use crate::addr::{SpaceId, Tag, VirtAddr};
use crate::iter::Restriction;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Insert { parent: usize, tag: u8 },
    Flush { node: usize, me_too: bool },
    Grant { node: usize },
    Pack,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (any::<usize>(), 0u8..3).prop_map(|(parent, tag)| Op::Insert { parent, tag }),
        1 => (any::<usize>(), any::<bool>()).prop_map(|(node, me_too)| Op::Flush { node, me_too }),
        1 => any::<usize>().prop_map(|node| Op::Grant { node }),
        2 => Just(Op::Pack),
    ]
}

type Key = (SpaceId, VirtAddr);

struct Model {
    tree: MappingTree,
    next: u32,
}

impl Model {
    fn new() -> Self {
        Self { tree: MappingTree::new(0x100).unwrap(), next: 0 }
    }

    fn live(&self) -> Vec<usize> {
        self.tree.live_slots().map(|(slot, _)| slot).collect()
    }

    fn pick(&self, raw: usize, skip_root: bool) -> Option<usize> {
        let live: Vec<usize> = self.live().into_iter().filter(|&s| !(skip_root && s == 0)).collect();
        if live.is_empty() {
            None
        } else {
            Some(live[raw % live.len()])
        }
    }

    fn fresh(&mut self) -> Key {
        self.next += 1;
        (SpaceId::from_raw(100 + self.next), VirtAddr::from_page(self.next as usize))
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Insert { parent, tag } => {
                let Some(parent) = self.pick(parent, false) else { return };
                let (space, va) = self.fresh();
                if self.tree.insert(parent, space, va, 12, Tag::new(tag)).is_err() {
                    self.tree.pack();
                }
            }
            Op::Flush { node, me_too } => {
                if let Some(node) = self.pick(node, false) {
                    self.tree.flush(node, me_too, None, &mut ()).unwrap();
                }
            }
            Op::Grant { node } => {
                if let Some(node) = self.pick(node, true) {
                    let (space, va) = self.fresh();
                    self.tree.grant(node, space, va, &mut ()).unwrap();
                }
            }
            Op::Pack => {
                self.tree.pack();
            }
        }
    }

    fn subtree(&self, slot: usize) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut cursor = slot;
        while let Some(next) = self.tree.next_descendant(slot, cursor) {
            let m = self.tree.get(next).unwrap();
            keys.push((m.space(), m.vaddr()));
            cursor = next;
        }
        keys
    }
}

fn build(ops: &[Op]) -> Model {
    let mut model = Model::new();
    for op in ops {
        model.apply(op);
    }
    model
}

proptest! {
    #[test]
    fn random_histories_keep_encoding(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op);
            prop_assert!(model.tree.check_integrity().is_ok());
            for slot in model.live() {
                let depth = model.tree.get(slot).unwrap().depth();
                match model.tree.parent(slot) {
                    None => prop_assert_eq!(slot, 0),
                    Some(p) => prop_assert_eq!(model.tree.get(p).unwrap().depth() + 1, depth),
                }
            }
        }
    }

    #[test]
    fn flush_removes_whole_subtree(ops in prop::collection::vec(arb_op(), 1..48), pick in any::<usize>()) {
        let mut model = build(&ops);
        let node = model.pick(pick, false).unwrap();
        let doomed = model.subtree(node);
        let before = model.tree.count();
        let removed = model.tree.flush(node, false, None, &mut ()).unwrap();
        prop_assert_eq!(removed, doomed.len());
        prop_assert_eq!(model.tree.count(), before - removed);
        prop_assert!(model.tree.next_descendant(node, node).is_none());
        for (space, va) in doomed {
            prop_assert!(model.tree.find(space, va).is_none());
        }
    }

    #[test]
    fn grant_keeps_descendants(ops in prop::collection::vec(arb_op(), 1..48), pick in any::<usize>()) {
        let mut model = build(&ops);
        prop_assume!(model.tree.count() > 1);
        let node = model.pick(pick, true).unwrap();
        let below = model.subtree(node);
        let (space, va) = model.fresh();
        model.tree.grant(node, space, va, &mut ()).unwrap();
        prop_assert_eq!(model.tree.find(space, va), Some(node));
        prop_assert_eq!(model.subtree(node), below);
    }

    #[test]
    fn pack_leaves_room_for_one_insert(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut model = build(&ops);
        let outcome = model.tree.pack();
        prop_assert_ne!(outcome, PackOutcome::Exhausted);
        prop_assert!(model.tree.last_slot_free());
        let (space, va) = model.fresh();
        prop_assert!(model.tree.insert(0, space, va, 12, Tag::NONE).is_ok());
    }

    #[test]
    fn restricted_flush_spares_other_tags(
        ops in prop::collection::vec(arb_op(), 1..48),
        pick in any::<usize>(),
        tag in 0u8..3,
    ) {
        let mut model = build(&ops);
        let node = model.pick(pick, false).unwrap();
        let mut kept = Vec::new();
        let mut doomed = Vec::new();
        let mut cursor = node;
        while let Some(child) = model.tree.next_child(node, cursor) {
            let m = *model.tree.get(child).unwrap();
            let mut family = vec![(m.space(), m.vaddr())];
            family.extend(model.subtree(child));
            if m.tag() == Tag::new(tag) {
                doomed.extend(family);
            } else {
                kept.extend(family);
            }
            cursor = child;
        }
        let restriction = Restriction::tag(Tag::new(tag));
        let removed = model.tree.flush(node, false, Some(&restriction), &mut ()).unwrap();
        prop_assert_eq!(removed, doomed.len());
        for (space, va) in doomed {
            prop_assert!(model.tree.find(space, va).is_none());
        }
        for (space, va) in kept {
            prop_assert!(model.tree.find(space, va).is_some());
        }
    }
}
