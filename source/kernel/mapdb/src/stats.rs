// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Event counters of one mapping database
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbStats (snapshot)
//! DEPENDS_ON: tree::PackOutcome
//! INVARIANTS: Counters only grow; relaxed ordering, snapshots are not atomic as a whole

use core::sync::atomic::{AtomicU64, Ordering};

use crate::tree::PackOutcome;

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapdbStats {
    pub lookups: u64,
    pub lookup_misses: u64,
    pub inserts: u64,
    /// Mappings removed by flushes.
    pub flushed: u64,
    pub grants: u64,
    pub grows: u64,
    pub shrinks: u64,
    pub compactions: u64,
    /// Lock cycles that ended with a tree unable to take another insert.
    pub exhausted: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    lookups: AtomicU64,
    lookup_misses: AtomicU64,
    inserts: AtomicU64,
    flushed: AtomicU64,
    grants: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
    compactions: AtomicU64,
    exhausted: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn lookup(&self, hit: bool) {
        bump(&self.lookups, 1);
        if !hit {
            bump(&self.lookup_misses, 1);
        }
    }

    pub(crate) fn insert(&self) {
        bump(&self.inserts, 1);
    }

    pub(crate) fn flushed(&self, removed: usize) {
        bump(&self.flushed, removed as u64);
    }

    pub(crate) fn grant(&self) {
        bump(&self.grants, 1);
    }

    pub(crate) fn packed(&self, outcome: PackOutcome) {
        match outcome {
            PackOutcome::Unchanged => {}
            PackOutcome::Shrunk => bump(&self.shrinks, 1),
            PackOutcome::Compacted => bump(&self.compactions, 1),
            PackOutcome::Grown => bump(&self.grows, 1),
            PackOutcome::Exhausted => bump(&self.exhausted, 1),
        }
    }

    pub(crate) fn snapshot(&self) -> MapdbStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MapdbStats {
            lookups: get(&self.lookups),
            lookup_misses: get(&self.lookup_misses),
            inserts: get(&self.inserts),
            flushed: get(&self.flushed),
            grants: get(&self.grants),
            grows: get(&self.grows),
            shrinks: get(&self.shrinks),
            compactions: get(&self.compactions),
            exhausted: get(&self.exhausted),
        }
    }
}
