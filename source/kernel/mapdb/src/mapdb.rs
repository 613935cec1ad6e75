// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The mapping database: one locked derivation tree per physical frame
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Mapdb::{new, lookup, lock_frame, insert, flush, grant, free, stats}
//! DEPENDS_ON: frame, tree, config, stats
//! INVARIANTS: Every frame of the covered RAM range owns a tree rooted in sigma0;
//!             trees live as long as the database; a frame is locked only between
//!             lookup and free
//! ADR: docs/adr/0001-mapping-database.md

extern crate alloc;

use alloc::vec::Vec;

use crate::addr::{PhysAddr, SpaceId, Tag, VirtAddr, PAGE_SHIFT};
use crate::config::MapdbConfig;
use crate::error::MapdbError;
use crate::frame::{Frame, FrameGuard};
use crate::iter::Restriction;
use crate::mapping::MappingRef;
use crate::stats::{Counters, MapdbStats};
use crate::tree::{MappingTree, SubmapOps};

/// Mapping database over a contiguous range of physical memory.
pub struct Mapdb {
    config: MapdbConfig,
    base_pfn: usize,
    frames: Vec<Frame>,
    stats: Counters,
}

impl Mapdb {
    /// Builds one single-root tree per frame of `config.ram`.
    pub fn new(config: MapdbConfig) -> Result<Self, MapdbError> {
        if !config.is_valid() {
            log_error!(target: "mapdb", "invalid config: ram {:?}", config.ram);
            return Err(MapdbError::InvalidConfig);
        }
        let base_pfn = config.ram.start.pfn();
        let count = config.frame_count();
        if count > u32::MAX as usize {
            return Err(MapdbError::InvalidConfig);
        }
        let mut frames = Vec::new();
        frames.try_reserve_exact(count).map_err(|_| MapdbError::OutOfMemory)?;
        for pfn in base_pfn..base_pfn + count {
            frames.push(Frame::new(MappingTree::new(pfn)?));
        }
        log_info!(
            target: "mapdb",
            "covering {:?}..{:?} ({} frames, superpage {} KiB)",
            config.ram.start,
            config.ram.end,
            count,
            config.superpage_size() >> 10
        );
        Ok(Self { config, base_pfn, frames, stats: Counters::default() })
    }

    #[inline]
    pub fn config(&self) -> &MapdbConfig {
        &self.config
    }

    /// Whether `phys` is tracked by this database.
    #[inline]
    pub fn covers(&self, phys: PhysAddr) -> bool {
        self.config.covers(phys)
    }

    fn frame_index(&self, phys: PhysAddr) -> Result<usize, MapdbError> {
        if !self.covers(phys) {
            return Err(MapdbError::OutOfRange);
        }
        Ok(phys.pfn() - self.base_pfn)
    }

    /// Locks the tree of the frame containing `phys` without looking anything up.
    pub fn lock_frame(&self, phys: PhysAddr) -> Result<FrameGuard<'_>, MapdbError> {
        let index = self.frame_index(phys)?;
        Ok(self.frames[index].lock(index as u32, &self.stats))
    }

    /// Finds the mapping `space` holds at `va` for frame `phys` and locks the
    /// frame's tree.
    ///
    /// On success the tree stays locked until the returned guard is freed.
    /// On `NotFound` the lock has already been released.
    pub fn lookup(
        &self,
        space: SpaceId,
        va: VirtAddr,
        phys: PhysAddr,
    ) -> Result<(MappingRef, FrameGuard<'_>), MapdbError> {
        let guard = self.lock_frame(phys)?;
        let found = guard.find(space, va);
        self.stats.lookup(found.is_some());
        match found {
            Some(m) => Ok((m, guard)),
            None => {
                log_trace!(target: "mapdb", "lookup miss: {} {:?} {:?}", space, va, phys);
                Err(MapdbError::NotFound)
            }
        }
    }

    /// Ends a lookup cycle: packs the tree and releases the frame lock.
    pub fn free(&self, guard: FrameGuard<'_>) {
        guard.free();
    }

    /// Records that `space` received `size` bytes at `va` derived from `parent`.
    pub fn insert(
        &self,
        guard: &mut FrameGuard<'_>,
        parent: MappingRef,
        space: SpaceId,
        va: VirtAddr,
        size: usize,
        tag: Tag,
    ) -> Result<MappingRef, MapdbError> {
        if !size.is_power_of_two() || size < 1 << PAGE_SHIFT || size > self.config.largest_page() {
            return Err(MapdbError::UnsupportedSize);
        }
        guard.insert(parent, space, va, size.trailing_zeros() as u8, tag)
    }

    /// Removes the subtree below `node`, and `node` too if `me_too`.
    ///
    /// With `restrict_tag` and/or a non-full `[va_start, va_end)` window, only
    /// the subtrees of matching direct children are removed.
    #[allow(clippy::too_many_arguments)]
    pub fn flush<O: SubmapOps>(
        &self,
        guard: &mut FrameGuard<'_>,
        node: MappingRef,
        me_too: bool,
        restrict_tag: Option<Tag>,
        va_start: VirtAddr,
        va_end: VirtAddr,
        ops: &mut O,
    ) -> Result<usize, MapdbError> {
        let restriction = match restrict_tag {
            Some(tag) => Restriction::tag(tag),
            None => Restriction::all(),
        }
        .within(va_start, va_end);
        guard.flush(node, me_too, Some(&restriction), ops)
    }

    /// Hands `node` over to `new_space` at `new_va`.
    pub fn grant<O: SubmapOps>(
        &self,
        guard: &mut FrameGuard<'_>,
        node: MappingRef,
        new_space: SpaceId,
        new_va: VirtAddr,
        ops: &mut O,
    ) -> Result<(), MapdbError> {
        guard.grant(node, new_space, new_va, ops)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MapdbStats {
        self.stats.snapshot()
    }

    /// Runs the integrity check over every tree. Locks each frame in turn but
    /// leaves the trees untouched: no pack, no generation change.
    pub fn check_integrity(&self) -> Result<(), (usize, &'static str)> {
        for (index, frame) in self.frames.iter().enumerate() {
            frame.inspect(index as u32, MappingTree::check_integrity).map_err(|e| (index, e))?;
        }
        Ok(())
    }
}
