// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping database of the neuron memory subsystem
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Mapdb, FrameGuard, Mapping, MappingRef, MappingTree, Restriction,
//!             mem_map(), mem_fpage_unmap(), fpage_unmap(), MemSpace, SpaceDirectory
//! DEPENDS_ON: spin, bitflags, static_assertions, alloc
//! INVARIANTS: Every RAM frame has exactly one derivation tree rooted in sigma0;
//!             a mapping never outlives the mapping it was derived from
//! ADR: docs/adr/0001-mapping-database.md
//!
//! Each physical frame owns a tree recording which address space received the
//! frame from which other space. Mapping a page adds a child below the
//! sender's node; unmapping removes a node's subtree, so revocation is
//! recursive. The tree of a frame is only reachable while its lock is held,
//! between [`Mapdb::lookup`] and [`Mapdb::free`].

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod addr;
pub mod config;
pub mod error;
pub mod fpage;
pub mod frame;
pub mod iter;
pub mod map_util;
pub mod mapdb;
pub mod mapping;
pub mod mem_space;
pub mod stats;
pub mod tree;

pub use addr::{PhysAddr, SpaceId, Tag, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use config::MapdbConfig;
pub use error::{IpcError, MapdbError};
pub use fpage::{Fpage, FpageRights};
pub use frame::{register_context_id, FrameGuard};
pub use iter::Restriction;
pub use map_util::{fpage_unmap, mem_fpage_unmap, mem_map, FlushMode, MapOutcome};
pub use mapdb::Mapdb;
pub use mapping::{Mapping, MappingRef};
pub use mem_space::{InsertStatus, MemSpace, PageAttribs, PageEntry, SpaceDirectory};
pub use stats::MapdbStats;
#[cfg(feature = "failpoints")]
pub use tree::failpoints;
pub use tree::{MappingTree, PackOutcome, SubmapOps};
