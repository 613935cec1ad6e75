// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the mapping database and its IPC glue
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbError, IpcError
//! DEPENDS_ON: -
//! INVARIANTS: All recoverable failures are explicit return values; logic bugs panic

use core::fmt;

/// Errors reported by mapping-database operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapdbError {
    /// No mapping for the requested `(space, va)` exists in the frame's tree.
    NotFound,
    /// The physical address lies outside the range covered by the database.
    OutOfRange,
    /// The mapping tree has no free slot left.
    TreeFull,
    /// The parent already sits at the deepest supported derivation depth.
    DepthExhausted,
    /// A second insert was attempted within one lookup/free cycle.
    InsertLimit,
    /// The root mapping of a frame cannot be granted away.
    RootImmutable,
    /// The mapping reference belongs to another frame, another lock cycle or
    /// a slot that has since been flushed.
    StaleMapping,
    /// The requested mapping size cannot be derived from the parent.
    UnsupportedSize,
    /// Allocating mapping-tree storage failed.
    OutOfMemory,
    /// The configuration does not describe a usable machine.
    InvalidConfig,
}

impl fmt::Display for MapdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "mapping not found",
            Self::OutOfRange => "physical address not covered",
            Self::TreeFull => "mapping tree full",
            Self::DepthExhausted => "derivation depth exhausted",
            Self::InsertLimit => "insert budget of lock cycle used up",
            Self::RootImmutable => "root mapping is immutable",
            Self::StaleMapping => "stale mapping reference",
            Self::UnsupportedSize => "unsupported mapping size",
            Self::OutOfMemory => "out of memory",
            Self::InvalidConfig => "invalid mapdb configuration",
        };
        f.write_str(msg)
    }
}

/// Error codes surfaced to the IPC caller of `mem_map`/`mem_fpage_unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Entering the mapping failed (tree full, out of memory, invalid grant).
    RemapFailed,
    /// The addressed space does not exist.
    NotFound,
    /// The flexpage cannot be handled by the memory path.
    InvalidFpage,
}

impl From<MapdbError> for IpcError {
    fn from(value: MapdbError) -> Self {
        match value {
            MapdbError::NotFound => Self::NotFound,
            _ => Self::RemapFailed,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::RemapFailed => "remap failed",
            Self::NotFound => "no such space",
            Self::InvalidFpage => "invalid flexpage",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapdb_errors_collapse_to_remap_failed() {
        assert_eq!(IpcError::from(MapdbError::TreeFull), IpcError::RemapFailed);
        assert_eq!(IpcError::from(MapdbError::RootImmutable), IpcError::RemapFailed);
        assert_eq!(IpcError::from(MapdbError::NotFound), IpcError::NotFound);
    }
}
