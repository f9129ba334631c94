//! Block lifecycle state machine.
//!
//! A block starts `UnderConstruction` when allocated, becomes `Committed` once
//! the writer reports its final length, and `Complete` when the owning file is
//! closed or a later block is allocated. Only `Complete` blocks take part in
//! verification and replication-count enforcement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// Being written; length and contents not yet stable
    #[default]
    UnderConstruction,

    /// Fully written by the client but the file is still open
    Committed,

    /// Finalized; terminal
    Complete,
}

/// Errors returned by lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The block was already committed with a different length.
    #[error("block already committed with length {committed}, got {requested}")]
    LengthConflict { committed: u64, requested: u64 },

    /// A finalized block cannot be committed again.
    #[error("block is already complete")]
    AlreadyComplete,

    /// Completion requires the writer to have committed the block first.
    #[error("block is still under construction")]
    NotCommitted,
}

impl BlockState {
    /// Writer acknowledged the block as fully written with `length` bytes.
    ///
    /// Re-committing a committed block with the same length is a no-op.
    pub fn commit(self, current_length: u64, length: u64) -> Result<BlockState, LifecycleError> {
        match self {
            BlockState::UnderConstruction => Ok(BlockState::Committed),
            BlockState::Committed if current_length == length => Ok(BlockState::Committed),
            BlockState::Committed => Err(LifecycleError::LengthConflict {
                committed: current_length,
                requested: length,
            }),
            BlockState::Complete => Err(LifecycleError::AlreadyComplete),
        }
    }

    /// Finalize the block. Idempotent once complete.
    pub fn complete(self) -> Result<BlockState, LifecycleError> {
        match self {
            BlockState::UnderConstruction => Err(LifecycleError::NotCommitted),
            BlockState::Committed | BlockState::Complete => Ok(BlockState::Complete),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, BlockState::Complete)
    }

    pub fn is_under_construction(&self) -> bool {
        !self.is_complete()
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnderConstruction => write!(f, "UNDER_CONSTRUCTION"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Complete => write!(f, "COMPLETE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_is_under_construction() {
        assert_eq!(BlockState::default(), BlockState::UnderConstruction);
        assert!(BlockState::default().is_under_construction());
    }

    #[test]
    fn commit_then_complete() {
        let state = BlockState::UnderConstruction.commit(0, 8192).unwrap();
        assert_eq!(state, BlockState::Committed);
        assert!(state.is_under_construction());

        let state = state.complete().unwrap();
        assert_eq!(state, BlockState::Complete);
        assert!(state.is_complete());
    }

    #[test]
    fn complete_requires_commit() {
        assert_eq!(BlockState::UnderConstruction.complete(), Err(LifecycleError::NotCommitted));
    }

    #[test]
    fn recommit_same_length_is_idempotent() {
        assert_eq!(BlockState::Committed.commit(100, 100), Ok(BlockState::Committed));
        assert_eq!(
            BlockState::Committed.commit(100, 99),
            Err(LifecycleError::LengthConflict {
                committed: 100,
                requested: 99
            })
        );
    }

    #[test]
    fn complete_is_terminal() {
        assert_eq!(BlockState::Complete.complete(), Ok(BlockState::Complete));
        assert_eq!(BlockState::Complete.commit(10, 10), Err(LifecycleError::AlreadyComplete));
    }
}
