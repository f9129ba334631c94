//! Local replica storage for a data node.
//!
//! A store holds the bytes and stored checksums of each replica, keyed by block
//! id. Replicas are written while `BeingWritten` and become eligible for
//! verification once finalized. A replica marked corrupt stays on disk, and is
//! still listed in block reports, but is no longer served to readers.

use palisade_common::{
    checksum::{ChecksumCheck, Checksums},
    Block, CorruptionReason, ReplicaState,
};

pub mod disk;
pub mod memory;

/// Errors from replica storage operations
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica {0} not found")]
    NotFound(Block),

    #[error("replica {0} already exists")]
    AlreadyExists(Block),

    #[error("replica {0} is not finalized")]
    NotFinalized(Block),

    #[error("replica {0} is already finalized")]
    AlreadyFinalized(Block),

    #[error("replica {0} is marked corrupt")]
    Corrupt(Block),

    #[error("checksum mismatch in {block} at offset {offset}")]
    ChecksumMismatch {
        block: Block,
        offset: u64,
        length: u64,
    },

    #[error("replica {block} has {actual} bytes, checksums cover {expected}")]
    Truncated {
        block: Block,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error on {block}: {source}")]
    Io {
        block: Block,
        #[source]
        source: std::io::Error,
    },
}

impl ReplicaError {
    /// Set when the error proves the replica's contents are bad
    pub fn corruption_reason(&self) -> Option<CorruptionReason> {
        match self {
            ReplicaError::ChecksumMismatch { .. } => Some(CorruptionReason::ChecksumMismatch),
            ReplicaError::Truncated { .. } => Some(CorruptionReason::Truncated),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::Io { .. })
    }

    /// Length of the data the failing operation observed, where known
    pub fn observed_length(&self) -> Option<u64> {
        match self {
            ReplicaError::ChecksumMismatch { length, .. } => Some(*length),
            ReplicaError::Truncated { actual, .. } => Some(*actual),
            _ => None,
        }
    }
}

/// Summary of one local replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub block: Block,

    /// Bytes currently held
    pub length: u64,

    pub state: ReplicaState,
    pub corrupt: bool,
}

pub trait ReplicaStore: Send + Sync {
    /// Start a new replica in `BeingWritten` state
    fn begin(&self, block: Block) -> Result<(), ReplicaError>;

    /// Append to a replica being written, returning its new length
    fn append(&self, block: &Block, data: &[u8]) -> Result<u64, ReplicaError>;

    /// Close a replica being written and store its checksums
    fn finalize(&self, block: &Block, bytes_per_checksum: u32)
        -> Result<ReplicaInfo, ReplicaError>;

    /// Store a complete replica received from a peer, checking the payload first
    fn store_finalized(
        &self,
        block: Block,
        data: &[u8],
        checksums: &Checksums,
    ) -> Result<ReplicaInfo, ReplicaError>;

    /// Bytes and stored checksums of a finalized replica, corrupt or not
    fn read_raw(&self, block: &Block) -> Result<(Vec<u8>, Checksums), ReplicaError>;

    fn info(&self, block_id: u64) -> Option<ReplicaInfo>;

    fn list(&self) -> Vec<ReplicaInfo>;

    /// Flag a replica corrupt; returns false if it already was
    fn mark_corrupt(&self, block: &Block) -> Result<bool, ReplicaError>;

    /// Remove a replica; returns false if it was not present
    fn delete(&self, block: &Block) -> Result<bool, ReplicaError>;

    fn used_bytes(&self) -> u64 {
        self.list().iter().map(|r| r.length).sum()
    }

    /// Read for serving clients and peers; refuses replicas known corrupt
    fn read(&self, block: &Block) -> Result<(Vec<u8>, Checksums), ReplicaError> {
        match self.info(block.id) {
            Some(info) if info.block == *block && info.corrupt => {
                Err(ReplicaError::Corrupt(*block))
            }
            _ => self.read_raw(block),
        }
    }

    /// Re-read a finalized replica and check it against its stored checksums,
    /// returning the number of bytes verified
    fn verify(&self, block: &Block) -> Result<u64, ReplicaError> {
        let (data, checksums) = self.read_raw(block)?;
        check_replica(block, &data, &checksums)
    }
}

/// Compare replica bytes with their checksums
pub fn check_replica(block: &Block, data: &[u8], checksums: &Checksums) -> Result<u64, ReplicaError> {
    match checksums.verify(data) {
        ChecksumCheck::Ok => Ok(data.len() as u64),
        ChecksumCheck::Mismatch { offset } => Err(ReplicaError::ChecksumMismatch {
            block: *block,
            offset,
            length: data.len() as u64,
        }),
        ChecksumCheck::LengthMismatch { expected, actual } => Err(ReplicaError::Truncated {
            block: *block,
            expected,
            actual,
        }),
    }
}
