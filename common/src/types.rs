//! Core type definitions for Palisade

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block identity: id plus generation stamp
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Block {
    /// Block id, stable across generations
    pub id: u64,

    /// Generation stamp, bumped when the block's contents are superseded
    pub generation_stamp: u64,
}

impl Block {
    pub fn new(id: u64, generation_stamp: u64) -> Self {
        Self {
            id,
            generation_stamp,
        }
    }

    /// On-disk name of the replica file
    pub fn file_name(&self) -> String {
        format!("blk_{}_{}", self.id, self.generation_stamp)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.id, self.generation_stamp)
    }
}

/// Storage node identifier
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// State of a replica as held by the storage node itself
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Still receiving bytes from a writer; length and checksums not stable
    #[default]
    BeingWritten,

    /// Writer closed the replica; checksums are stored and it may be verified
    Finalized,
}

/// Why a replica is believed corrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorruptionReason {
    /// Recomputed checksum differs from the stored one
    ChecksumMismatch,

    /// Length inconsistent with the finalized block length or stored checksums
    Truncated,

    /// Generation stamp older than the coordinator's for a finalized block
    StaleGeneration,

    /// Repeated I/O errors beyond the retry bound
    Unreadable,
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum_mismatch"),
            Self::Truncated => write!(f, "truncated"),
            Self::StaleGeneration => write!(f, "stale_generation"),
            Self::Unreadable => write!(f, "unreadable"),
        }
    }
}

/// Who observed a corruption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportSource {
    /// The storage node's background verifier
    Verifier,

    /// A client detected a checksum failure while reading
    Client,

    /// The coordinator folded a block report entry into corrupt handling
    BlockReport,
}

/// Classification of a block by its replicas' corruption state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockHealth {
    /// No corrupt replicas
    Healthy,

    /// Some corrupt replicas, at least one good one
    Degraded,

    /// Every known replica is corrupt; the block is unreadable
    Corrupt,

    /// No replicas known at all
    Missing,
}

impl BlockHealth {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, BlockHealth::Corrupt)
    }
}

impl fmt::Display for BlockHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Corrupt => write!(f, "corrupt"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// One entry of a storage node's block report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedReplica {
    /// Block as held by the node, including its generation stamp
    pub block: Block,

    /// Bytes currently on disk
    pub observed_length: u64,

    /// Node-local replica state
    pub state: ReplicaState,

    /// Last successful verification, milliseconds since the epoch
    pub last_verified: Option<u64>,

    /// Node already knows this replica is corrupt
    pub corrupt: bool,
}

/// A replica location as returned to readers and tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub node: NodeId,
    pub corrupt: bool,
}

/// A block of a file together with its replica locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    pub block: Block,

    /// Offset of the block's first byte within its file
    pub offset: u64,

    /// Block length (target length once committed)
    pub length: u64,

    /// Every known replica, good replicas first
    pub locations: Vec<ReplicaLocation>,

    /// All known replicas are corrupt
    pub corrupt: bool,
}

impl LocatedBlock {
    /// Replicas a reader should try: the good ones, or all of them when the
    /// block is corrupt and there is nothing better to offer
    pub fn readable_locations(&self) -> Vec<NodeId> {
        self.locations
            .iter()
            .filter(|loc| self.corrupt || !loc.corrupt)
            .map(|loc| loc.node.clone())
            .collect()
    }

    pub fn good_count(&self) -> usize {
        self.locations.iter().filter(|loc| !loc.corrupt).count()
    }

    pub fn corrupt_count(&self) -> usize {
        self.locations.iter().filter(|loc| loc.corrupt).count()
    }
}

/// Instruction to copy a replica from one node to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub block: Block,
    pub source: NodeId,
    pub target: NodeId,
}

/// Instruction to delete one replica from a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationTask {
    pub block: Block,
    pub node: NodeId,
}
