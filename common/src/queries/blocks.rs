use crate::{BlockHealth, LocatedBlock};

pub const DEFAULT_BLOCKS_QUERY_TOPIC: (&str, &str) =
    ("blocks-query-topic", "palisade.query.blocks");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum BlocksStateQuery {
    GetLocatedBlocks { path: String, offset: u64, length: u64 },
    GetBlockLocations { block_id: u64 },
    GetNumCorruptReplicas { block_id: u64 },
    GetBlockHealth { block_id: u64 },
    GetClusterHealth,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum BlocksStateQueryResponse {
    LocatedBlocks(LocatedBlocks),
    BlockLocations(LocatedBlock),
    NumCorruptReplicas(usize),
    BlockHealth(BlockHealth),
    ClusterHealth(ClusterHealth),
    NotFound,
    Error(String),
}

/// Blocks of a file overlapping a requested byte range
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocatedBlocks {
    pub file_length: u64,
    pub under_construction: bool,
    pub blocks: Vec<LocatedBlock>,
}

/// Cluster-wide counters for operational tooling
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterHealth {
    pub live_nodes: usize,
    pub dead_nodes: usize,
    pub total_blocks: usize,
    pub under_replicated_blocks: usize,
    pub corrupt_blocks: usize,
    pub missing_blocks: usize,
    pub corrupt_replicas: usize,
    pub pending_replications: usize,
    pub pending_invalidations: usize,
}
