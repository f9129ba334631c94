use crate::{Block, NodeId};

pub const DEFAULT_VERIFIER_QUERY_TOPIC: (&str, &str) =
    ("verifier-query-topic", "palisade.query.verifier");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum VerifierStateQuery {
    GetBlockVerification { block_id: u64 },
    GetVerifierReport,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum VerifierStateQueryResponse {
    BlockVerification(BlockVerification),
    VerifierReport(VerifierReport),
    NotFound,
    Error(String),
}

/// Verification status of one local replica
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockVerification {
    pub block: Block,

    /// Milliseconds since the epoch, absent if never verified
    pub last_verified: Option<u64>,

    pub scan_period_ms: u64,
}

/// Listing of every replica the verifier tracks
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VerifierReport {
    pub node: NodeId,
    pub scan_period_ms: u64,
    pub total_replicas: usize,
    pub verified_in_period: usize,
    pub blocks: Vec<BlockVerification>,
}
