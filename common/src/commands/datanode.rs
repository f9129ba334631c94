use crate::{checksum::Checksums, Block, NodeId};

/// Instructions delivered to one storage node on its commands topic
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DataNodeCommand {
    /// Copy a local finalized replica to `target`
    Replicate { block: Block, target: NodeId },

    /// Delete local replicas
    Invalidate { blocks: Vec<Block> },

    /// Send a full block report now, after re-registering
    SendBlockReport,

    /// Store a replica copied from a peer
    Receive {
        block: Block,
        source: NodeId,
        data: Vec<u8>,
        checksums: Checksums,
    },
}

/// Request/response operations served by a storage node
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DataNodeRequest {
    /// Write a replica's bytes; `finalize` closes it for verification
    WriteReplica {
        block: Block,
        data: Vec<u8>,
        finalize: bool,
    },

    /// Read a replica with its stored checksums
    ReadReplica { block: Block },

    /// A client read and verified the full replica
    ReadVerified { block: Block },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DataNodeResponse {
    Written { block: Block, length: u64 },
    Replica {
        block: Block,
        data: Vec<u8>,
        checksums: Checksums,
    },
    Acknowledged,
    Error(String),
}
