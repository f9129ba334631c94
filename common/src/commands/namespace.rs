use crate::{Block, LocatedBlock};

/// File namespace operations handled by the block manager
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NamespaceCommand {
    /// Create an empty open file; `replication` overrides the default
    CreateFile { path: String, replication: Option<u16> },

    /// Allocate the next block of an open file, finalizing the previous one
    AddBlock { path: String },

    /// Writer acknowledges a block as fully written
    CommitBlock { block: Block, length: u64 },

    /// Close the file, completing its last block
    CloseFile { path: String },

    DeleteFile { path: String },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NamespaceCommandResponse {
    Created { path: String },

    /// New block with its write pipeline in `locations`
    BlockAdded(LocatedBlock),

    Committed { block: Block },
    Closed { path: String },
    Deleted { path: String, blocks: usize },
    Error(String),
}
