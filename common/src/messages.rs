//! Definition of Palisade messages

use crate::commands::datanode::{DataNodeCommand, DataNodeRequest, DataNodeResponse};
use crate::commands::namespace::{NamespaceCommand, NamespaceCommandResponse};
use crate::queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse};
use crate::queries::verifier::{VerifierStateQuery, VerifierStateQueryResponse};
use crate::types::*;

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

pub const DEFAULT_DATANODE_EVENTS_TOPIC: (&str, &str) =
    ("datanode-events-topic", "palisade.datanode.events");

pub const DEFAULT_CORRUPT_REPLICA_TOPIC: (&str, &str) =
    ("corrupt-replica-topic", "palisade.replica.corrupt");

/// Periodic liveness and capacity report from a storage node
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatMessage {
    pub node: NodeId,

    /// Failure domain the node lives in
    pub rack: String,

    pub capacity_bytes: u64,
    pub used_bytes: u64,

    /// Replica transfers currently in progress, used as a load signal
    pub active_transfers: u32,
}

/// Full inventory of a storage node
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockReportMessage {
    pub node: NodeId,
    pub replicas: Vec<ReportedReplica>,
}

/// A finalized replica appeared on a node (client write or replication copy)
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReplicaReceivedMessage {
    pub node: NodeId,
    pub block: Block,
    pub length: u64,
}

/// A node deleted a replica following an invalidation
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReplicaDeletedMessage {
    pub node: NodeId,
    pub block: Block,
}

/// A replica was found corrupt, by its node's verifier or by a reading client
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReportCorruptMessage {
    pub block: Block,
    pub node: NodeId,
    pub observed_length: u64,
    pub reason: CorruptionReason,
    pub source: ReportSource,
}

/// Notifications from storage nodes to the block manager
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DataNodeMessage {
    Heartbeat(HeartbeatMessage),
    BlockReport(BlockReportMessage),
    ReplicaReceived(ReplicaReceivedMessage),
    ReplicaDeleted(ReplicaDeletedMessage),
}

/// State query messages
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQuery {
    Blocks(BlocksStateQuery),
    Verifier(VerifierStateQuery),
}

/// State query response messages
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQueryResponse {
    Blocks(BlocksStateQueryResponse),
    Verifier(VerifierStateQueryResponse),
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Caryatid standard messages
    Clock(ClockTickMessage), // Clock tick

    // Storage node notifications
    DataNode(DataNodeMessage),
    ReportCorrupt(ReportCorruptMessage),

    // Commands to storage nodes
    DataNodeCommand(DataNodeCommand),
    DataNodeRequest(DataNodeRequest),
    DataNodeResponse(DataNodeResponse),

    // Namespace operations
    Namespace(NamespaceCommand),
    NamespaceResponse(NamespaceCommandResponse),

    // State queries
    StateQuery(StateQuery),
    StateQueryResponse(StateQueryResponse),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<DataNodeMessage> for Message {
    fn from(msg: DataNodeMessage) -> Self {
        Message::DataNode(msg)
    }
}

impl From<ReportCorruptMessage> for Message {
    fn from(msg: ReportCorruptMessage) -> Self {
        Message::ReportCorrupt(msg)
    }
}

impl From<DataNodeCommand> for Message {
    fn from(msg: DataNodeCommand) -> Self {
        Message::DataNodeCommand(msg)
    }
}
