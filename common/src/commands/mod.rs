pub mod datanode;
pub mod namespace;

pub const DEFAULT_DATANODE_COMMANDS_TOPIC: (&str, &str) =
    ("datanode-commands-topic", "palisade.datanode.commands");

pub const DEFAULT_DATANODE_REQUEST_TOPIC: (&str, &str) =
    ("datanode-request-topic", "palisade.datanode.request");

pub const DEFAULT_NAMESPACE_TOPIC: (&str, &str) = ("namespace-topic", "palisade.namespace");

/// Per-node topic derived from a base topic
pub fn node_topic(base: &str, node: &crate::NodeId) -> String {
    format!("{base}.{node}")
}
