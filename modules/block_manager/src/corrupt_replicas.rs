//! Set of (block, node) replicas currently believed corrupt.
//!
//! Records are only ever added for replicas the catalog knows about, and are
//! dropped when the replica leaves the catalog (invalidated, lost, or its node
//! died). A replica is never un-marked while it still exists.

use palisade_common::{CorruptionReason, NodeId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptRecord {
    pub reason: CorruptionReason,

    /// Milliseconds since the epoch when first recorded
    pub inserted_at: u64,
}

#[derive(Debug, Default)]
pub struct CorruptReplicaTracker {
    records: BTreeMap<u64, BTreeMap<NodeId, CorruptRecord>>,
}

impl CorruptReplicaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this is a new record; repeats keep the first record
    pub fn add(&mut self, block_id: u64, node: &NodeId, reason: CorruptionReason, now: u64) -> bool {
        let nodes = self.records.entry(block_id).or_default();
        if nodes.contains_key(node) {
            return false;
        }
        nodes.insert(
            node.clone(),
            CorruptRecord {
                reason,
                inserted_at: now,
            },
        );
        true
    }

    pub fn remove(&mut self, block_id: u64, node: &NodeId) -> bool {
        let Some(nodes) = self.records.get_mut(&block_id) else {
            return false;
        };
        let removed = nodes.remove(node).is_some();
        if nodes.is_empty() {
            self.records.remove(&block_id);
        }
        removed
    }

    pub fn remove_block(&mut self, block_id: u64) -> usize {
        self.records.remove(&block_id).map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_corrupt(&self, block_id: u64, node: &NodeId) -> bool {
        self.records.get(&block_id).is_some_and(|nodes| nodes.contains_key(node))
    }

    pub fn get(&self, block_id: u64, node: &NodeId) -> Option<&CorruptRecord> {
        self.records.get(&block_id).and_then(|nodes| nodes.get(node))
    }

    pub fn count(&self, block_id: u64) -> usize {
        self.records.get(&block_id).map(|nodes| nodes.len()).unwrap_or(0)
    }

    /// Corrupt replicas of a block, oldest record first
    pub fn nodes(&self, block_id: u64) -> Vec<NodeId> {
        let Some(nodes) = self.records.get(&block_id) else {
            return Vec::new();
        };
        let mut ordered: Vec<_> = nodes.iter().collect();
        ordered.sort_by(|(a_node, a), (b_node, b)| {
            a.inserted_at.cmp(&b.inserted_at).then_with(|| a_node.cmp(b_node))
        });
        ordered.into_iter().map(|(node, _)| node.clone()).collect()
    }

    /// Blocks with at least one corrupt replica
    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }

    pub fn total(&self) -> usize {
        self.records.values().map(|nodes| nodes.len()).sum()
    }
}
