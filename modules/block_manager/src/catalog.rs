//! Block catalog: the coordinator's map from block to replica locations.
//!
//! Each block record carries its lifecycle state, target length and
//! replication, and the set of nodes believed to host a replica. Corruption is
//! tracked alongside in a [`CorruptReplicaTracker`]; a corrupt replica stays in
//! the replica set until it is physically removed.

use palisade_common::{
    Block, BlockHealth, BlockState, CorruptionReason, LifecycleError, LocatedBlock, NodeId,
    ReplicaLocation,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::corrupt_replicas::CorruptReplicaTracker;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown block {0}")]
    UnknownBlock(u64),

    #[error("block {current} does not match requested {requested}")]
    GenerationMismatch { current: Block, requested: Block },

    #[error("block {block}: {source}")]
    Lifecycle {
        block: Block,
        #[source]
        source: LifecycleError,
    },
}

/// Coordinator's view of one replica
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub observed_length: u64,
    pub last_verified: Option<u64>,

    /// Generation stamp the node holds, when older than the block's
    pub stale_generation: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub block: Block,

    /// Owning file path
    pub file: String,

    /// Committed length, zero until the writer commits
    pub target_length: u64,

    pub target_replication: u16,
    pub state: BlockState,
    pub replicas: BTreeMap<NodeId, ReplicaRecord>,
}

impl BlockRecord {
    /// The block exactly as `node` holds it, which is what an invalidation
    /// sent to that node has to name
    pub fn replica_block(&self, node: &NodeId) -> Block {
        match self.replicas.get(node).and_then(|r| r.stale_generation) {
            Some(generation_stamp) => Block::new(self.block.id, generation_stamp),
            None => self.block,
        }
    }

    /// Length readers should see: the committed length, or while still being
    /// written the longest replica so far
    pub fn visible_length(&self) -> u64 {
        if self.state == BlockState::UnderConstruction {
            self.replicas.values().map(|r| r.observed_length).max().unwrap_or(0)
        } else {
            self.target_length
        }
    }
}

/// Result of a corrupt report against the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptOutcome {
    /// New record; block classification after the change
    Recorded(BlockHealth),
    Duplicate,
    UnknownBlock,
    /// Report names an older or newer generation of the block
    GenerationMismatch,
    /// No replica of the block on that node
    UnknownReplica,
    UnderConstruction,
}

#[derive(Debug, Default)]
pub struct BlockCatalog {
    blocks: BTreeMap<u64, BlockRecord>,
    node_index: HashMap<NodeId, BTreeSet<u64>>,
    corrupt: CorruptReplicaTracker,
}

impl BlockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block_id: u64) -> Option<&BlockRecord> {
        self.blocks.get(&block_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values()
    }

    pub fn corrupt_replicas(&self) -> &CorruptReplicaTracker {
        &self.corrupt
    }

    pub fn add_block(&mut self, block: Block, file: &str, target_replication: u16) {
        self.blocks.insert(
            block.id,
            BlockRecord {
                block,
                file: file.to_string(),
                target_length: 0,
                target_replication,
                state: BlockState::UnderConstruction,
                replicas: BTreeMap::new(),
            },
        );
    }

    /// Drop a block and all bookkeeping for it
    pub fn remove_block(&mut self, block_id: u64) -> Option<BlockRecord> {
        let record = self.blocks.remove(&block_id)?;
        for node in record.replicas.keys() {
            self.unindex(node, block_id);
        }
        self.corrupt.remove_block(block_id);
        Some(record)
    }

    fn record_for(&mut self, block: &Block) -> Result<&mut BlockRecord, CatalogError> {
        let record = self.blocks.get_mut(&block.id).ok_or(CatalogError::UnknownBlock(block.id))?;
        if record.block != *block {
            return Err(CatalogError::GenerationMismatch {
                current: record.block,
                requested: *block,
            });
        }
        Ok(record)
    }

    /// Writer finished the block with `length` bytes
    pub fn commit_block(&mut self, block: &Block, length: u64) -> Result<(), CatalogError> {
        let record = self.record_for(block)?;
        record.state = record
            .state
            .commit(record.target_length, length)
            .map_err(|source| CatalogError::Lifecycle {
                block: *block,
                source,
            })?;
        record.target_length = length;
        Ok(())
    }

    /// Finalize a committed block. Replicas whose length disagrees with the
    /// committed length are marked corrupt at this point.
    pub fn complete_block(&mut self, block_id: u64, now: u64) -> Result<(), CatalogError> {
        let record = self.blocks.get_mut(&block_id).ok_or(CatalogError::UnknownBlock(block_id))?;
        let was_complete = record.state.is_complete();
        record.state = record.state.complete().map_err(|source| CatalogError::Lifecycle {
            block: record.block,
            source,
        })?;
        if was_complete {
            return Ok(());
        }

        let block = record.block;
        let short: Vec<_> = record
            .replicas
            .iter()
            .filter(|(_, r)| r.observed_length != record.target_length)
            .map(|(node, _)| node.clone())
            .collect();
        for node in short {
            self.record_corrupt(&block, &node, CorruptionReason::Truncated, now);
        }
        Ok(())
    }

    /// Add or refresh a replica. Returns true if the node was not already
    /// in the replica set.
    pub fn add_replica(&mut self, block_id: u64, node: &NodeId, replica: ReplicaRecord) -> bool {
        let Some(record) = self.blocks.get_mut(&block_id) else {
            return false;
        };
        let added = match record.replicas.get_mut(node) {
            Some(existing) => {
                existing.observed_length = replica.observed_length;
                existing.stale_generation = replica.stale_generation;
                if replica.last_verified.is_some() {
                    existing.last_verified = replica.last_verified;
                }
                false
            }
            None => {
                record.replicas.insert(node.clone(), replica);
                true
            }
        };
        if added {
            self.node_index.entry(node.clone()).or_default().insert(block_id);
        }
        added
    }

    /// Mark a replica corrupt. Idempotent: a second report for the same
    /// replica changes nothing.
    pub fn record_corrupt(
        &mut self,
        block: &Block,
        node: &NodeId,
        reason: CorruptionReason,
        now: u64,
    ) -> CorruptOutcome {
        let Some(record) = self.blocks.get(&block.id) else {
            return CorruptOutcome::UnknownBlock;
        };
        if record.block != *block {
            return CorruptOutcome::GenerationMismatch;
        }
        if record.state == BlockState::UnderConstruction {
            return CorruptOutcome::UnderConstruction;
        }
        if !record.replicas.contains_key(node) {
            return CorruptOutcome::UnknownReplica;
        }
        if !self.corrupt.add(block.id, node, reason, now) {
            return CorruptOutcome::Duplicate;
        }

        let health = self.health(block.id).unwrap_or(BlockHealth::Healthy);
        warn!(%block, %node, %reason, %health, "Replica recorded corrupt");
        CorruptOutcome::Recorded(health)
    }

    /// A node no longer has the replica. Returns true if it was known.
    pub fn record_replica_loss(&mut self, block_id: u64, node: &NodeId) -> bool {
        let Some(record) = self.blocks.get_mut(&block_id) else {
            return false;
        };
        if record.replicas.remove(node).is_none() {
            return false;
        }
        let block = record.block;
        let was_corrupt = self.corrupt.remove(block_id, node);
        self.unindex(node, block_id);
        debug!(%block, %node, was_corrupt, "Replica removed");
        true
    }

    /// Forget every replica on a node, returning the affected block ids
    pub fn remove_node(&mut self, node: &NodeId) -> Vec<u64> {
        let blocks: Vec<u64> = self
            .node_index
            .remove(node)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        for block_id in &blocks {
            if let Some(record) = self.blocks.get_mut(block_id) {
                record.replicas.remove(node);
            }
            self.corrupt.remove(*block_id, node);
        }
        if !blocks.is_empty() {
            info!(%node, replicas = blocks.len(), "Removed all replicas of node");
        }
        blocks
    }

    fn unindex(&mut self, node: &NodeId, block_id: u64) {
        if let Some(ids) = self.node_index.get_mut(node) {
            ids.remove(&block_id);
            if ids.is_empty() {
                self.node_index.remove(node);
            }
        }
    }

    /// Block ids the catalog believes a node holds
    pub fn blocks_on(&self, node: &NodeId) -> Vec<u64> {
        self.node_index.get(node).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    pub fn is_corrupt(&self, block_id: u64, node: &NodeId) -> bool {
        self.corrupt.is_corrupt(block_id, node)
    }

    pub fn good_replicas(&self, block_id: u64) -> Vec<NodeId> {
        self.blocks
            .get(&block_id)
            .map(|record| {
                record
                    .replicas
                    .keys()
                    .filter(|node| !self.corrupt.is_corrupt(block_id, node))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn num_corrupt_replicas(&self, block_id: u64) -> usize {
        self.corrupt.count(block_id)
    }

    /// Classify a block by its replicas' corruption state
    pub fn health(&self, block_id: u64) -> Option<BlockHealth> {
        let record = self.blocks.get(&block_id)?;
        let total = record.replicas.len();
        let corrupt = self.corrupt.count(block_id);
        Some(if total == 0 {
            if record.state.is_complete() {
                BlockHealth::Missing
            } else {
                BlockHealth::Healthy
            }
        } else if corrupt == 0 {
            BlockHealth::Healthy
        } else if corrupt >= total {
            BlockHealth::Corrupt
        } else {
            BlockHealth::Degraded
        })
    }

    /// Replica locations of a block, good replicas first. Corrupt replicas are
    /// listed after them, oldest record first.
    pub fn query_locations(&self, block_id: u64) -> Option<LocatedBlock> {
        let record = self.blocks.get(&block_id)?;
        let mut locations: Vec<_> = record
            .replicas
            .keys()
            .filter(|node| !self.corrupt.is_corrupt(block_id, node))
            .map(|node| ReplicaLocation {
                node: node.clone(),
                corrupt: false,
            })
            .collect();
        locations.extend(
            self.corrupt
                .nodes(block_id)
                .into_iter()
                .map(|node| ReplicaLocation { node, corrupt: true }),
        );
        Some(LocatedBlock {
            block: record.block,
            offset: 0,
            length: record.visible_length(),
            locations,
            corrupt: self.health(block_id).is_some_and(|h| h.is_corrupt()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u32) -> NodeId {
        NodeId::new(format!("dn-{n}"))
    }

    /// A complete block of 1024 bytes with replicas on the given nodes
    fn catalog_with_block(replicas: &[u32]) -> (BlockCatalog, Block) {
        let mut catalog = BlockCatalog::new();
        let block = Block::new(1, 1000);
        catalog.add_block(block, "/f", 3);
        for n in replicas {
            catalog.add_replica(
                1,
                &node(*n),
                ReplicaRecord {
                    observed_length: 1024,
                    last_verified: None,
                    stale_generation: None,
                },
            );
        }
        catalog.commit_block(&block, 1024).unwrap();
        catalog.complete_block(1, 0).unwrap();
        (catalog, block)
    }

    #[test]
    fn corrupt_report_is_idempotent() {
        let (mut catalog, block) = catalog_with_block(&[1, 2, 3]);
        assert_eq!(
            catalog.record_corrupt(&block, &node(1), CorruptionReason::ChecksumMismatch, 5),
            CorruptOutcome::Recorded(BlockHealth::Degraded)
        );
        assert_eq!(
            catalog.record_corrupt(&block, &node(1), CorruptionReason::ChecksumMismatch, 6),
            CorruptOutcome::Duplicate
        );
        assert_eq!(catalog.num_corrupt_replicas(1), 1);
        assert_eq!(catalog.good_replicas(1).len(), 2);
    }

    #[test]
    fn all_replicas_corrupt_makes_block_corrupt() {
        let (mut catalog, block) = catalog_with_block(&[1, 2, 3]);
        for n in 1..=2 {
            catalog.record_corrupt(&block, &node(n), CorruptionReason::ChecksumMismatch, 0);
            assert_eq!(catalog.health(1), Some(BlockHealth::Degraded));
        }
        catalog.record_corrupt(&block, &node(3), CorruptionReason::ChecksumMismatch, 0);
        assert_eq!(catalog.health(1), Some(BlockHealth::Corrupt));

        let located = catalog.query_locations(1).unwrap();
        assert!(located.corrupt);
        assert_eq!(located.locations.len(), 3);
        assert_eq!(located.readable_locations().len(), 3);

        // A good replica appearing flips it back
        catalog.add_replica(1, &node(4), ReplicaRecord::default());
        assert_eq!(catalog.health(1), Some(BlockHealth::Degraded));
        let located = catalog.query_locations(1).unwrap();
        assert!(!located.corrupt);
        assert_eq!(located.readable_locations(), vec![node(4)]);
    }

    #[test]
    fn good_replicas_are_listed_first() {
        let (mut catalog, block) = catalog_with_block(&[1, 2, 3]);
        catalog.record_corrupt(&block, &node(1), CorruptionReason::ChecksumMismatch, 0);

        let located = catalog.query_locations(1).unwrap();
        let order: Vec<_> = located.locations.iter().map(|l| (l.node.clone(), l.corrupt)).collect();
        assert_eq!(order, vec![(node(2), false), (node(3), false), (node(1), true)]);
        assert_eq!(located.readable_locations(), vec![node(2), node(3)]);
    }

    #[test]
    fn corrupt_report_for_unknown_replica_is_ignored() {
        let (mut catalog, block) = catalog_with_block(&[1, 2]);
        assert_eq!(
            catalog.record_corrupt(&block, &node(9), CorruptionReason::ChecksumMismatch, 0),
            CorruptOutcome::UnknownReplica
        );
        assert_eq!(
            catalog.record_corrupt(&Block::new(1, 999), &node(1), CorruptionReason::ChecksumMismatch, 0),
            CorruptOutcome::GenerationMismatch
        );
        assert_eq!(
            catalog.record_corrupt(&Block::new(2, 1000), &node(1), CorruptionReason::ChecksumMismatch, 0),
            CorruptOutcome::UnknownBlock
        );
        assert_eq!(catalog.num_corrupt_replicas(1), 0);
    }

    #[test]
    fn block_under_construction_is_never_marked_corrupt() {
        let mut catalog = BlockCatalog::new();
        let block = Block::new(5, 1000);
        catalog.add_block(block, "/f", 3);
        catalog.add_replica(5, &node(1), ReplicaRecord::default());
        assert_eq!(
            catalog.record_corrupt(&block, &node(1), CorruptionReason::ChecksumMismatch, 0),
            CorruptOutcome::UnderConstruction
        );
        assert_eq!(catalog.health(5), Some(BlockHealth::Healthy));
    }

    #[test]
    fn replica_loss_removes_corrupt_record() {
        let (mut catalog, block) = catalog_with_block(&[1, 2, 3]);
        catalog.record_corrupt(&block, &node(2), CorruptionReason::ChecksumMismatch, 0);

        assert!(catalog.record_replica_loss(1, &node(2)));
        assert!(!catalog.record_replica_loss(1, &node(2)));
        assert_eq!(catalog.num_corrupt_replicas(1), 0);
        assert!(catalog.blocks_on(&node(2)).is_empty());
        assert_eq!(catalog.health(1), Some(BlockHealth::Healthy));
    }

    #[test]
    fn complete_block_without_replicas_is_missing() {
        let (mut catalog, _) = catalog_with_block(&[1]);
        assert_eq!(catalog.remove_node(&node(1)), vec![1]);
        assert_eq!(catalog.health(1), Some(BlockHealth::Missing));
    }

    #[test]
    fn completing_marks_short_replicas_corrupt() {
        let mut catalog = BlockCatalog::new();
        let block = Block::new(3, 1000);
        catalog.add_block(block, "/f", 2);
        catalog.add_replica(
            3,
            &node(1),
            ReplicaRecord {
                observed_length: 100,
                last_verified: None,
                stale_generation: None,
            },
        );
        catalog.add_replica(
            3,
            &node(2),
            ReplicaRecord {
                observed_length: 60,
                last_verified: None,
                stale_generation: None,
            },
        );
        assert_eq!(catalog.query_locations(3).unwrap().length, 100);

        catalog.commit_block(&block, 100).unwrap();
        catalog.complete_block(3, 0).unwrap();
        assert!(catalog.is_corrupt(3, &node(2)));
        assert!(!catalog.is_corrupt(3, &node(1)));
    }

    #[test]
    fn lifecycle_errors_surface() {
        let mut catalog = BlockCatalog::new();
        let block = Block::new(4, 1000);
        catalog.add_block(block, "/f", 3);
        assert!(matches!(
            catalog.complete_block(4, 0),
            Err(CatalogError::Lifecycle {
                source: LifecycleError::NotCommitted,
                ..
            })
        ));
        assert!(matches!(catalog.commit_block(&Block::new(4, 1), 10), Err(CatalogError::GenerationMismatch { .. })));
    }
}
