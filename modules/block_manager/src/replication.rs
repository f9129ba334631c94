//! Replication scheduler.
//!
//! Each tick compares every complete block's good replica count with its
//! target and emits at most one task per block: a copy when it is short, or
//! the removal of one corrupt or excess replica once it is back at target.
//! Decisions are re-derived from the catalog every tick; pending tasks only
//! stop the same work being issued twice before it is confirmed or expires.

use palisade_common::{InvalidationTask, NodeId, ReplicationTask};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::catalog::BlockCatalog;
use crate::datanodes::DataNodeRegistry;
use crate::placement::PlacementPolicy;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub task_timeout_ms: u64,

    /// In-flight copies one node may be the source of
    pub max_replication_streams: usize,

    pub unschedulable_warn_ticks: u32,
}

#[derive(Debug, Clone)]
struct Pending<T> {
    task: T,
    expires_at: u64,
}

/// Work produced by one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickResult {
    pub replications: Vec<ReplicationTask>,
    pub invalidations: Vec<InvalidationTask>,
    pub expired: usize,
}

impl TickResult {
    pub fn is_empty(&self) -> bool {
        self.replications.is_empty() && self.invalidations.is_empty()
    }
}

#[derive(Debug)]
pub struct ReplicationScheduler {
    config: SchedulerConfig,
    replications: BTreeMap<u64, Vec<Pending<ReplicationTask>>>,
    invalidations: BTreeMap<u64, Vec<Pending<InvalidationTask>>>,

    /// Consecutive ticks a block needed a copy but none could be scheduled
    unschedulable: BTreeMap<u64, u32>,
}

impl ReplicationScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            replications: BTreeMap::new(),
            invalidations: BTreeMap::new(),
            unschedulable: BTreeMap::new(),
        }
    }

    pub fn pending_replications(&self) -> usize {
        self.replications.values().map(Vec::len).sum()
    }

    pub fn pending_invalidations(&self) -> usize {
        self.invalidations.values().map(Vec::len).sum()
    }

    pub fn pending_targets(&self, block_id: u64) -> Vec<NodeId> {
        self.replications
            .get(&block_id)
            .map(|tasks| tasks.iter().map(|p| p.task.target.clone()).collect())
            .unwrap_or_default()
    }

    fn pending_invalidation_nodes(&self, block_id: u64) -> BTreeSet<NodeId> {
        self.invalidations
            .get(&block_id)
            .map(|tasks| tasks.iter().map(|p| p.task.node.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_invalidation_pending(&self, block_id: u64, node: &NodeId) -> bool {
        self.invalidations
            .get(&block_id)
            .is_some_and(|tasks| tasks.iter().any(|p| p.task.node == *node))
    }

    pub fn unschedulable_ticks(&self, block_id: u64) -> u32 {
        self.unschedulable.get(&block_id).copied().unwrap_or(0)
    }

    /// Track an invalidation issued outside the tick (orphans, deletions)
    pub fn track_invalidation(&mut self, task: InvalidationTask, now: u64) -> bool {
        if self.is_invalidation_pending(task.block.id, &task.node) {
            return false;
        }
        let expires_at = now.saturating_add(self.config.task_timeout_ms);
        self.invalidations.entry(task.block.id).or_default().push(Pending { task, expires_at });
        true
    }

    /// A replica of the block showed up on `node`; confirms a copy to it
    pub fn replica_added(&mut self, block_id: u64, node: &NodeId) {
        if let Some(tasks) = self.replications.get_mut(&block_id) {
            let before = tasks.len();
            tasks.retain(|p| p.task.target != *node);
            if tasks.len() != before {
                debug!(block_id, %node, "Replication confirmed");
            }
            if tasks.is_empty() {
                self.replications.remove(&block_id);
            }
        }
    }

    /// A replica of the block is gone from `node`; confirms a removal there
    pub fn replica_removed(&mut self, block_id: u64, node: &NodeId) {
        if let Some(tasks) = self.invalidations.get_mut(&block_id) {
            tasks.retain(|p| p.task.node != *node);
            if tasks.is_empty() {
                self.invalidations.remove(&block_id);
            }
        }
    }

    /// A node's full report omits these blocks' ids; confirms removals there
    pub fn confirm_absent(&mut self, node: &NodeId, reported: &BTreeSet<u64>) {
        for (block_id, tasks) in self.invalidations.iter_mut() {
            if !reported.contains(block_id) {
                tasks.retain(|p| p.task.node != *node);
            }
        }
        self.invalidations.retain(|_, tasks| !tasks.is_empty());
    }

    pub fn forget_block(&mut self, block_id: u64) {
        self.replications.remove(&block_id);
        self.unschedulable.remove(&block_id);
    }

    /// Drop tasks involving a dead node; they are re-derived next tick
    pub fn forget_node(&mut self, node: &NodeId) {
        for tasks in self.replications.values_mut() {
            tasks.retain(|p| p.task.source != *node && p.task.target != *node);
        }
        self.replications.retain(|_, tasks| !tasks.is_empty());
        for tasks in self.invalidations.values_mut() {
            tasks.retain(|p| p.task.node != *node);
        }
        self.invalidations.retain(|_, tasks| !tasks.is_empty());
    }

    fn expire(&mut self, now: u64) -> usize {
        let mut expired = 0;
        for tasks in self.replications.values_mut() {
            let before = tasks.len();
            tasks.retain(|p| p.expires_at > now);
            expired += before - tasks.len();
        }
        self.replications.retain(|_, tasks| !tasks.is_empty());
        for tasks in self.invalidations.values_mut() {
            let before = tasks.len();
            tasks.retain(|p| p.expires_at > now);
            expired += before - tasks.len();
        }
        self.invalidations.retain(|_, tasks| !tasks.is_empty());
        if expired > 0 {
            info!(expired, "Unconfirmed tasks expired");
        }
        expired
    }

    /// Copies each node is currently the source of
    fn source_load(&self) -> BTreeMap<NodeId, usize> {
        let mut load = BTreeMap::new();
        for task in self.replications.values().flatten() {
            *load.entry(task.task.source.clone()).or_default() += 1;
        }
        load
    }

    pub fn tick(
        &mut self,
        catalog: &BlockCatalog,
        nodes: &DataNodeRegistry,
        placement: &dyn PlacementPolicy,
        now: u64,
    ) -> TickResult {
        let mut result = TickResult {
            expired: self.expire(now),
            ..TickResult::default()
        };
        let mut source_load = self.source_load();
        let expires_at = now.saturating_add(self.config.task_timeout_ms);

        let known: BTreeSet<u64> = catalog.iter().map(|r| r.block.id).collect();
        self.unschedulable.retain(|id, _| known.contains(id));

        for record in catalog.iter().filter(|r| r.state.is_complete()) {
            let block_id = record.block.id;
            let target = record.target_replication as usize;
            let leaving = self.pending_invalidation_nodes(block_id);
            let good: Vec<NodeId> = catalog
                .good_replicas(block_id)
                .into_iter()
                .filter(|node| !leaving.contains(node))
                .collect();
            let pending = self.replications.get(&block_id).map(Vec::len).unwrap_or(0);

            if good.len() + pending < target {
                match self.plan_copy(catalog, nodes, placement, block_id, &good, &source_load) {
                    Some(task) => {
                        info!(block = %task.block, source = %task.source, target = %task.target,
                              good = good.len(), wanted = target, "Scheduling replication");
                        *source_load.entry(task.source.clone()).or_default() += 1;
                        self.unschedulable.remove(&block_id);
                        self.replications.entry(block_id).or_default().push(Pending {
                            task: task.clone(),
                            expires_at,
                        });
                        result.replications.push(task);
                    }
                    None => {
                        let ticks = self.unschedulable.entry(block_id).or_default();
                        *ticks += 1;
                        if *ticks == self.config.unschedulable_warn_ticks {
                            warn!(block = %record.block, good = good.len(), wanted = target,
                                  ticks = *ticks, "Block cannot be re-replicated");
                        } else {
                            debug!(block = %record.block, "No replication source or target this tick");
                        }
                    }
                }
                continue;
            }
            self.unschedulable.remove(&block_id);

            if good.len() < target || !leaving.is_empty() {
                continue;
            }

            let corrupt = catalog.corrupt_replicas().nodes(block_id);
            let victim = if let Some(node) = corrupt.into_iter().next() {
                Some(node)
            } else if good.len() > target {
                placement.choose_excess(nodes, &good)
            } else {
                None
            };

            if let Some(node) = victim {
                let task = InvalidationTask {
                    block: record.replica_block(&node),
                    node,
                };
                info!(block = %task.block, node = %task.node, "Scheduling invalidation");
                self.invalidations.entry(block_id).or_default().push(Pending {
                    task: task.clone(),
                    expires_at,
                });
                result.invalidations.push(task);
            }
        }

        result
    }

    fn plan_copy(
        &self,
        catalog: &BlockCatalog,
        nodes: &DataNodeRegistry,
        placement: &dyn PlacementPolicy,
        block_id: u64,
        good: &[NodeId],
        source_load: &BTreeMap<NodeId, usize>,
    ) -> Option<ReplicationTask> {
        let record = catalog.get(block_id)?;
        let source = good
            .iter()
            .filter(|node| nodes.is_alive(node))
            .map(|node| (source_load.get(node).copied().unwrap_or(0), node))
            .filter(|(load, _)| *load < self.config.max_replication_streams)
            .min()
            .map(|(_, node)| node.clone())?;

        let mut exclude: BTreeSet<NodeId> = record.replicas.keys().cloned().collect();
        exclude.extend(self.pending_targets(block_id));
        let target =
            placement.choose_targets(nodes, &exclude, 1, record.target_length).into_iter().next()?;

        Some(ReplicationTask {
            block: record.block,
            source,
            target,
        })
    }
}
