//! Coordinator state: catalog, namespace, node registry and scheduler behind
//! one owner. Every mutation is a method here and returns the commands to send
//! to storage nodes; nothing in this module performs I/O.

use palisade_common::{
    commands::{
        datanode::DataNodeCommand,
        namespace::{NamespaceCommand, NamespaceCommandResponse},
    },
    messages::{
        BlockReportMessage, DataNodeMessage, HeartbeatMessage, ReplicaDeletedMessage,
        ReplicaReceivedMessage, ReportCorruptMessage,
    },
    queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse, ClusterHealth},
    Block, BlockHealth, CorruptionReason, InvalidationTask, LocatedBlock, NodeId, ReplicaLocation,
    ReplicaState, ReportedReplica,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::catalog::{BlockCatalog, CorruptOutcome, ReplicaRecord};
use crate::configuration::BlockManagerConfig;
use crate::datanodes::{DataNodeRegistry, HeartbeatOutcome};
use crate::namespace::{Namespace, NamespaceError};
use crate::placement::{PlacementPolicy, RackAwarePlacement};
use crate::replication::{ReplicationScheduler, TickResult};

/// A command addressed to one storage node
#[derive(Debug, Clone)]
pub struct NodeCommand {
    pub node: NodeId,
    pub command: DataNodeCommand,
}

pub struct State {
    catalog: BlockCatalog,
    namespace: Namespace,
    nodes: DataNodeRegistry,
    scheduler: ReplicationScheduler,
    placement: Box<dyn PlacementPolicy>,
    default_replication: u16,
    block_size: u64,
}

impl State {
    pub fn new(config: &BlockManagerConfig) -> Self {
        Self::with_placement(
            config,
            Box::new(RackAwarePlacement::new(config.consider_load_in_placement)),
        )
    }

    pub fn with_placement(config: &BlockManagerConfig, placement: Box<dyn PlacementPolicy>) -> Self {
        Self {
            catalog: BlockCatalog::new(),
            namespace: Namespace::new(),
            nodes: DataNodeRegistry::new(config.heartbeat_expiry_ms()),
            scheduler: ReplicationScheduler::new(config.scheduler()),
            placement,
            default_replication: config.default_replication,
            block_size: config.block_size,
        }
    }

    pub fn catalog(&self) -> &BlockCatalog {
        &self.catalog
    }

    pub fn nodes(&self) -> &DataNodeRegistry {
        &self.nodes
    }

    pub fn scheduler(&self) -> &ReplicationScheduler {
        &self.scheduler
    }

    pub fn handle_datanode_message(
        &mut self,
        message: &DataNodeMessage,
        now: u64,
    ) -> Vec<NodeCommand> {
        match message {
            DataNodeMessage::Heartbeat(heartbeat) => self.heartbeat(heartbeat, now),
            DataNodeMessage::BlockReport(report) => self.process_block_report(report, now),
            DataNodeMessage::ReplicaReceived(received) => self.replica_received(received, now),
            DataNodeMessage::ReplicaDeleted(deleted) => {
                self.replica_deleted(deleted);
                Vec::new()
            }
        }
    }

    fn heartbeat(&mut self, heartbeat: &HeartbeatMessage, now: u64) -> Vec<NodeCommand> {
        match self.nodes.heartbeat(heartbeat, now) {
            HeartbeatOutcome::Revived => vec![NodeCommand {
                node: heartbeat.node.clone(),
                command: DataNodeCommand::SendBlockReport,
            }],
            _ => Vec::new(),
        }
    }

    /// Messages from a node declared dead are dropped until it heartbeats
    fn accept_from(&mut self, node: &NodeId, now: u64) -> bool {
        if self.nodes.get(node).is_some_and(|d| !d.alive) {
            debug!(%node, "Ignoring message from dead node");
            return false;
        }
        self.nodes.touch(node, now);
        true
    }

    /// Reconcile the catalog with a node's full inventory
    pub fn process_block_report(
        &mut self,
        report: &BlockReportMessage,
        now: u64,
    ) -> Vec<NodeCommand> {
        let node = &report.node;
        if !self.accept_from(node, now) {
            return Vec::new();
        }

        let reported: BTreeSet<u64> = report.replicas.iter().map(|r| r.block.id).collect();
        let mut lost = 0;
        for block_id in self.catalog.blocks_on(node) {
            if !reported.contains(&block_id) && self.catalog.record_replica_loss(block_id, node) {
                lost += 1;
            }
        }
        self.scheduler.confirm_absent(node, &reported);

        let mut orphans = Vec::new();
        for replica in &report.replicas {
            if let Some(orphan) = self.reconcile_replica(node, replica, now) {
                orphans.push(orphan);
            }
        }

        info!(%node, replicas = report.replicas.len(), lost, orphans = orphans.len(), "Processed block report");
        self.invalidate_orphans(node, orphans, now)
    }

    fn replica_received(&mut self, received: &ReplicaReceivedMessage, now: u64) -> Vec<NodeCommand> {
        if !self.accept_from(&received.node, now) {
            return Vec::new();
        }
        let replica = ReportedReplica {
            block: received.block,
            observed_length: received.length,
            state: ReplicaState::Finalized,
            last_verified: None,
            corrupt: false,
        };
        let orphans = self.reconcile_replica(&received.node, &replica, now).into_iter().collect();
        self.invalidate_orphans(&received.node, orphans, now)
    }

    fn replica_deleted(&mut self, deleted: &ReplicaDeletedMessage) {
        self.catalog.record_replica_loss(deleted.block.id, &deleted.node);
        self.scheduler.replica_removed(deleted.block.id, &deleted.node);
    }

    /// Fold one replica a node says it holds into the catalog. Returns the
    /// block if the catalog has no such block at all.
    fn reconcile_replica(
        &mut self,
        node: &NodeId,
        replica: &ReportedReplica,
        now: u64,
    ) -> Option<Block> {
        let Some(record) = self.catalog.get(replica.block.id) else {
            return Some(replica.block);
        };
        let current = record.block;
        let complete = record.state.is_complete();
        let target_length = record.target_length;

        if replica.block.generation_stamp > current.generation_stamp {
            debug!(%node, reported = %replica.block, %current, "Ignoring replica with newer generation");
            return None;
        }

        self.catalog.add_replica(
            current.id,
            node,
            ReplicaRecord {
                observed_length: replica.observed_length,
                last_verified: replica.last_verified,
                stale_generation: (replica.block.generation_stamp < current.generation_stamp)
                    .then_some(replica.block.generation_stamp),
            },
        );
        if !complete {
            return None;
        }

        let reason = if replica.block.generation_stamp < current.generation_stamp {
            Some(CorruptionReason::StaleGeneration)
        } else if replica.observed_length != target_length {
            Some(CorruptionReason::Truncated)
        } else if replica.corrupt {
            Some(CorruptionReason::ChecksumMismatch)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.catalog.record_corrupt(&current, node, reason, now);
            }
            None if !self.catalog.is_corrupt(current.id, node) => {
                self.scheduler.replica_added(current.id, node);
            }
            None => {}
        }
        None
    }

    fn invalidate_orphans(&mut self, node: &NodeId, orphans: Vec<Block>, now: u64) -> Vec<NodeCommand> {
        let blocks: Vec<Block> = orphans
            .into_iter()
            .filter(|block| {
                self.scheduler.track_invalidation(
                    InvalidationTask {
                        block: *block,
                        node: node.clone(),
                    },
                    now,
                )
            })
            .collect();
        if blocks.is_empty() {
            return Vec::new();
        }
        info!(%node, count = blocks.len(), "Invalidating replicas of unknown blocks");
        vec![NodeCommand {
            node: node.clone(),
            command: DataNodeCommand::Invalidate { blocks },
        }]
    }

    /// A storage node or client found a replica corrupt
    pub fn report_corrupt(&mut self, report: &ReportCorruptMessage, now: u64) -> CorruptOutcome {
        let outcome = self.catalog.record_corrupt(&report.block, &report.node, report.reason, now);
        match outcome {
            CorruptOutcome::Recorded(health) => {
                info!(block = %report.block, node = %report.node, source = ?report.source,
                      observed_length = report.observed_length, %health, "Corrupt replica reported");
            }
            CorruptOutcome::Duplicate => {
                debug!(block = %report.block, node = %report.node, "Corrupt replica already known");
            }
            other => {
                warn!(block = %report.block, node = %report.node, outcome = ?other, "Corrupt report not applied");
            }
        }
        outcome
    }

    /// Scheduler tick: expire silent nodes, then plan replication work
    pub fn tick(&mut self, now: u64) -> Vec<NodeCommand> {
        for node in self.nodes.expire(now) {
            self.catalog.remove_node(&node);
            self.scheduler.forget_node(&node);
        }
        let result = self.scheduler.tick(&self.catalog, &self.nodes, self.placement.as_ref(), now);
        commands_from(result)
    }

    pub fn handle_namespace(
        &mut self,
        command: NamespaceCommand,
        now: u64,
    ) -> (NamespaceCommandResponse, Vec<NodeCommand>) {
        let result = match command {
            NamespaceCommand::CreateFile { path, replication } => self
                .namespace
                .create(&path, replication.unwrap_or(self.default_replication))
                .map(|_| (NamespaceCommandResponse::Created { path }, Vec::new())),

            NamespaceCommand::AddBlock { path } => self
                .add_block(&path, now)
                .map(|located| (NamespaceCommandResponse::BlockAdded(located), Vec::new())),

            NamespaceCommand::CommitBlock { block, length } => self
                .catalog
                .commit_block(&block, length)
                .map(|_| (NamespaceCommandResponse::Committed { block }, Vec::new()))
                .map_err(NamespaceError::from),

            NamespaceCommand::CloseFile { path } => self
                .namespace
                .close(&path, &mut self.catalog, now)
                .map(|_| (NamespaceCommandResponse::Closed { path }, Vec::new())),

            NamespaceCommand::DeleteFile { path } => self.delete_file(&path, now),
        };
        result.unwrap_or_else(|e| (NamespaceCommandResponse::Error(e.to_string()), Vec::new()))
    }

    fn add_block(&mut self, path: &str, now: u64) -> Result<LocatedBlock, NamespaceError> {
        let replication = self
            .namespace
            .file(path)
            .map(|f| f.replication as usize)
            .ok_or_else(|| NamespaceError::FileNotFound(path.to_string()))?;
        let targets =
            self.placement.choose_targets(&self.nodes, &BTreeSet::new(), replication, self.block_size);
        if targets.is_empty() {
            return Err(NamespaceError::NoTargets(path.to_string()));
        }

        let block = self.namespace.add_block(path, &mut self.catalog, now)?;
        let offset = self.namespace.located_blocks(path, 0, u64::MAX, &self.catalog)?.file_length;
        Ok(LocatedBlock {
            block,
            offset,
            length: 0,
            locations: targets
                .into_iter()
                .map(|node| ReplicaLocation {
                    node,
                    corrupt: false,
                })
                .collect(),
            corrupt: false,
        })
    }

    fn delete_file(
        &mut self,
        path: &str,
        now: u64,
    ) -> Result<(NamespaceCommandResponse, Vec<NodeCommand>), NamespaceError> {
        let removed = self.namespace.delete(path, &mut self.catalog)?;
        let mut invalidations = Vec::new();
        for record in &removed {
            self.scheduler.forget_block(record.block.id);
            for node in record.replicas.keys() {
                let task = InvalidationTask {
                    block: record.block,
                    node: node.clone(),
                };
                if self.scheduler.track_invalidation(task.clone(), now) {
                    invalidations.push(task);
                }
            }
        }
        let response = NamespaceCommandResponse::Deleted {
            path: path.to_string(),
            blocks: removed.len(),
        };
        Ok((response, commands_from(TickResult {
            invalidations,
            ..TickResult::default()
        })))
    }

    pub fn handle_query(&self, query: &BlocksStateQuery) -> BlocksStateQueryResponse {
        match query {
            BlocksStateQuery::GetLocatedBlocks {
                path,
                offset,
                length,
            } => match self.namespace.located_blocks(path, *offset, *length, &self.catalog) {
                Ok(located) => BlocksStateQueryResponse::LocatedBlocks(located),
                Err(NamespaceError::FileNotFound(_)) => BlocksStateQueryResponse::NotFound,
                Err(e) => BlocksStateQueryResponse::Error(e.to_string()),
            },
            BlocksStateQuery::GetBlockLocations { block_id } => {
                match self.catalog.query_locations(*block_id) {
                    Some(located) => BlocksStateQueryResponse::BlockLocations(located),
                    None => BlocksStateQueryResponse::NotFound,
                }
            }
            BlocksStateQuery::GetNumCorruptReplicas { block_id } => {
                match self.catalog.get(*block_id) {
                    Some(_) => BlocksStateQueryResponse::NumCorruptReplicas(
                        self.catalog.num_corrupt_replicas(*block_id),
                    ),
                    None => BlocksStateQueryResponse::NotFound,
                }
            }
            BlocksStateQuery::GetBlockHealth { block_id } => match self.catalog.health(*block_id) {
                Some(health) => BlocksStateQueryResponse::BlockHealth(health),
                None => BlocksStateQueryResponse::NotFound,
            },
            BlocksStateQuery::GetClusterHealth => {
                BlocksStateQueryResponse::ClusterHealth(self.cluster_health())
            }
        }
    }

    pub fn cluster_health(&self) -> ClusterHealth {
        let mut health = ClusterHealth {
            live_nodes: self.nodes.live_count(),
            dead_nodes: self.nodes.dead_count(),
            total_blocks: self.catalog.len(),
            corrupt_replicas: self.catalog.corrupt_replicas().total(),
            pending_replications: self.scheduler.pending_replications(),
            pending_invalidations: self.scheduler.pending_invalidations(),
            ..ClusterHealth::default()
        };
        for record in self.catalog.iter().filter(|r| r.state.is_complete()) {
            let id = record.block.id;
            if self.catalog.good_replicas(id).len() < record.target_replication as usize {
                health.under_replicated_blocks += 1;
            }
            match self.catalog.health(id) {
                Some(BlockHealth::Corrupt) => health.corrupt_blocks += 1,
                Some(BlockHealth::Missing) => health.missing_blocks += 1,
                _ => {}
            }
        }
        health
    }
}

/// Turn scheduler output into node commands, one invalidation batch per node
fn commands_from(result: TickResult) -> Vec<NodeCommand> {
    let mut commands: Vec<NodeCommand> = result
        .replications
        .into_iter()
        .map(|task| NodeCommand {
            node: task.source,
            command: DataNodeCommand::Replicate {
                block: task.block,
                target: task.target,
            },
        })
        .collect();

    let mut batches: BTreeMap<NodeId, Vec<Block>> = BTreeMap::new();
    for task in result.invalidations {
        batches.entry(task.node).or_default().push(task.block);
    }
    commands.extend(batches.into_iter().map(|(node, blocks)| NodeCommand {
        node,
        command: DataNodeCommand::Invalidate { blocks },
    }));
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Config;
    use palisade_common::ReportSource;

    const LEN: u64 = 4096;

    fn config() -> BlockManagerConfig {
        BlockManagerConfig::try_load(&Config::default()).unwrap()
    }

    fn node(n: u32) -> NodeId {
        NodeId::new(format!("dn-{n}"))
    }

    fn heartbeat(state: &mut State, n: u32, now: u64) -> Vec<NodeCommand> {
        state.handle_datanode_message(
            &DataNodeMessage::Heartbeat(HeartbeatMessage {
                node: node(n),
                rack: format!("/r{n}"),
                capacity_bytes: 1 << 40,
                used_bytes: 0,
                active_transfers: 0,
            }),
            now,
        )
    }

    /// Cluster of `nodes` live nodes and one closed single-block file
    /// replicated on the pipeline the placement chose
    fn cluster(nodes: u32) -> (State, Block, Vec<NodeId>) {
        let mut state = State::new(&config());
        for n in 1..=nodes {
            heartbeat(&mut state, n, 0);
        }
        state.handle_namespace(
            NamespaceCommand::CreateFile {
                path: "/f".into(),
                replication: Some(3),
            },
            0,
        );
        let (response, _) = state.handle_namespace(NamespaceCommand::AddBlock { path: "/f".into() }, 0);
        let NamespaceCommandResponse::BlockAdded(located) = response else {
            panic!("expected a block, got {response:?}");
        };
        let block = located.block;
        let pipeline: Vec<NodeId> = located.locations.into_iter().map(|l| l.node).collect();
        for target in &pipeline {
            state.handle_datanode_message(
                &DataNodeMessage::ReplicaReceived(ReplicaReceivedMessage {
                    node: target.clone(),
                    block,
                    length: LEN,
                }),
                0,
            );
        }
        state.handle_namespace(NamespaceCommand::CommitBlock { block, length: LEN }, 0);
        state.handle_namespace(NamespaceCommand::CloseFile { path: "/f".into() }, 0);
        (state, block, pipeline)
    }

    fn entry(block: Block, length: u64, corrupt: bool) -> ReportedReplica {
        ReportedReplica {
            block,
            observed_length: length,
            state: ReplicaState::Finalized,
            last_verified: None,
            corrupt,
        }
    }

    fn corrupt_report(block: Block, node: NodeId) -> ReportCorruptMessage {
        ReportCorruptMessage {
            block,
            node,
            observed_length: LEN,
            reason: CorruptionReason::ChecksumMismatch,
            source: ReportSource::Client,
        }
    }

    #[test]
    fn pipeline_spans_three_nodes() {
        let (state, block, pipeline) = cluster(4);
        assert_eq!(pipeline.len(), 3);
        let located = state.catalog().query_locations(block.id).unwrap();
        assert_eq!(located.good_count(), 3);
        assert_eq!(state.catalog().health(block.id), Some(BlockHealth::Healthy));
    }

    #[test]
    fn add_block_without_nodes_fails() {
        let mut state = State::new(&config());
        state.handle_namespace(
            NamespaceCommand::CreateFile {
                path: "/f".into(),
                replication: None,
            },
            0,
        );
        let (response, _) = state.handle_namespace(NamespaceCommand::AddBlock { path: "/f".into() }, 0);
        assert!(matches!(response, NamespaceCommandResponse::Error(_)));
    }

    #[test]
    fn repeated_corrupt_report_counts_once() {
        let (mut state, block, pipeline) = cluster(4);
        let report = corrupt_report(block, pipeline[0].clone());
        assert!(matches!(state.report_corrupt(&report, 1), CorruptOutcome::Recorded(BlockHealth::Degraded)));
        assert_eq!(state.report_corrupt(&report, 2), CorruptOutcome::Duplicate);

        let BlocksStateQueryResponse::NumCorruptReplicas(count) =
            state.handle_query(&BlocksStateQuery::GetNumCorruptReplicas { block_id: block.id })
        else {
            panic!("expected a count");
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn report_and_block_report_agree_on_one_record() {
        let (mut state, block, pipeline) = cluster(4);
        let holder = pipeline[1].clone();
        state.report_corrupt(&corrupt_report(block, holder.clone()), 1);
        state.process_block_report(
            &BlockReportMessage {
                node: holder,
                replicas: vec![entry(block, LEN, true)],
            },
            2,
        );
        assert_eq!(state.catalog().num_corrupt_replicas(block.id), 1);
    }

    #[test]
    fn truncated_replica_in_block_report_is_corrupt() {
        let (mut state, block, pipeline) = cluster(4);
        state.process_block_report(
            &BlockReportMessage {
                node: pipeline[2].clone(),
                replicas: vec![entry(block, LEN - 1, false)],
            },
            1,
        );
        assert!(state.catalog().is_corrupt(block.id, &pipeline[2]));
        let record = state.catalog().corrupt_replicas().get(block.id, &pipeline[2]).unwrap();
        assert_eq!(record.reason, CorruptionReason::Truncated);
    }

    #[test]
    fn stale_generation_in_block_report_is_corrupt() {
        let (mut state, block, _) = cluster(4);
        let spare = node(4);
        let stale = Block::new(block.id, block.generation_stamp - 1);
        state.process_block_report(
            &BlockReportMessage {
                node: spare.clone(),
                replicas: vec![entry(stale, LEN, false)],
            },
            1,
        );
        let record = state.catalog().corrupt_replicas().get(block.id, &spare);
        assert_eq!(record.map(|r| r.reason), Some(CorruptionReason::StaleGeneration));
    }

    #[test]
    fn stale_replica_is_invalidated_by_its_own_generation() {
        let (mut state, block, _) = cluster(4);
        let spare = node(4);
        let stale = Block::new(block.id, block.generation_stamp - 1);
        state.process_block_report(
            &BlockReportMessage {
                node: spare.clone(),
                replicas: vec![entry(stale, LEN, false)],
            },
            1,
        );

        let commands = state.tick(2);
        assert!(
            matches!(
                commands.as_slice(),
                [NodeCommand { node, command: DataNodeCommand::Invalidate { blocks } }]
                    if node == &spare && blocks == &vec![stale]
            ),
            "unexpected commands {commands:?}"
        );

        state.handle_datanode_message(
            &DataNodeMessage::ReplicaDeleted(ReplicaDeletedMessage {
                node: spare.clone(),
                block: stale,
            }),
            3,
        );
        assert_eq!(state.catalog().num_corrupt_replicas(block.id), 0);
        assert_eq!(state.catalog().health(block.id), Some(BlockHealth::Healthy));
        assert_eq!(state.scheduler().pending_invalidations(), 0);
    }

    #[test]
    fn missing_replica_in_block_report_is_lost() {
        let (mut state, block, pipeline) = cluster(4);
        state.process_block_report(
            &BlockReportMessage {
                node: pipeline[0].clone(),
                replicas: Vec::new(),
            },
            1,
        );
        assert_eq!(state.catalog().good_replicas(block.id).len(), 2);
        assert_eq!(state.cluster_health().under_replicated_blocks, 1);
    }

    #[test]
    fn orphan_replica_is_invalidated_once() {
        let (mut state, _, _) = cluster(4);
        let orphan = Block::new(99, 1000);
        let report = BlockReportMessage {
            node: node(4),
            replicas: vec![entry(orphan, 10, false)],
        };
        let commands = state.process_block_report(&report, 1);
        assert!(matches!(
            commands.as_slice(),
            [NodeCommand { command: DataNodeCommand::Invalidate { blocks }, .. }] if blocks == &vec![orphan]
        ));
        assert!(state.process_block_report(&report, 2).is_empty());

        // Report without the block confirms the deletion
        state.process_block_report(&BlockReportMessage { node: node(4), replicas: Vec::new() }, 3);
        assert_eq!(state.scheduler().pending_invalidations(), 0);
    }

    #[test]
    fn corrupt_replica_replaced_then_invalidated() {
        let (mut state, block, pipeline) = cluster(4);
        let bad = pipeline[0].clone();
        state.report_corrupt(&corrupt_report(block, bad.clone()), 1);

        let commands = state.tick(2);
        let [NodeCommand { node: source, command: DataNodeCommand::Replicate { target, .. } }] =
            commands.as_slice()
        else {
            panic!("expected one replication, got {commands:?}");
        };
        assert_ne!(source, &bad);
        assert_eq!(target, &node(4));

        state.handle_datanode_message(
            &DataNodeMessage::ReplicaReceived(ReplicaReceivedMessage {
                node: target.clone(),
                block,
                length: LEN,
            }),
            3,
        );
        let commands = state.tick(4);
        assert!(matches!(
            commands.as_slice(),
            [NodeCommand { node, command: DataNodeCommand::Invalidate { .. } }] if node == &bad
        ));

        state.handle_datanode_message(
            &DataNodeMessage::ReplicaDeleted(ReplicaDeletedMessage { node: bad, block }),
            5,
        );
        assert_eq!(state.catalog().num_corrupt_replicas(block.id), 0);
        assert_eq!(state.catalog().good_replicas(block.id).len(), 3);
        assert!(state.tick(6).is_empty());
    }

    #[test]
    fn dead_node_loses_replicas_and_must_report_again() {
        let (mut state, block, pipeline) = cluster(4);
        let expiry = config().heartbeat_expiry_ms();
        for n in 1..=4 {
            if node(n) != pipeline[0] {
                heartbeat(&mut state, n, expiry);
            }
        }
        state.tick(expiry + 1);
        assert_eq!(state.catalog().good_replicas(block.id).len(), 2);
        assert_eq!(state.nodes().dead_count(), 1);

        let n = pipeline[0].0.trim_start_matches("dn-").parse().unwrap();
        let commands = heartbeat(&mut state, n, expiry + 2);
        assert!(matches!(
            commands.as_slice(),
            [NodeCommand { command: DataNodeCommand::SendBlockReport, .. }]
        ));
    }

    #[test]
    fn delete_invalidates_every_replica() {
        let (mut state, block, _) = cluster(4);
        let (response, commands) =
            state.handle_namespace(NamespaceCommand::DeleteFile { path: "/f".into() }, 1);
        assert!(matches!(response, NamespaceCommandResponse::Deleted { blocks: 1, .. }));
        assert_eq!(commands.len(), 3);
        assert!(state.catalog().get(block.id).is_none());
        assert!(matches!(
            state.handle_query(&BlocksStateQuery::GetBlockLocations { block_id: block.id }),
            BlocksStateQueryResponse::NotFound
        ));
    }

    #[test]
    fn located_blocks_flag_corrupt_block() {
        let (mut state, block, pipeline) = cluster(4);
        for holder in &pipeline {
            state.report_corrupt(&corrupt_report(block, holder.clone()), 1);
        }
        let BlocksStateQueryResponse::LocatedBlocks(located) = state.handle_query(
            &BlocksStateQuery::GetLocatedBlocks {
                path: "/f".into(),
                offset: 0,
                length: u64::MAX,
            },
        ) else {
            panic!("expected located blocks");
        };
        assert!(located.blocks[0].corrupt);
        assert_eq!(located.blocks[0].readable_locations().len(), 3);
        assert_eq!(state.cluster_health().corrupt_blocks, 1);
    }
}
