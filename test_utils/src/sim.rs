//! Synchronous in-process cluster.
//!
//! Drives the real block manager [`State`] and real [`DataNode`]s over
//! in-memory stores, delivering every message immediately instead of over a
//! bus. Time only moves when [`SimCluster::advance`] is called.

use anyhow::Result;
use config::Config;
use palisade_common::{
    checksum::Checksums,
    commands::datanode::DataNodeCommand,
    messages::{DataNodeMessage, ReportCorruptMessage},
    Block, BlockHealth, NodeId,
};
use palisade_module_block_manager::{
    catalog::CorruptOutcome,
    configuration::BlockManagerConfig,
    state::{NodeCommand, State},
};
use palisade_module_data_node::{
    block_verifier::{ScanOutcome, VerifierConfig},
    node::{DataNode, Outgoing},
    stores::{memory::MemoryReplicaStore, ReplicaStore},
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on scans per node in one `verify_all` pass
const MAX_SCANS_PER_PASS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub nodes: u32,

    /// Nodes are spread round-robin over this many racks
    pub racks: u32,

    pub capacity_bytes: u64,
    pub bytes_per_checksum: u32,
    pub scan_period: Duration,
    pub max_io_retries: u32,

    /// Time one [`SimCluster::cycle`] advances the clock by
    pub cycle: Duration,

    /// Overrides for the block manager's configuration
    pub manager: Config,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            nodes: 4,
            racks: 4,
            capacity_bytes: 1 << 30,
            bytes_per_checksum: 64,
            scan_period: Duration::from_secs(60),
            max_io_retries: 2,
            cycle: Duration::from_secs(1),
            manager: Config::default(),
        }
    }
}

impl SimOptions {
    pub fn nodes(nodes: u32) -> Self {
        Self {
            nodes,
            racks: nodes,
            ..Self::default()
        }
    }
}

struct SimNode {
    node: DataNode,
    store: Arc<MemoryReplicaStore>,
    rack: String,
    running: bool,
}

pub struct SimCluster {
    options: SimOptions,
    manager: State,
    nodes: BTreeMap<NodeId, SimNode>,
    commands: VecDeque<NodeCommand>,
    now: u64,
}

pub fn node_id(n: u32) -> NodeId {
    NodeId::new(format!("dn-{n}"))
}

impl SimCluster {
    /// Build a cluster and register every node with a heartbeat and block report
    pub fn new(options: SimOptions) -> Result<Self> {
        let config = BlockManagerConfig::try_load(&options.manager)?;
        let mut cluster = Self {
            manager: State::new(&config),
            nodes: BTreeMap::new(),
            commands: VecDeque::new(),
            now: 1_000,
            options,
        };
        for n in 1..=cluster.options.nodes {
            let id = node_id(n);
            let rack = format!("/rack-{}", n % cluster.options.racks.max(1));
            let store = Arc::new(MemoryReplicaStore::new());
            let node = cluster.build_node(&id, &rack, store.clone());
            cluster.nodes.insert(
                id.clone(),
                SimNode {
                    node,
                    store,
                    rack,
                    running: true,
                },
            );
            cluster.start_node(&id);
        }
        info!(nodes = cluster.nodes.len(), "Simulated cluster started");
        Ok(cluster)
    }

    fn build_node(&self, id: &NodeId, rack: &str, store: Arc<MemoryReplicaStore>) -> DataNode {
        let store: Arc<dyn ReplicaStore> = store;
        DataNode::new(
            id.clone(),
            rack.to_string(),
            self.options.capacity_bytes,
            self.options.bytes_per_checksum,
            store,
            VerifierConfig {
                scan_period: self.options.scan_period,
                throttle_bytes_per_second: None,
                max_io_retries: self.options.max_io_retries,
            },
        )
    }

    /// Startup sequence of a node: heartbeat, then a full block report
    fn start_node(&mut self, id: &NodeId) {
        let Some(sim) = self.nodes.get(id) else {
            return;
        };
        let outgoing = vec![
            Outgoing::Event(DataNodeMessage::Heartbeat(sim.node.heartbeat())),
            Outgoing::Event(DataNodeMessage::BlockReport(sim.node.block_report())),
        ];
        self.deliver(outgoing);
        self.pump();
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by.as_millis() as u64;
    }

    pub fn manager(&self) -> &State {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut State {
        &mut self.manager
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn data_node(&self, id: &NodeId) -> Option<&DataNode> {
        self.nodes.get(id).map(|sim| &sim.node)
    }

    pub fn store(&self, id: &NodeId) -> Option<&Arc<MemoryReplicaStore>> {
        self.nodes.get(id).map(|sim| &sim.store)
    }

    pub fn is_running(&self, id: &NodeId) -> bool {
        self.nodes.get(id).is_some_and(|sim| sim.running)
    }

    /// Nodes whose store currently holds the block, in id order
    pub fn holders(&self, block: &Block) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, sim)| sim.store.info(block.id).is_some_and(|info| info.block == *block))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Route what a node or client produced
    pub fn deliver(&mut self, outgoing: Vec<Outgoing>) {
        for item in outgoing {
            match item {
                Outgoing::Event(event) => {
                    let commands = self.manager.handle_datanode_message(&event, self.now);
                    self.commands.extend(commands);
                }
                Outgoing::Corrupt(report) => {
                    self.report_corrupt(&report);
                }
                Outgoing::Command { node, command } => {
                    self.commands.push_back(NodeCommand { node, command })
                }
            }
        }
    }

    pub fn report_corrupt(&mut self, report: &ReportCorruptMessage) -> CorruptOutcome {
        self.manager.report_corrupt(report, self.now)
    }

    pub fn queue_commands(&mut self, commands: Vec<NodeCommand>) {
        self.commands.extend(commands);
    }

    /// Execute queued node commands until none remain. Commands for stopped
    /// nodes are lost, as they would be on the bus.
    pub fn pump(&mut self) {
        while let Some(NodeCommand { node, command }) = self.commands.pop_front() {
            let outgoing = match self.nodes.get(&node) {
                Some(sim) if sim.running => sim.node.handle_command(command, self.now),
                _ => {
                    debug!(%node, "Dropping command for stopped node");
                    continue;
                }
            };
            self.deliver(outgoing);
        }
    }

    fn running(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|(_, sim)| sim.running).map(|(id, _)| id.clone()).collect()
    }

    pub fn heartbeats(&mut self) {
        for id in self.running() {
            if let Some(sim) = self.nodes.get(&id) {
                let heartbeat = sim.node.heartbeat();
                self.deliver(vec![Outgoing::Event(DataNodeMessage::Heartbeat(heartbeat))]);
            }
        }
        self.pump();
    }

    pub fn block_reports(&mut self) {
        for id in self.running() {
            if let Some(sim) = self.nodes.get(&id) {
                let report = sim.node.block_report();
                self.deliver(vec![Outgoing::Event(DataNodeMessage::BlockReport(report))]);
            }
        }
        self.pump();
    }

    /// Let every running verifier scan whatever is due right now
    pub fn verify_all(&mut self) -> Vec<ScanOutcome> {
        let mut outcomes = Vec::new();
        for id in self.running() {
            for _ in 0..MAX_SCANS_PER_PASS {
                let Some(sim) = self.nodes.get(&id) else {
                    break;
                };
                let (outcome, outgoing) = sim.node.verify_once(self.now);
                let Some(outcome) = outcome else {
                    break;
                };
                outcomes.push(outcome);
                self.deliver(outgoing);
            }
        }
        self.pump();
        outcomes
    }

    /// One scheduler tick with its commands executed
    pub fn tick(&mut self) {
        let commands = self.manager.tick(self.now);
        self.commands.extend(commands);
        self.pump();
    }

    /// Advance one cycle: heartbeats, reports, verification, then a tick
    pub fn cycle(&mut self) {
        self.advance(self.options.cycle);
        self.heartbeats();
        self.block_reports();
        self.verify_all();
        self.tick();
    }

    /// Cycle until `done` holds, giving up after `max_cycles`
    pub fn run_until(&mut self, max_cycles: usize, done: impl Fn(&SimCluster) -> bool) -> bool {
        for _ in 0..max_cycles {
            if done(self) {
                return true;
            }
            self.cycle();
        }
        done(self)
    }

    pub fn stop_node(&mut self, id: &NodeId) {
        if let Some(sim) = self.nodes.get_mut(id) {
            sim.running = false;
            info!(node = %id, "Node stopped");
        }
    }

    /// Restart a node over its existing store with a fresh verifier
    pub fn restart_node(&mut self, id: &NodeId) {
        let Some((rack, store)) = self.nodes.get(id).map(|sim| (sim.rack.clone(), sim.store.clone()))
        else {
            return;
        };
        let node = self.build_node(id, &rack, store);
        if let Some(sim) = self.nodes.get_mut(id) {
            sim.node = node;
            sim.running = true;
        }
        info!(node = %id, "Node restarted");
        self.start_node(id);
    }

    /// Replace whatever a node holds for `block` with a clean copy of `data`
    pub fn restore_replica(&mut self, id: &NodeId, block: Block, data: &[u8]) {
        let checksums = Checksums::compute(data, self.options.bytes_per_checksum);
        self.commands.push_back(NodeCommand {
            node: id.clone(),
            command: DataNodeCommand::Invalidate {
                blocks: vec![block],
            },
        });
        self.commands.push_back(NodeCommand {
            node: id.clone(),
            command: DataNodeCommand::Receive {
                block,
                source: id.clone(),
                data: data.to_vec(),
                checksums,
            },
        });
        self.pump();
    }

    pub fn health(&self, block: &Block) -> Option<BlockHealth> {
        self.manager.catalog().health(block.id)
    }

    pub fn num_corrupt_replicas(&self, block: &Block) -> usize {
        self.manager.catalog().num_corrupt_replicas(block.id)
    }

    pub fn good_replicas(&self, block: &Block) -> usize {
        self.manager.catalog().good_replicas(block.id).len()
    }
}
