//! Client transport into a [`SimCluster`]

use anyhow::{anyhow, Result};
use palisade_client::ClusterTransport;
use palisade_common::{
    commands::{
        datanode::{DataNodeRequest, DataNodeResponse},
        namespace::{NamespaceCommand, NamespaceCommandResponse},
    },
    messages::ReportCorruptMessage,
    queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse},
    NodeId,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sim::SimCluster;

/// Shared handle to a simulated cluster, usable by tests and by clients
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimCluster>>);

impl SimHandle {
    pub fn new(cluster: SimCluster) -> Self {
        Self(Arc::new(Mutex::new(cluster)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SimCluster> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClusterTransport for SimHandle {
    async fn namespace(&self, command: NamespaceCommand) -> Result<NamespaceCommandResponse> {
        let mut cluster = self.lock();
        let now = cluster.now();
        let (response, commands) = cluster.manager_mut().handle_namespace(command, now);
        cluster.queue_commands(commands);
        cluster.pump();
        Ok(response)
    }

    async fn query_blocks(&self, query: BlocksStateQuery) -> Result<BlocksStateQueryResponse> {
        Ok(self.lock().manager().handle_query(&query))
    }

    async fn datanode(&self, node: &NodeId, request: DataNodeRequest) -> Result<DataNodeResponse> {
        let mut cluster = self.lock();
        if !cluster.is_running(node) {
            return Err(anyhow!("node {node} is not running"));
        }
        let now = cluster.now();
        let (response, outgoing) = cluster
            .data_node(node)
            .map(|data_node| data_node.handle_request(request, now))
            .ok_or_else(|| anyhow!("unknown node {node}"))?;
        cluster.deliver(outgoing);
        cluster.pump();
        Ok(response)
    }

    async fn report_corrupt(&self, report: ReportCorruptMessage) -> Result<()> {
        self.lock().report_corrupt(&report);
        Ok(())
    }
}
