use std::future::Future;

use anyhow::Result;
use palisade_common::{
    commands::{
        datanode::{DataNodeRequest, DataNodeResponse},
        namespace::{NamespaceCommand, NamespaceCommandResponse},
    },
    messages::ReportCorruptMessage,
    queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse},
    NodeId,
};

/// The calls a client makes into the cluster
pub trait ClusterTransport: Send + Sync + 'static {
    fn namespace(
        &self,
        command: NamespaceCommand,
    ) -> impl Future<Output = Result<NamespaceCommandResponse>> + Send;

    fn query_blocks(
        &self,
        query: BlocksStateQuery,
    ) -> impl Future<Output = Result<BlocksStateQueryResponse>> + Send;

    fn datanode(
        &self,
        node: &NodeId,
        request: DataNodeRequest,
    ) -> impl Future<Output = Result<DataNodeResponse>> + Send;

    /// Fire-and-forget corrupt replica report
    fn report_corrupt(&self, report: ReportCorruptMessage) -> impl Future<Output = Result<()>> + Send;
}
