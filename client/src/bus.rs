//! Client transport over the Caryatid message bus

use anyhow::Result;
use caryatid_sdk::Context;
use palisade_common::{
    commands::{
        datanode::{DataNodeRequest, DataNodeResponse},
        namespace::{NamespaceCommand, NamespaceCommandResponse},
        node_topic, DEFAULT_DATANODE_REQUEST_TOPIC, DEFAULT_NAMESPACE_TOPIC,
    },
    messages::{Message, ReportCorruptMessage, StateQuery, StateQueryResponse, DEFAULT_CORRUPT_REPLICA_TOPIC},
    queries::{
        blocks::{BlocksStateQuery, BlocksStateQueryResponse, DEFAULT_BLOCKS_QUERY_TOPIC},
        get_query_topic,
        utils::query_state,
    },
    NodeId,
};
use std::sync::Arc;

use crate::transport::ClusterTransport;

#[derive(Debug, Clone)]
pub struct ClientTopics {
    pub namespace: String,
    pub blocks_query: String,
    pub datanode_request: String,
    pub corrupt_replica: String,
}

impl ClientTopics {
    pub fn from_context(context: &Arc<Context<Message>>) -> Self {
        Self {
            namespace: get_query_topic(context.clone(), DEFAULT_NAMESPACE_TOPIC),
            blocks_query: get_query_topic(context.clone(), DEFAULT_BLOCKS_QUERY_TOPIC),
            datanode_request: get_query_topic(context.clone(), DEFAULT_DATANODE_REQUEST_TOPIC),
            corrupt_replica: get_query_topic(context.clone(), DEFAULT_CORRUPT_REPLICA_TOPIC),
        }
    }
}

pub struct BusTransport {
    context: Arc<Context<Message>>,
    topics: ClientTopics,
}

impl BusTransport {
    pub fn new(context: Arc<Context<Message>>) -> Self {
        let topics = ClientTopics::from_context(&context);
        Self { context, topics }
    }

    pub fn with_topics(context: Arc<Context<Message>>, topics: ClientTopics) -> Self {
        Self { context, topics }
    }
}

impl ClusterTransport for BusTransport {
    async fn namespace(&self, command: NamespaceCommand) -> Result<NamespaceCommandResponse> {
        let msg = Arc::new(Message::Namespace(command));
        query_state(&self.context, &self.topics.namespace, msg, |message| match message {
            Message::NamespaceResponse(response) => Some(Ok(response)),
            _ => None,
        })
        .await
    }

    async fn query_blocks(&self, query: BlocksStateQuery) -> Result<BlocksStateQueryResponse> {
        let msg = Arc::new(Message::StateQuery(StateQuery::Blocks(query)));
        query_state(&self.context, &self.topics.blocks_query, msg, |message| match message {
            Message::StateQueryResponse(StateQueryResponse::Blocks(response)) => {
                Some(Ok(response))
            }
            _ => None,
        })
        .await
    }

    async fn datanode(&self, node: &NodeId, request: DataNodeRequest) -> Result<DataNodeResponse> {
        let topic = node_topic(&self.topics.datanode_request, node);
        let msg = Arc::new(Message::DataNodeRequest(request));
        query_state(&self.context, &topic, msg, |message| match message {
            Message::DataNodeResponse(response) => Some(Ok(response)),
            _ => None,
        })
        .await
    }

    async fn report_corrupt(&self, report: ReportCorruptMessage) -> Result<()> {
        let msg = Arc::new(Message::ReportCorrupt(report));
        self.context.message_bus.publish(&self.topics.corrupt_replica, msg).await
    }
}
