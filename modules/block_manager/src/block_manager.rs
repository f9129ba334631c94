//! Palisade block manager module for Caryatid
//! Tracks every block and its replicas, records corrupt replicas reported by
//! storage nodes and clients, and schedules re-replication and invalidation

use anyhow::Result;
use caryatid_sdk::{message_bus::Subscription, module, Context};
use config::Config;
use palisade_common::{
    commands::{namespace::NamespaceCommandResponse, node_topic},
    messages::{Message, StateQuery, StateQueryResponse},
    queries::blocks::BlocksStateQueryResponse,
    time::now_millis,
};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

pub mod catalog;
pub mod configuration;
pub mod corrupt_replicas;
pub mod datanodes;
pub mod namespace;
pub mod placement;
pub mod replication;
pub mod state;

use catalog::CorruptOutcome;
use configuration::BlockManagerConfig;
use state::{NodeCommand, State};

/// Block manager module
#[module(
    message_type(Message),
    name = "block-manager",
    description = "Block catalog, corrupt replica tracking and re-replication"
)]
pub struct BlockManager;

impl BlockManager {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = BlockManagerConfig::try_load(&config)?;
        info!(
            replication = cfg.default_replication,
            tick_ms = cfg.replication_tick_interval_ms,
            "Block manager starting"
        );

        let state = Arc::new(RwLock::new(State::new(&cfg)));
        let wake = Arc::new(Notify::new());

        // Namespace operations from clients
        let namespace_topic = cfg.namespace_topic.clone();
        info!("Creating namespace handler on '{namespace_topic}'");
        let namespace_state = state.clone();
        let namespace_context = context.clone();
        let namespace_commands = cfg.datanode_commands_topic.clone();
        context.handle(&namespace_topic, move |message| {
            let state = namespace_state.clone();
            let context = namespace_context.clone();
            let commands_topic = namespace_commands.clone();
            async move {
                let Message::Namespace(command) = message.as_ref() else {
                    return Arc::new(Message::NamespaceResponse(NamespaceCommandResponse::Error(
                        "Invalid message for block-manager".into(),
                    )));
                };
                let (response, commands) =
                    state.write().await.handle_namespace(command.clone(), now_millis());
                Self::publish_commands(&context, &commands_topic, commands).await;
                Arc::new(Message::NamespaceResponse(response))
            }
        });

        // Block location and health queries
        let query_topic = cfg.blocks_query_topic.clone();
        info!("Creating query handler on '{query_topic}'");
        let query_state = state.clone();
        context.handle(&query_topic, move |message| {
            let state = query_state.clone();
            async move {
                let Message::StateQuery(StateQuery::Blocks(query)) = message.as_ref() else {
                    return Arc::new(Message::StateQueryResponse(StateQueryResponse::Blocks(
                        BlocksStateQueryResponse::Error("Invalid message for block-manager".into()),
                    )));
                };
                let response = state.read().await.handle_query(query);
                Arc::new(Message::StateQueryResponse(StateQueryResponse::Blocks(response)))
            }
        });

        info!("Creating subscriber on '{}'", cfg.datanode_events_topic);
        let events = context.subscribe(&cfg.datanode_events_topic).await?;
        info!("Creating subscriber on '{}'", cfg.corrupt_replica_topic);
        let corrupt = context.subscribe(&cfg.corrupt_replica_topic).await?;

        let run_context = context.clone();
        context.run(async move {
            Self::run(run_context, cfg, state, wake, events, corrupt).await;
        });

        Ok(())
    }

    /// Main loop: apply node events and corruption reports as they arrive,
    /// and tick the scheduler on a timer or as soon as a new corrupt replica
    /// is recorded
    async fn run(
        context: Arc<Context<Message>>,
        cfg: BlockManagerConfig,
        state: Arc<RwLock<State>>,
        wake: Arc<Notify>,
        mut events: Box<dyn Subscription<Message>>,
        mut corrupt: Box<dyn Subscription<Message>>,
    ) {
        let mut interval = tokio::time::interval(cfg.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let commands = tokio::select! {
                result = events.read() => {
                    let Ok((_, message)) = result else {
                        error!("Data node event subscription closed");
                        return;
                    };
                    let Message::DataNode(event) = message.as_ref() else {
                        continue;
                    };
                    state.write().await.handle_datanode_message(event, now_millis())
                }

                result = corrupt.read() => {
                    let Ok((_, message)) = result else {
                        error!("Corrupt replica subscription closed");
                        return;
                    };
                    let Message::ReportCorrupt(report) = message.as_ref() else {
                        continue;
                    };
                    let outcome = state.write().await.report_corrupt(report, now_millis());
                    if let CorruptOutcome::Recorded(_) = outcome {
                        wake.notify_one();
                    }
                    Vec::new()
                }

                _ = interval.tick() => Self::tick(&state).await,

                _ = wake.notified() => Self::tick(&state).await,
            };

            Self::publish_commands(&context, &cfg.datanode_commands_topic, commands).await;
        }
    }

    async fn tick(state: &RwLock<State>) -> Vec<NodeCommand> {
        let span = info_span!("block_manager.tick");
        async {
            let commands = state.write().await.tick(now_millis());
            if !commands.is_empty() {
                debug!(commands = commands.len(), "Scheduler issued commands");
            }
            commands
        }
        .instrument(span)
        .await
    }

    async fn publish_commands(
        context: &Arc<Context<Message>>,
        base_topic: &str,
        commands: Vec<NodeCommand>,
    ) {
        for NodeCommand { node, command } in commands {
            let topic = node_topic(base_topic, &node);
            context
                .message_bus
                .publish(&topic, Arc::new(Message::DataNodeCommand(command)))
                .await
                .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
        }
    }
}
