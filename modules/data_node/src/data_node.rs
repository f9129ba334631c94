//! Palisade data node module for Caryatid
//! Holds replicas, verifies them in the background, and reports its inventory
//! and any corruption it finds to the block manager

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use palisade_common::{
    commands::{datanode::DataNodeResponse, node_topic},
    messages::{DataNodeMessage, Message, StateQuery, StateQueryResponse},
    queries::verifier::VerifierStateQueryResponse,
    time::now_millis,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, Instrument};

pub mod block_verifier;
mod configuration;
pub mod node;
mod outbox;
pub mod stores;
mod throttle;

use block_verifier::{NextScan, ScanOutcome};
use configuration::{DataNodeConfig, StoreType};
use node::{DataNode, Outgoing};
use outbox::{ReportOutbox, RetryPolicy};
use stores::{disk::DiskReplicaStore, memory::MemoryReplicaStore, ReplicaStore};

/// Data node module
#[module(
    message_type(Message),
    name = "data-node",
    description = "Replica storage with background block verification"
)]
pub struct DataNodeModule;

/// Where a node's outgoing messages go
#[derive(Clone)]
struct Routes {
    events: String,
    corrupt: String,
    commands: String,
}

impl Routes {
    fn dispatch(&self, outbox: &ReportOutbox, outgoing: Vec<Outgoing>) {
        for item in outgoing {
            match item {
                Outgoing::Event(event) => outbox.send(&self.events, Message::DataNode(event)),
                Outgoing::Corrupt(report) => {
                    outbox.send(&self.corrupt, Message::ReportCorrupt(report))
                }
                Outgoing::Command { node, command } => outbox.send(
                    &node_topic(&self.commands, &node),
                    Message::DataNodeCommand(command),
                ),
            }
        }
    }
}

impl DataNodeModule {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = DataNodeConfig::try_load(&config)?;
        let node_id = cfg.node();

        let store: Arc<dyn ReplicaStore> = match cfg.store {
            StoreType::Memory => Arc::new(MemoryReplicaStore::new()),
            StoreType::Disk => Arc::new(DiskReplicaStore::open(&cfg.data_dir)?),
        };
        info!(node = %node_id, store = ?cfg.store, replicas = store.list().len(), "Opened replica store");

        let node = Arc::new(DataNode::new(
            node_id.clone(),
            cfg.rack.clone(),
            cfg.capacity_bytes,
            cfg.bytes_per_checksum,
            store,
            cfg.verifier(),
        ));

        let routes = Routes {
            events: cfg.datanode_events_topic.clone(),
            corrupt: cfg.corrupt_replica_topic.clone(),
            commands: cfg.datanode_commands_topic.clone(),
        };

        // Outbox publisher
        let (outbox, receiver) = ReportOutbox::new();
        let policy = RetryPolicy {
            attempts: cfg.report_retry_attempts,
            backoff: Duration::from_millis(cfg.report_retry_backoff_ms),
        };
        let publish_context = context.clone();
        context.run(async move {
            ReportOutbox::run(receiver, policy, move |envelope| {
                let context = publish_context.clone();
                async move { context.message_bus.publish(&envelope.topic, envelope.message).await }
            })
            .await;
        });

        // Requests from clients
        let request_topic = node_topic(&cfg.datanode_request_topic, &node_id);
        info!("Creating request handler on '{request_topic}'");
        let request_node = node.clone();
        let request_outbox = outbox.clone();
        let request_routes = routes.clone();
        context.handle(&request_topic, move |message| {
            let node = request_node.clone();
            let outbox = request_outbox.clone();
            let routes = request_routes.clone();
            async move {
                let Message::DataNodeRequest(request) = message.as_ref() else {
                    return Arc::new(Message::DataNodeResponse(DataNodeResponse::Error(
                        "Invalid message for data-node".into(),
                    )));
                };
                let request = request.clone();
                let handled =
                    tokio::task::spawn_blocking(move || node.handle_request(request, now_millis()))
                        .await;
                let response = match handled {
                    Ok((response, outgoing)) => {
                        routes.dispatch(&outbox, outgoing);
                        response
                    }
                    Err(e) => {
                        error!("Request handler failed: {e}");
                        DataNodeResponse::Error(format!("Request handler failed: {e}"))
                    }
                };
                Arc::new(Message::DataNodeResponse(response))
            }
        });

        // Verifier status queries
        let query_topic = node_topic(&cfg.verifier_query_topic, &node_id);
        info!("Creating verifier query handler on '{query_topic}'");
        let query_node = node.clone();
        context.handle(&query_topic, move |message| {
            let node = query_node.clone();
            async move {
                let Message::StateQuery(StateQuery::Verifier(query)) = message.as_ref() else {
                    return Arc::new(Message::StateQueryResponse(StateQueryResponse::Verifier(
                        VerifierStateQueryResponse::Error("Invalid message for data-node".into()),
                    )));
                };
                let query = query.clone();
                let response = tokio::task::spawn_blocking(move || {
                    node.handle_verifier_query(&query, now_millis())
                })
                .await
                .unwrap_or_else(|e| {
                    error!("Verifier query failed: {e}");
                    VerifierStateQueryResponse::Error(format!("Verifier query failed: {e}"))
                });
                Arc::new(Message::StateQueryResponse(StateQueryResponse::Verifier(response)))
            }
        });

        // Commands from the block manager and peers
        let commands_topic = node_topic(&cfg.datanode_commands_topic, &node_id);
        info!("Creating subscriber on '{commands_topic}'");
        let mut commands_subscription = context.subscribe(&commands_topic).await?;
        let command_node = node.clone();
        let command_outbox = outbox.clone();
        let command_routes = routes.clone();
        context.run(async move {
            loop {
                let Ok((_, message)) = commands_subscription.read().await else {
                    error!("Command subscription closed");
                    return;
                };
                let Message::DataNodeCommand(command) = message.as_ref() else {
                    continue;
                };
                let node = command_node.clone();
                let command = command.clone();
                let span = info_span!("data_node.command", node = %node.id());
                let outgoing = async move {
                    tokio::task::spawn_blocking(move || node.handle_command(command, now_millis()))
                        .await
                }
                .instrument(span)
                .await;
                match outgoing {
                    Ok(outgoing) => command_routes.dispatch(&command_outbox, outgoing),
                    Err(e) => error!("Command handler failed: {e}"),
                }
            }
        });

        // Heartbeats and block reports on the clock
        let clock_topic = cfg.clock_tick_subscribe_topic.clone();
        info!("Creating subscriber on '{clock_topic}'");
        let mut clock_subscription = context.subscribe(&clock_topic).await?;
        let tick_node = node.clone();
        let tick_outbox = outbox.clone();
        let tick_routes = routes.clone();
        let heartbeat_every = cfg.heartbeat_interval_secs;
        let report_every = cfg.block_report_interval_secs;
        context.run(async move {
            // Register with a heartbeat and a full report before anything else
            tick_routes.dispatch(
                &tick_outbox,
                vec![
                    Outgoing::Event(DataNodeMessage::Heartbeat(tick_node.heartbeat())),
                    Outgoing::Event(DataNodeMessage::BlockReport(tick_node.block_report())),
                ],
            );
            loop {
                let Ok((_, message)) = clock_subscription.read().await else {
                    error!("Clock tick subscription closed");
                    return;
                };
                let Message::Clock(tick) = message.as_ref() else {
                    continue;
                };
                let mut outgoing = Vec::new();
                if tick.number.is_multiple_of(heartbeat_every) {
                    outgoing.push(Outgoing::Event(DataNodeMessage::Heartbeat(tick_node.heartbeat())));
                }
                if tick.number > 0 && tick.number.is_multiple_of(report_every) {
                    let report = tick_node.block_report();
                    info!(node = %tick_node.id(), replicas = report.replicas.len(), "Sending block report");
                    outgoing.push(Outgoing::Event(DataNodeMessage::BlockReport(report)));
                }
                tick_routes.dispatch(&tick_outbox, outgoing);
            }
        });

        // Background verifier
        let verifier_node = node.clone();
        let verifier_outbox = outbox;
        context.run(async move {
            Self::run_verifier(verifier_node, verifier_outbox, routes).await;
        });

        Ok(())
    }

    /// Scan replicas forever, one at a time, paced by the verifier. The
    /// store is listed once per pass and after idling. The verifier lock is
    /// not held during store I/O.
    async fn run_verifier(node: Arc<DataNode>, outbox: ReportOutbox, routes: Routes) {
        let mut refresh = true;
        loop {
            if refresh {
                let store = node.store().clone();
                match tokio::task::spawn_blocking(move || store.list()).await {
                    Ok(replicas) => node.verifier().refresh(&replicas),
                    Err(e) => error!("Replica listing failed: {e}"),
                }
            }

            let next = node.verifier().next_scan(now_millis());
            let block = match next {
                NextScan::Idle(wait) => {
                    refresh = true;
                    tokio::time::sleep(wait).await;
                    continue;
                }
                NextScan::Scan(block) => block,
            };

            let started = Instant::now();
            let store = node.store().clone();
            let result = match tokio::task::spawn_blocking(move || store.verify(&block)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(%block, "Verifier task failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let bytes = *result.as_ref().unwrap_or(&0);
            let (outcome, delay) = {
                let mut verifier = node.verifier();
                let outcome = verifier.record(block, result, now_millis());
                refresh = verifier.pass_complete();
                (outcome, verifier.scan_delay(bytes, Instant::now()))
            };

            if let ScanOutcome::Corrupt { .. } = outcome {
                let reports = node.scan_outcome(&outcome).map(Outgoing::Corrupt);
                routes.dispatch(&outbox, reports.into_iter().collect());
            }

            tokio::time::sleep(delay.saturating_sub(started.elapsed())).await;
        }
    }
}
