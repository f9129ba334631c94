//! Integration test: a client writes a file through the block manager and a
//! data node over the in-memory Caryatid bus, then reads it back.
#![cfg(test)]
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use caryatid_process::Process;
use caryatid_sdk::{module, Context};
use config::{Config, File, FileFormat};
use palisade_client::{BusTransport, ClusterTransport, PalisadeClient};
use palisade_common::{
    messages::Message,
    queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse},
    BlockHealth,
};
use palisade_module_block_manager::BlockManager;
use palisade_module_data_node::DataNodeModule;
use tokio::{sync::watch, time::timeout};
use tracing::info;

use caryatid_module_clock::Clock;

const TEST_CONFIG: &str = r##"
[module.block-manager]
default-replication = 1
replication-tick-interval-ms = 200

[module.data-node]
node-id = "dn-1"
rack = "/rack-1"
store = "memory"
bytes-per-checksum = 64
heartbeat-interval-secs = 1

[module.clock]

[module.test-client]

[message-bus.internal]
class = "in-memory"

[[message-router.route]]
pattern = "#"
bus = "internal"
"##;

const PATH: &str = "/bus/file";

// --------- shared test outcome signaling ---------
static TEST_OUTCOME_TX: Mutex<Option<watch::Sender<Option<Result<(), String>>>>> =
    Mutex::new(None);

fn signal_test_outcome(outcome: Result<(), String>) {
    if let Ok(tx) = TEST_OUTCOME_TX.lock() {
        if let Some(sender) = tx.as_ref() {
            let _ = sender.send(Some(outcome));
        }
    }
}

fn payload() -> Vec<u8> {
    (0..300u32).map(|i| (i % 251) as u8).collect()
}

/// Client module that drives one write and read once a node is live
#[module(
    message_type(Message),
    name = "test-client",
    description = "Writes and reads a file over the bus"
)]
struct TestClient;

impl TestClient {
    async fn init(&self, context: Arc<Context<Message>>, _config: Arc<Config>) -> Result<()> {
        context.clone().run(async move {
            let outcome = Self::round_trip(context).await.map_err(|e| e.to_string());
            signal_test_outcome(outcome);
        });
        Ok(())
    }

    async fn round_trip(context: Arc<Context<Message>>) -> Result<()> {
        let transport = BusTransport::new(context);

        // Wait for the data node's heartbeat to reach the block manager
        loop {
            let query = transport.query_blocks(BlocksStateQuery::GetClusterHealth);
            if let Ok(Ok(BlocksStateQueryResponse::ClusterHealth(health))) =
                timeout(Duration::from_millis(500), query).await
            {
                if health.live_nodes > 0 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let mut client = PalisadeClient::new(transport);
        let data = payload();
        let blocks = client.write_file(PATH, &data, 128, Some(1)).await?;
        info!(blocks = blocks.len(), "Wrote test file");

        let read = client.read_file(PATH).await?;
        if read != data {
            return Err(anyhow!("read back {} bytes that differ from what was written", read.len()));
        }

        // Replica reports travel separately from the write, so give them time
        let located = client.locate(PATH).await?;
        for block in &located.blocks {
            let mut healthy = false;
            for _ in 0..50 {
                let response = client
                    .transport()
                    .query_blocks(BlocksStateQuery::GetBlockHealth {
                        block_id: block.block.id,
                    })
                    .await?;
                if matches!(response, BlocksStateQueryResponse::BlockHealth(BlockHealth::Healthy)) {
                    healthy = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if !healthy {
                return Err(anyhow!("{} never became healthy", block.block));
            }
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_round_trip_over_caryatid() -> Result<()> {
    let config = Arc::new(
        Config::builder().add_source(File::from_str(TEST_CONFIG, FileFormat::Toml)).build()?,
    );

    let (outcome_tx, mut outcome_rx) = watch::channel(None);
    {
        let mut tx = TEST_OUTCOME_TX.lock().unwrap();
        *tx = Some(outcome_tx);
    }

    let mut process = Process::<Message>::create(config).await;

    BlockManager::register(&mut process);
    DataNodeModule::register(&mut process);
    Clock::<Message>::register(&mut process);
    TestClient::register(&mut process);

    let finished = timeout(Duration::from_secs(20), async {
        tokio::select! {
            result = process.run() => {
                result?;
                Err(anyhow!("process exited before the test finished"))
            }
            _ = outcome_rx.wait_for(|outcome| outcome.is_some()) => Ok(()),
        }
    })
    .await;

    match finished {
        Ok(result) => result?,
        Err(_) => panic!("Test timed out after 20 seconds"),
    }
    let outcome = outcome_rx.borrow().clone();
    assert_eq!(outcome, Some(Ok(())));
    Ok(())
}
