use anyhow::{bail, Result};
use config::Config;
use serde::Deserialize;
use std::time::Duration;

use crate::replication::SchedulerConfig;

/// Block manager module configuration (from TOML).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockManagerConfig {
    pub default_replication: u16,
    pub block_size: u64,
    pub replication_tick_interval_ms: u64,
    pub task_timeout_secs: u64,
    pub max_replication_streams: usize,
    pub consider_load_in_placement: bool,
    pub unschedulable_warn_ticks: u32,
    pub heartbeat_expiry_secs: u64,
    pub datanode_events_topic: String,
    pub corrupt_replica_topic: String,
    pub datanode_commands_topic: String,
    pub namespace_topic: String,
    pub blocks_query_topic: String,
}

impl BlockManagerConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        let loaded: Self = full.try_deserialize()?;
        if loaded.default_replication == 0 {
            bail!("default-replication must be positive");
        }
        if loaded.replication_tick_interval_ms == 0 {
            bail!("replication-tick-interval-ms must be positive");
        }
        if loaded.max_replication_streams == 0 {
            bail!("max-replication-streams must be positive");
        }
        Ok(loaded)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.replication_tick_interval_ms)
    }

    pub fn heartbeat_expiry_ms(&self) -> u64 {
        self.heartbeat_expiry_secs.saturating_mul(1000)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            task_timeout_ms: self.task_timeout_secs.saturating_mul(1000),
            max_replication_streams: self.max_replication_streams,
            unschedulable_warn_ticks: self.unschedulable_warn_ticks,
        }
    }
}
