use anyhow::{bail, Result};
use config::Config;
use palisade_common::NodeId;
use serde::Deserialize;
use std::time::Duration;

use crate::block_verifier::VerifierConfig;

/// Data node module configuration (from TOML).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataNodeConfig {
    pub node_id: String,
    pub rack: String,
    pub capacity_bytes: u64,
    pub store: StoreType,
    pub data_dir: String,
    pub bytes_per_checksum: u32,
    pub scan_period_secs: u64,
    /// Zero disables the verifier's I/O cap
    pub throttle_bytes_per_second: u64,
    pub max_io_retries: u32,
    pub heartbeat_interval_secs: u64,
    pub block_report_interval_secs: u64,
    pub report_retry_attempts: u32,
    pub report_retry_backoff_ms: u64,
    pub datanode_events_topic: String,
    pub corrupt_replica_topic: String,
    pub datanode_commands_topic: String,
    pub datanode_request_topic: String,
    pub verifier_query_topic: String,
    pub clock_tick_subscribe_topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Memory,
    Disk,
}

impl DataNodeConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        let loaded: Self = full.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node-id must not be empty");
        }
        if self.scan_period_secs == 0 {
            bail!("scan-period-secs must be positive");
        }
        if self.heartbeat_interval_secs == 0 || self.block_report_interval_secs == 0 {
            bail!("heartbeat and block report intervals must be positive");
        }
        Ok(())
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn verifier(&self) -> VerifierConfig {
        VerifierConfig {
            scan_period: Duration::from_secs(self.scan_period_secs),
            throttle_bytes_per_second: match self.throttle_bytes_per_second {
                0 => None,
                rate => Some(rate),
            },
            max_io_retries: self.max_io_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_overrides() {
        let config = DataNodeConfig::try_load(&Config::default()).unwrap();
        assert_eq!(config.node(), NodeId::from("dn-1"));
        assert_eq!(config.store, StoreType::Disk);
        assert_eq!(config.bytes_per_checksum, 512);
        assert_eq!(config.verifier().scan_period, Duration::from_secs(1_814_400));
        assert_eq!(config.verifier().throttle_bytes_per_second, Some(1_048_576));
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = Config::builder()
            .set_override("node-id", "dn-7")
            .unwrap()
            .set_override("store", "memory")
            .unwrap()
            .set_override("throttle-bytes-per-second", 0)
            .unwrap()
            .build()
            .unwrap();
        let config = DataNodeConfig::try_load(&overrides).unwrap();
        assert_eq!(config.node_id, "dn-7");
        assert_eq!(config.store, StoreType::Memory);
        assert_eq!(config.verifier().throttle_bytes_per_second, None);
    }

    #[test]
    fn zero_scan_period_is_rejected() {
        let overrides =
            Config::builder().set_override("scan-period-secs", 0).unwrap().build().unwrap();
        assert!(DataNodeConfig::try_load(&overrides).is_err());
    }
}
