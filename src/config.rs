//! Configuration layer (C10).
//!
//! Replaces the process-wide mutable singleton anti-pattern with an
//! explicit `Config` struct, built once at startup by layering a TOML file
//! over environment variables via the `config` crate, then threaded through
//! every component by `Arc<Config>`. Nothing downstream reaches for a global
//! to read a tunable.

use serde::Deserialize;
use std::path::PathBuf;

use crate::constants::*;
use crate::errors::IndexerError;

/// Base58 version bytes a chain uses for P2PKH/P2SH address rendering.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChainParams {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
}

impl ChainParams {
    pub const BITCOIN: ChainParams = ChainParams { p2pkh_version: 0x00, p2sh_version: 0x05 };
    pub const DOGECOIN: ChainParams = ChainParams { p2pkh_version: 0x1e, p2sh_version: 0x16 };
    /// MVC (Microvisionchain) inherited Bitcoin's mainnet version bytes.
    pub const MVC: ChainParams = ChainParams { p2pkh_version: 0x00, p2sh_version: 0x05 };

    pub fn for_chain(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "dogecoin" | "doge" => Self::DOGECOIN,
            "mvc" => Self::MVC,
            _ => Self::BITCOIN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_rpc_retries")]
    pub max_retries: u32,
}

fn default_rpc_timeout_secs() -> u64 { 30 }
fn default_rpc_retries() -> u32 { 5 }

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    pub log_file: Option<String>,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }
fn default_rotation() -> String { "daily".to_string() }
fn default_metrics_port() -> u16 { 9898 }

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: String,
    pub data_dir: PathBuf,
    pub rpc: RpcConfig,
    pub telemetry: TelemetrySettings,

    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_sync_every_blocks")]
    pub sync_every_blocks: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_reorg_window")]
    pub reorg_window: u64,
    #[serde(default = "default_reorg_poll_secs")]
    pub reorg_poll_secs: u64,
    #[serde(default = "default_archive_retention_margin")]
    pub archive_retention_margin: u64,
    #[serde(default = "default_warmup_depth")]
    pub warmup_depth: u64,
    #[serde(default = "default_memory_ceiling_bytes")]
    pub memory_ceiling_bytes: u64,
    #[serde(default = "default_counter_sweep_secs")]
    pub counter_sweep_secs: u64,
}

fn default_shard_count() -> usize { DEFAULT_SHARD_COUNT }
fn default_batch_size() -> usize { DEFAULT_BATCH_SIZE }
fn default_workers() -> usize { DEFAULT_WORKERS }
fn default_sync_every_blocks() -> u64 { DEFAULT_SYNC_EVERY_BLOCKS }
fn default_cache_max_entries() -> usize { DEFAULT_CACHE_MAX_ENTRIES }
fn default_reorg_window() -> u64 { DEFAULT_REORG_WINDOW }
fn default_reorg_poll_secs() -> u64 { DEFAULT_REORG_POLL_SECS }
fn default_archive_retention_margin() -> u64 { DEFAULT_ARCHIVE_RETENTION_MARGIN }
fn default_warmup_depth() -> u64 { DEFAULT_WARMUP_DEPTH }
fn default_memory_ceiling_bytes() -> u64 { DEFAULT_MEMORY_CEILING_BYTES }
fn default_counter_sweep_secs() -> u64 { DEFAULT_COUNTER_SWEEP_SECS }

impl Config {
    /// Layers `config.toml` (if present) with `INDEXER_*` environment overrides.
    pub fn load() -> Result<Self, IndexerError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("INDEXER").separator("__"));

        let raw = builder
            .build()
            .map_err(|e| IndexerError::InvariantViolation(format!("config load failed: {e}")))?;

        raw.try_deserialize()
            .map_err(|e| IndexerError::InvariantViolation(format!("config shape invalid: {e}")))
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::for_chain(&self.chain)
    }

    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(&self.chain)
    }

    pub fn query_workers(&self) -> usize {
        num_cpus() * QUERY_WORKER_CORES_MULTIPLIER
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_params_dispatch() {
        assert_eq!(ChainParams::for_chain("dogecoin").p2pkh_version, 0x1e);
        assert_eq!(ChainParams::for_chain("bitcoin").p2pkh_version, 0x00);
        assert_eq!(ChainParams::for_chain("mvc").p2sh_version, 0x05);
        assert_eq!(ChainParams::for_chain("unknown").p2pkh_version, ChainParams::BITCOIN.p2pkh_version);
    }
}
