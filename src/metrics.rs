//! Telemetry (C12) — Prometheus metrics.
//!
//! Counters for blocks/transactions/UTXOs processed, gauges for indexed
//! height and store sizes, and histograms for per-phase latency, the way a
//! production indexer surfaces its own pipeline health.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

const PHASE_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // --- Pipeline progress & throughput ---

    pub static ref BLOCKS_INDEXED: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_blocks_indexed_total", "Total blocks fully indexed")
    ).unwrap();

    pub static ref TRANSACTIONS_INDEXED: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_transactions_indexed_total", "Total transactions processed by the income phase")
    ).unwrap();

    pub static ref LAST_INDEXED_HEIGHT: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_last_indexed_height", "Highest block height whose effects are fully applied")
    ).unwrap();

    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_chain_tip_height", "Best height reported by the node")
    ).unwrap();

    // --- Latency histograms ---

    pub static ref INCOME_PHASE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("utxoshard_income_phase_duration_seconds", "Income phase latency per block")
            .buckets(PHASE_LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref SPEND_PHASE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("utxoshard_spend_phase_duration_seconds", "Spend phase latency per block")
            .buckets(PHASE_LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // --- Error & reorg counters ---

    pub static ref STORAGE_ERRORS: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_storage_errors_total", "Storage I/O errors across all shards")
    ).unwrap();

    pub static ref RPC_ERRORS: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_rpc_errors_total", "Node RPC call failures")
    ).unwrap();

    pub static ref REORGS_HANDLED: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_reorgs_handled_total", "Chain reorganizations successfully rolled back")
    ).unwrap();

    // --- Cache metrics ---

    pub static ref SPEND_CACHE_HITS: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_spend_cache_hits_total", "Spend-phase lookups resolved from the in-memory cache")
    ).unwrap();

    pub static ref SPEND_CACHE_MISSES: IntCounter = IntCounter::with_opts(
        Opts::new("utxoshard_spend_cache_misses_total", "Spend-phase cache misses that fell back to the UTXO-store")
    ).unwrap();

    pub static ref CACHE_SIZE_ENTRIES: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_cache_size_entries", "Current entry count of the in-memory UTXO cache")
    ).unwrap();

    // --- Store/process metrics ---

    pub static ref TOTAL_ADDRESSES_INDEXED: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_total_addresses_indexed", "Total unique addresses with an income record")
    ).unwrap();

    pub static ref TOTAL_UTXOS_TRACKED: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_total_utxos_tracked", "Total UTXO-store entries, spent and unspent")
    ).unwrap();

    pub static ref PROCESS_RESIDENT_MEMORY_BYTES: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_process_resident_memory_bytes", "Process resident memory in bytes")
    ).unwrap();

    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_uptime_seconds", "Service uptime in seconds")
    ).unwrap();

    static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::with_opts(
        Opts::new("utxoshard_service_start_timestamp_seconds", "Unix timestamp when the service started")
    ).unwrap();
}

/// Registers every metric with the global registry and stamps the start
/// timestamp. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(LAST_INDEXED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(INCOME_PHASE_DURATION.clone()))?;
    REGISTRY.register(Box::new(SPEND_PHASE_DURATION.clone()))?;
    REGISTRY.register(Box::new(STORAGE_ERRORS.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
    REGISTRY.register(Box::new(REORGS_HANDLED.clone()))?;
    REGISTRY.register(Box::new(SPEND_CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(SPEND_CACHE_MISSES.clone()))?;
    REGISTRY.register(Box::new(CACHE_SIZE_ENTRIES.clone()))?;
    REGISTRY.register(Box::new(TOTAL_ADDRESSES_INDEXED.clone()))?;
    REGISTRY.register(Box::new(TOTAL_UTXOS_TRACKED.clone()))?;
    REGISTRY.register(Box::new(PROCESS_RESIDENT_MEMORY_BYTES.clone()))?;
    REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_blocks_indexed() {
    BLOCKS_INDEXED.inc();
}

pub fn increment_transactions_indexed(count: u64) {
    TRANSACTIONS_INDEXED.inc_by(count);
}

pub fn set_last_indexed_height(height: u64) {
    LAST_INDEXED_HEIGHT.set(height as i64);
}

pub fn set_chain_tip_height(height: u64) {
    CHAIN_TIP_HEIGHT.set(height as i64);
}

pub fn observe_income_phase_seconds(duration_secs: f64) {
    INCOME_PHASE_DURATION.observe(duration_secs);
}

pub fn observe_spend_phase_seconds(duration_secs: f64) {
    SPEND_PHASE_DURATION.observe(duration_secs);
}

pub fn increment_storage_errors() {
    STORAGE_ERRORS.inc();
}

pub fn increment_rpc_errors() {
    RPC_ERRORS.inc();
}

pub fn increment_reorgs_handled() {
    REORGS_HANDLED.inc();
}

pub fn increment_spend_cache_hits(count: u64) {
    SPEND_CACHE_HITS.inc_by(count);
}

pub fn increment_spend_cache_misses(count: u64) {
    SPEND_CACHE_MISSES.inc_by(count);
}

pub fn set_cache_size_entries(entries: u64) {
    CACHE_SIZE_ENTRIES.set(entries as i64);
}

pub fn set_total_addresses_indexed(count: u64) {
    TOTAL_ADDRESSES_INDEXED.set(count as i64);
}

pub fn set_total_utxos_tracked(count: u64) {
    TOTAL_UTXOS_TRACKED.set(count as i64);
}

pub fn set_process_resident_memory_bytes(bytes: u64) {
    PROCESS_RESIDENT_MEMORY_BYTES.set(bytes as i64);
}

pub fn update_uptime() {
    let start = SERVICE_START_TIMESTAMP.get();
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
    UPTIME_SECONDS.set((now as i64 - start).max(0));
}

/// Restores the persisted aggregate gauges from the Metadata Store on
/// startup, so a restart doesn't show a momentary zero before the first
/// background counter sweep completes.
pub async fn load_gauges_from_metadata(metadata: &crate::metadata::MetadataStore) -> Result<(), crate::errors::IndexerError> {
    TOTAL_ADDRESSES_INDEXED.set(metadata.total_address_count().await? as i64);
    TOTAL_UTXOS_TRACKED.set(metadata.total_utxo_count().await? as i64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_includes_registered_names() {
        let _ = init_metrics();
        increment_blocks_indexed();
        set_last_indexed_height(12345);

        let output = gather_metrics();
        assert!(output.contains("utxoshard_blocks_indexed_total"));
        assert!(output.contains("utxoshard_last_indexed_height"));
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.005);
    }
}
