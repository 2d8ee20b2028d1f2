//! Process entry point.
//!
//! Loads configuration, wires every component (C1-C9) together, and runs
//! the indexing pipeline, reorg watcher, and background counter concurrently
//! until a ctrl-c/SIGTERM asks them to stop at the next safe point. No HTTP
//! server is started here; query access and metrics scraping are library
//! concerns left to the embedding application.

mod address;
mod archive;
mod cache;
mod config;
mod constants;
mod counters;
mod errors;
mod mempool;
mod metadata;
mod memory;
mod metrics;
mod normalizer;
mod pipeline;
mod reorg;
mod rpc;
mod shard_store;
mod telemetry;
mod types;
mod warmup;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use config::Config;
use errors::IndexerError;
use mempool::LoggingMempoolBridge;
use memory::MemoryWatchdog;
use normalizer::BitcoinFamilyNormalizer;
use pipeline::IndexingPipeline;
use reorg::ReorgResolver;
use rpc::{JsonRpcClient, NodeRpcClient};
use shard_store::ShardedStore;
use warmup::WarmupLoader;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::load()?);

    telemetry::init_tracing(telemetry::TelemetryConfig::from(&config.telemetry))?;
    metrics::init_metrics()?;

    tracing::info!(chain = %config.chain, data_dir = %config.data_dir.display(), "starting indexer");

    let chain_dir = config.chain_dir();
    let utxo_store = Arc::new(ShardedStore::open(&chain_dir.join("utxo"), config.shard_count)?);
    let address_store = Arc::new(ShardedStore::open(&chain_dir.join("income"), config.shard_count)?);
    let spend_store = Arc::new(ShardedStore::open(&chain_dir.join("spend"), config.shard_count)?);
    let archive = Arc::new(archive::ArchiveWriter::open(&chain_dir.join("archive"))?);
    let metadata = Arc::new(metadata::MetadataStore::open(&chain_dir.join("meta"))?);
    let cache = Arc::new(cache::UtxoCache::new(config.cache_max_entries));

    metrics::load_gauges_from_metadata(&metadata).await?;

    let rpc: Arc<dyn NodeRpcClient> = Arc::new(JsonRpcClient::new(&config.rpc)?);
    let normalizer = Arc::new(BitcoinFamilyNormalizer::new(
        rpc.clone(),
        config.chain_params(),
        config.batch_size,
    ));
    let mempool = Arc::new(LoggingMempoolBridge);
    let checkpoint_lock = Arc::new(tokio::sync::Mutex::new(()));

    if let Some(last_indexed) = metadata.last_indexed_height().await? {
        let warmup = WarmupLoader::new(normalizer.clone(), cache.clone());
        if let Err(e) = warmup.warm(last_indexed, config.warmup_depth).await {
            tracing::warn!(error = %e, "cache warmup failed, continuing with a cold cache");
        }
    }

    let pipeline = Arc::new(IndexingPipeline::new(
        config.clone(),
        normalizer,
        utxo_store.clone(),
        address_store.clone(),
        spend_store.clone(),
        cache.clone(),
        archive.clone(),
        metadata.clone(),
        mempool,
        checkpoint_lock.clone(),
    ));

    let reorg_resolver = Arc::new(ReorgResolver::new(
        config.clone(),
        rpc.clone(),
        utxo_store.clone(),
        address_store.clone(),
        spend_store.clone(),
        cache.clone(),
        archive.clone(),
        metadata.clone(),
        checkpoint_lock.clone(),
    ));

    let counter = Arc::new(counters::BackgroundCounter::new(
        address_store.clone(),
        utxo_store.clone(),
        metadata.clone(),
        Duration::from_secs(config.counter_sweep_secs),
    ));

    let memory_watchdog = Arc::new(MemoryWatchdog::new(
        config.clone(),
        utxo_store.clone(),
        address_store.clone(),
        spend_store.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_shutdown_handler(stop_tx.clone());

    let pipeline_task = {
        let pipeline = pipeline.clone();
        let rpc = rpc.clone();
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { pipeline.run(rpc, stop_rx).await })
    };

    let reorg_task = {
        let stop_rx = stop_rx.clone();
        let reorg_config = config.clone();
        tokio::spawn(async move { run_reorg_watch(reorg_resolver, reorg_config, stop_rx).await })
    };

    let counter_task = {
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { counter.run(stop_rx).await })
    };

    let memory_task = {
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { memory_watchdog.run(stop_rx).await })
    };

    let pipeline_result = pipeline_task.await.map_err(|e| IndexerError::transient("pipeline task join", e))?;
    let _ = reorg_task.await;
    let _ = counter_task.await;
    let _ = memory_task.await;

    match pipeline_result {
        Ok(()) | Err(IndexerError::Cancelled) => {
            tracing::info!("indexer shut down cleanly");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "indexer stopped on a fatal error");
            Err(Box::new(e))
        }
    }
}

/// Periodically checks for a chain reorganization and rolls one back when
/// found. Runs at `config.reorg_poll_secs` cadence alongside the pipeline.
async fn run_reorg_watch(resolver: Arc<ReorgResolver>, config: Arc<Config>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.reorg_poll_secs)) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
                continue;
            }
        }

        if *stop.borrow() {
            return;
        }

        match resolver.detect().await {
            Ok(Some(info)) => {
                tracing::warn!(fork_height = info.fork_height, orphaned_to = info.orphaned_to, "reorg detected, rolling back");
                if let Err(e) = resolver.rollback(&info).await {
                    tracing::error!(error = %e, "reorg rollback failed");
                    if e.is_fatal() {
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "reorg detection failed, retrying next tick"),
        }
    }
}

/// Flips the stop signal on ctrl-c so every loop stops at its next safe point.
fn spawn_shutdown_handler(stop_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });
}
