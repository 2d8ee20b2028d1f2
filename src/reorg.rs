//! Reorg Resolver (C6).
//!
//! Watches the node for chain reorganizations by comparing a small window of
//! recently indexed heights against what the node reports now. On
//! divergence it scans backward through the archive to find the fork point,
//! reverses every orphaned height's income/spend effects, and resumes the
//! pipeline from the fork.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::archive::ArchiveWriter;
use crate::cache::UtxoCache;
use crate::config::Config;
use crate::errors::IndexerError;
use crate::metadata::MetadataStore;
use crate::rpc::NodeRpcClient;
use crate::shard_store::ShardedStore;

/// Describes a detected reorg: the new chain diverges from the indexed one
/// starting at `fork_height + 1`.
#[derive(Debug, Clone)]
pub struct ReorgInfo {
    pub fork_height: u64,
    pub orphaned_from: u64,
    pub orphaned_to: u64,
}

pub struct ReorgResolver {
    config: Arc<Config>,
    rpc: Arc<dyn NodeRpcClient>,
    utxo_store: Arc<ShardedStore>,
    address_store: Arc<ShardedStore>,
    spend_store: Arc<ShardedStore>,
    cache: Arc<UtxoCache>,
    archive: Arc<ArchiveWriter>,
    metadata: Arc<MetadataStore>,
    /// Shared with [`crate::pipeline::IndexingPipeline`]: held for the
    /// duration of a rollback so it never interleaves with a forward
    /// block-apply that is mid-phase.
    checkpoint_lock: Arc<Mutex<()>>,
}

impl ReorgResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        rpc: Arc<dyn NodeRpcClient>,
        utxo_store: Arc<ShardedStore>,
        address_store: Arc<ShardedStore>,
        spend_store: Arc<ShardedStore>,
        cache: Arc<UtxoCache>,
        archive: Arc<ArchiveWriter>,
        metadata: Arc<MetadataStore>,
        checkpoint_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self { config, rpc, utxo_store, address_store, spend_store, cache, archive, metadata, checkpoint_lock }
    }

    /// One detection tick: compares the node's hashes for the
    /// window `[last - W, last]` against the archive's locally recorded
    /// hashes. Returns `None` when the chain agrees everywhere in the window.
    pub async fn detect(&self) -> Result<Option<ReorgInfo>, IndexerError> {
        let Some(last_indexed) = self.metadata.last_indexed_height().await? else { return Ok(None) };
        let window_floor = last_indexed.saturating_sub(self.config.reorg_window);

        let mut any_divergence = false;
        for height in (window_floor..=last_indexed).rev() {
            let Some(effects) = self.archive.get(height).await? else { continue };
            let node_hash = self.rpc.get_block_hash(height).await?;
            if node_hash.to_lowercase() != effects.block_hash.to_lowercase() {
                any_divergence = true;
                break;
            }
        }

        if !any_divergence {
            return Ok(None);
        }

        let fork_height = self.find_fork_point(window_floor).await?;
        Ok(Some(ReorgInfo { fork_height, orphaned_from: fork_height + 1, orphaned_to: last_indexed }))
    }

    /// Scans backward from `start` (bounded below by the archive's
    /// retention, not just the detection window) until a height whose
    /// archived hash agrees with the node. Returns that height.
    async fn find_fork_point(&self, start: u64) -> Result<u64, IndexerError> {
        let mut height = start;

        loop {
            let Some(effects) = self.archive.get(height).await? else {
                let retained_from = self.archive.retained_from().await?.unwrap_or(0);
                return Err(IndexerError::ReorgBeyondHorizon { requested_height: height, retained_from });
            };
            let node_hash = self.rpc.get_block_hash(height).await?;
            if node_hash.to_lowercase() == effects.block_hash.to_lowercase() {
                return Ok(height);
            }
            if height == 0 {
                let retained_from = self.archive.retained_from().await?.unwrap_or(0);
                return Err(IndexerError::ReorgBeyondHorizon { requested_height: 0, retained_from });
            }
            height -= 1;
        }
    }

    /// Reverses every orphaned height from `info.orphaned_to` down to
    /// `info.orphaned_from`, then rewinds the checkpoint to the fork height.
    pub async fn rollback(&self, info: &ReorgInfo) -> Result<(), IndexerError> {
        let _guard = self.checkpoint_lock.lock().await;
        tracing::warn!(
            fork_height = info.fork_height,
            orphaned_from = info.orphaned_from,
            orphaned_to = info.orphaned_to,
            "reorg detected, rolling back"
        );

        for height in (info.orphaned_from..=info.orphaned_to).rev() {
            let Some(effects) = self.archive.get(height).await? else {
                let retained_from = self.archive.retained_from().await?.unwrap_or(0);
                return Err(IndexerError::ReorgBeyondHorizon { requested_height: height, retained_from });
            };

            // Spends are resolved and removed first, while the UTXO-store
            // records they reference are still intact. A same-block
            // self-spend (this height's output consumed by this height's
            // spend) needs its UTXO-store fragment present to resolve the
            // spending address; reversing this would silently drop the
            // spend-store fragment instead.
            for spend in &effects.spends {
                let prefix = format!("{}@", spend.outpoint);
                if let Some(address) = self.resolve_spend_address(spend).await? {
                    self.spend_store
                        .rewrite_filtered(address, move |fragment| !fragment.starts_with(&prefix))
                        .await?;
                }
            }

            for output in &effects.outputs {
                // UTXO-store fragments don't carry their own output index
                // (order = index); an orphaned block's outputs are matched
                // for removal by address+amount content instead. Two outputs
                // of the same tx_id with identical address and amount would
                // collide here, but that is already the store's append
                // ordering limitation, not one this rollback introduces.
                let fragment_prefix = format!("{}@{}@", output.address, output.amount);
                self.utxo_store
                    .rewrite_filtered(output.outpoint.tx_id.clone(), move |fragment| {
                        !fragment.starts_with(&fragment_prefix)
                    })
                    .await?;

                self.address_store
                    .rewrite_filtered(output.address.clone(), {
                        let tx_id = output.outpoint.tx_id.clone();
                        let idx = output.outpoint.output_index;
                        move |fragment| !fragment.starts_with(&format!("{tx_id}@{idx}@"))
                    })
                    .await?;

                self.cache.remove(&output.outpoint.to_string());
            }

            tracing::info!(height, "rolled back orphaned height");
        }

        self.metadata.set_last_indexed_height(info.fork_height).await?;
        self.utxo_store.sync().await?;
        self.address_store.sync().await?;
        self.spend_store.sync().await?;
        self.metadata.sync().await?;

        crate::metrics::set_last_indexed_height(info.fork_height);
        crate::metrics::increment_reorgs_handled();

        Ok(())
    }

    async fn resolve_spend_address(&self, spend: &crate::archive::ArchivedSpend) -> Result<Option<String>, IndexerError> {
        let grouped = self
            .utxo_store
            .resolve_outpoint_addresses(vec![spend.outpoint.clone()], self.config.query_workers().max(1))
            .await?;
        Ok(grouped.into_iter().find_map(|(address, outpoints)| outpoints.contains(&spend.outpoint).then_some(address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outpoint;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixtureRpc {
        hashes: Mutex<HashMap<u64, String>>,
    }

    #[async_trait]
    impl NodeRpcClient for FixtureRpc {
        async fn get_block_count(&self) -> Result<u64, IndexerError> {
            Ok(self.hashes.lock().unwrap().keys().copied().max().unwrap_or(0))
        }

        async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError> {
            self.hashes
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .ok_or_else(|| IndexerError::corrupt("fixture_rpc", height.to_string(), "no hash"))
        }

        async fn get_block_raw(&self, _block_hash: &str) -> Result<Vec<u8>, IndexerError> {
            unimplemented!("reorg resolver never fetches raw blocks")
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            chain: "bitcoin".to_string(),
            data_dir: "/tmp".into(),
            rpc: crate::config::RpcConfig { url: String::new(), user: String::new(), password: String::new(), timeout_secs: 5, max_retries: 1 },
            telemetry: crate::config::TelemetrySettings {
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
                log_file: None,
                rotation: "daily".to_string(),
                metrics_port: 0,
            },
            shard_count: 2,
            batch_size: 10,
            workers: 2,
            sync_every_blocks: 1,
            cache_max_entries: 1000,
            reorg_window: 5,
            reorg_poll_secs: 1,
            archive_retention_margin: 10,
            warmup_depth: 10,
            memory_ceiling_bytes: 1024 * 1024 * 1024,
            counter_sweep_secs: 60,
        })
    }

    async fn seed_archive(archive: &ArchiveWriter, metadata: &MetadataStore, heights_and_hashes: &[(u64, &str)]) {
        for (height, hash) in heights_and_hashes {
            archive
                .record(
                    *height,
                    crate::archive::BlockEffects {
                        block_hash: hash.to_string(),
                        prev_block_hash: String::new(),
                        outputs: vec![crate::archive::ArchivedOutput {
                            outpoint: Outpoint::new(format!("tx{height}"), 0),
                            address: "addrA".to_string(),
                            amount: 100,
                        }],
                        spends: vec![],
                    },
                )
                .await
                .unwrap();
        }
        let last = heights_and_hashes.last().unwrap().0;
        metadata.set_last_indexed_height(last).await.unwrap();
    }

    #[tokio::test]
    async fn detect_returns_none_when_hashes_agree() {
        let dir = tempdir().unwrap();
        let archive = Arc::new(ArchiveWriter::open(&dir.path().join("archive")).unwrap());
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta")).unwrap());
        seed_archive(&archive, &metadata, &[(100, "bh100"), (101, "bh101")]).await;

        let mut hashes = HashMap::new();
        hashes.insert(100u64, "bh100".to_string());
        hashes.insert(101u64, "bh101".to_string());
        let rpc: Arc<dyn NodeRpcClient> = Arc::new(FixtureRpc { hashes: Mutex::new(hashes) });

        let utxo_store = Arc::new(ShardedStore::open(&dir.path().join("utxo"), 2).unwrap());
        let address_store = Arc::new(ShardedStore::open(&dir.path().join("income"), 2).unwrap());
        let spend_store = Arc::new(ShardedStore::open(&dir.path().join("spend"), 2).unwrap());
        let cache = Arc::new(UtxoCache::new(100));

        let resolver = ReorgResolver::new(test_config(), rpc, utxo_store, address_store, spend_store, cache, archive, metadata, Arc::new(Mutex::new(())));
        assert!(resolver.detect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detect_finds_divergence_and_fork_point() {
        let dir = tempdir().unwrap();
        let archive = Arc::new(ArchiveWriter::open(&dir.path().join("archive")).unwrap());
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta")).unwrap());
        seed_archive(&archive, &metadata, &[(98, "bh98"), (99, "bh99"), (100, "bh100")]).await;

        let mut hashes = HashMap::new();
        hashes.insert(98u64, "bh98".to_string());
        hashes.insert(99u64, "y99".to_string());
        hashes.insert(100u64, "y100".to_string());
        let rpc: Arc<dyn NodeRpcClient> = Arc::new(FixtureRpc { hashes: Mutex::new(hashes) });

        let utxo_store = Arc::new(ShardedStore::open(&dir.path().join("utxo"), 2).unwrap());
        let address_store = Arc::new(ShardedStore::open(&dir.path().join("income"), 2).unwrap());
        let spend_store = Arc::new(ShardedStore::open(&dir.path().join("spend"), 2).unwrap());
        let cache = Arc::new(UtxoCache::new(100));

        let mut config = test_config();
        Arc::get_mut(&mut config).unwrap().reorg_window = 2;

        let resolver = ReorgResolver::new(config, rpc, utxo_store, address_store, spend_store, cache, archive, metadata, Arc::new(Mutex::new(())));
        let info = resolver.detect().await.unwrap().unwrap();
        assert_eq!(info.fork_height, 98);
        assert_eq!(info.orphaned_from, 99);
        assert_eq!(info.orphaned_to, 100);
    }

    #[tokio::test]
    async fn rollback_reports_beyond_horizon_when_archive_exhausted() {
        let dir = tempdir().unwrap();
        let archive = Arc::new(ArchiveWriter::open(&dir.path().join("archive")).unwrap());
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta")).unwrap());
        // Only height 100 archived; a rollback reaching below that must fail.
        seed_archive(&archive, &metadata, &[(100, "bh100")]).await;

        let mut hashes = HashMap::new();
        hashes.insert(99u64, "y99".to_string());
        let rpc: Arc<dyn NodeRpcClient> = Arc::new(FixtureRpc { hashes: Mutex::new(hashes) });

        let utxo_store = Arc::new(ShardedStore::open(&dir.path().join("utxo"), 2).unwrap());
        let address_store = Arc::new(ShardedStore::open(&dir.path().join("income"), 2).unwrap());
        let spend_store = Arc::new(ShardedStore::open(&dir.path().join("spend"), 2).unwrap());
        let cache = Arc::new(UtxoCache::new(100));

        let resolver = ReorgResolver::new(test_config(), rpc, utxo_store, address_store, spend_store, cache, archive, metadata, Arc::new(Mutex::new(())));
        // orphaned_from=99 reaches below the archive's retained floor (100).
        let info = ReorgInfo { fork_height: 98, orphaned_from: 99, orphaned_to: 100 };
        let result = resolver.rollback(&info).await;
        assert!(matches!(result, Err(IndexerError::ReorgBeyondHorizon { .. })));
    }
}
