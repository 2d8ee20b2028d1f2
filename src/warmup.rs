//! Warmup Loader (C9).
//!
//! On startup, replays the last `warmup_depth` blocks through the normalizer
//! into the in-memory cache only — no store writes, since those blocks are
//! already durably indexed. This gives the spend phase a warm cache for the
//! heights most likely to be spent from soon after restart.

use std::sync::Arc;

use crate::cache::UtxoCache;
use crate::errors::IndexerError;
use crate::normalizer::BlockNormalizer;
use crate::types::UNDECODABLE_ADDRESS;

pub struct WarmupLoader {
    normalizer: Arc<dyn BlockNormalizer>,
    cache: Arc<UtxoCache>,
}

impl WarmupLoader {
    pub fn new(normalizer: Arc<dyn BlockNormalizer>, cache: Arc<UtxoCache>) -> Self {
        Self { normalizer, cache }
    }

    /// Replays `[last_indexed_height.saturating_sub(depth), last_indexed_height]`
    /// into the cache. Errors from individual heights are logged and
    /// skipped — warmup is a best-effort optimization, not a correctness
    /// requirement, so a node hiccup during startup must not block indexing.
    pub async fn warm(&self, last_indexed_height: u64, depth: u64) -> Result<u64, IndexerError> {
        if !self.cache.is_enabled() || depth == 0 {
            return Ok(0);
        }

        let floor = last_indexed_height.saturating_sub(depth);
        let mut warmed = 0u64;

        for height in floor..=last_indexed_height {
            let sub_blocks = match self.normalizer.normalize(height).await {
                Ok(blocks) => blocks,
                Err(e) => {
                    tracing::warn!(height, error = %e, "warmup: failed to fetch block, skipping");
                    continue;
                }
            };

            for block in sub_blocks {
                for tx in &block.transactions {
                    for (idx, output) in tx.outputs.iter().enumerate() {
                        if output.address == UNDECODABLE_ADDRESS {
                            continue;
                        }
                        let outpoint = crate::types::Outpoint::new(tx.id.clone(), idx as u32);
                        self.cache.insert(outpoint.to_string(), output.address.clone(), output.amount, block.height);
                        warmed += 1;
                    }
                }
            }
        }

        tracing::info!(from = floor, to = last_indexed_height, warmed, "warmup complete");
        Ok(warmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IndexerError;
    use crate::types::{Block, Input, Output, Transaction};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixtureNormalizer {
        blocks: Mutex<HashMap<u64, Vec<Block>>>,
    }

    #[async_trait]
    impl BlockNormalizer for FixtureNormalizer {
        async fn normalize(&self, height: u64) -> Result<Vec<Block>, IndexerError> {
            self.blocks
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .ok_or_else(|| IndexerError::corrupt("fixture", height.to_string(), "missing"))
        }
    }

    fn block(height: u64) -> Block {
        Block {
            height,
            block_hash: format!("bh{height}"),
            prev_block_hash: format!("bh{}", height - 1),
            transactions: vec![Transaction {
                id: format!("tx{height}"),
                inputs: vec![Input { spending_tx_id: format!("tx{height}"), prev_outpoint: crate::types::Outpoint::new("0".repeat(64), 0) }],
                outputs: vec![Output { address: format!("addr{height}"), amount: 10 }],
            }],
            timestamp: height,
            partial: false,
        }
    }

    #[tokio::test]
    async fn warms_cache_with_recent_blocks_only() {
        let mut blocks = HashMap::new();
        for h in 95..=100u64 {
            blocks.insert(h, vec![block(h)]);
        }
        let normalizer = Arc::new(FixtureNormalizer { blocks: Mutex::new(blocks) });
        let cache = Arc::new(UtxoCache::new(1000));
        let loader = WarmupLoader::new(normalizer, cache.clone());

        let warmed = loader.warm(100, 3).await.unwrap();
        assert_eq!(warmed, 4); // heights 97..=100

        assert!(cache.get(&crate::types::Outpoint::new("tx97", 0).to_string()).is_some());
        assert!(cache.get(&crate::types::Outpoint::new("tx95", 0).to_string()).is_none());
    }

    #[tokio::test]
    async fn disabled_cache_skips_warmup_entirely() {
        let normalizer = Arc::new(FixtureNormalizer { blocks: Mutex::new(HashMap::new()) });
        let cache = Arc::new(UtxoCache::new(0));
        let loader = WarmupLoader::new(normalizer, cache);

        let warmed = loader.warm(100, 10).await.unwrap();
        assert_eq!(warmed, 0);
    }

    #[tokio::test]
    async fn missing_height_is_skipped_not_fatal() {
        let mut blocks = HashMap::new();
        blocks.insert(100u64, vec![block(100)]);
        let normalizer = Arc::new(FixtureNormalizer { blocks: Mutex::new(blocks) });
        let cache = Arc::new(UtxoCache::new(1000));
        let loader = WarmupLoader::new(normalizer, cache.clone());

        let warmed = loader.warm(100, 2).await.unwrap();
        assert_eq!(warmed, 1);
    }
}
