//! Archive Writer (C2).
//!
//! A single, non-sharded RocksDB instance holding one bincode-serialized
//! [`BlockEffects`] record per height. This is the undo log the Reorg
//! Resolver (C6) replays backward to roll the income/spend stores and cache
//! back to a fork point, and it doubles as the locally-recorded block hash
//! that C6 compares against the node on each poll — there is no separate
//! hash table, the archive already has to carry one per height.

use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::errors::IndexerError;
use crate::types::{Block, Outpoint};

/// One output created within an archived block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedOutput {
    pub outpoint: Outpoint,
    pub address: String,
    pub amount: u64,
}

/// One input (spend) recorded within an archived block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSpend {
    pub outpoint: Outpoint,
    pub spending_tx_id: String,
}

/// Everything needed to undo a single height: its hash (for reorg
/// comparison) and the income/spend effects it applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEffects {
    pub block_hash: String,
    pub prev_block_hash: String,
    pub outputs: Vec<ArchivedOutput>,
    pub spends: Vec<ArchivedSpend>,
}

impl BlockEffects {
    pub fn from_block(block: &Block) -> Self {
        let mut outputs = Vec::new();
        let mut spends = Vec::new();
        for tx in &block.transactions {
            for (idx, output) in tx.outputs.iter().enumerate() {
                outputs.push(ArchivedOutput {
                    outpoint: Outpoint::new(tx.id.clone(), idx as u32),
                    address: output.address.clone(),
                    amount: output.amount,
                });
            }
            for input in &tx.inputs {
                if input.is_coinbase() {
                    continue;
                }
                spends.push(ArchivedSpend {
                    outpoint: input.prev_outpoint.clone(),
                    spending_tx_id: input.spending_tx_id.clone(),
                });
            }
        }
        Self { block_hash: block.block_hash.clone(), prev_block_hash: block.prev_block_hash.clone(), outputs, spends }
    }
}

pub struct ArchiveWriter {
    db: Arc<DB>,
}

impl ArchiveWriter {
    pub fn open(base_dir: &Path) -> Result<Self, IndexerError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, base_dir.join("archive"))
            .map_err(|e| IndexerError::storage_io("archive", None, e))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Records the undo set for `height`, merging with any effects already
    /// recorded for a prior partial sub-block at the same height.
    pub async fn record(&self, height: u64, effects: BlockEffects) -> Result<(), IndexerError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), IndexerError> {
            // Big-endian so RocksDB's byte-wise key order matches numeric
            // height order; `prune_before`/`retained_from` depend on it.
            let key = height.to_be_bytes();
            let existing = db.get(key).map_err(|e| IndexerError::storage_io("archive", None, e))?;
            let merged = match existing {
                Some(existing) => {
                    let mut prior: BlockEffects = bincode::deserialize(&existing)
                        .map_err(|e| IndexerError::corrupt("archive", height.to_string(), format!("{e}")))?;
                    prior.block_hash = effects.block_hash;
                    prior.prev_block_hash = effects.prev_block_hash;
                    prior.outputs.extend(effects.outputs);
                    prior.spends.extend(effects.spends);
                    prior
                }
                None => effects,
            };
            let encoded = bincode::serialize(&merged)
                .map_err(|e| IndexerError::corrupt("archive", height.to_string(), format!("encode: {e}")))?;
            db.put(key, encoded).map_err(|e| IndexerError::storage_io("archive", None, e))
        })
        .await
        .map_err(|e| IndexerError::transient("archive.record join", e))?
    }

    pub async fn get(&self, height: u64) -> Result<Option<BlockEffects>, IndexerError> {
        let db = self.db.clone();
        let raw = tokio::task::spawn_blocking(move || db.get(height.to_be_bytes()))
            .await
            .map_err(|e| IndexerError::transient("archive.get join", e))?
            .map_err(|e| IndexerError::storage_io("archive", None, e))?;

        match raw {
            None => Ok(None),
            Some(bytes) => {
                let effects = bincode::deserialize(&bytes)
                    .map_err(|e| IndexerError::corrupt("archive", height.to_string(), format!("{e}")))?;
                Ok(Some(effects))
            }
        }
    }

    /// Deletes archived heights strictly below `floor`, keeping the archive
    /// bounded. The caller must never prune below the reorg window's reach.
    pub async fn prune_before(&self, floor: u64) -> Result<(), IndexerError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut batch = rocksdb::WriteBatch::default();
            let iter = db.iterator(rocksdb::IteratorMode::Start);
            for item in iter {
                let (key, _) = item?;
                if key.len() != 8 {
                    continue;
                }
                let height = u64::from_be_bytes(key.as_ref().try_into().unwrap());
                if height < floor {
                    batch.delete(key);
                } else {
                    break;
                }
            }
            db.write(batch)
        })
        .await
        .map_err(|e| IndexerError::transient("archive.prune_before join", e))?
        .map_err(|e| IndexerError::storage_io("archive", None, e))
    }

    /// Lowest height still retained in the archive, used to report
    /// [`IndexerError::ReorgBeyondHorizon`] when a rollback target predates it.
    pub async fn retained_from(&self) -> Result<Option<u64>, IndexerError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut iter = db.iterator(rocksdb::IteratorMode::Start);
            match iter.next() {
                Some(Ok((key, _))) if key.len() == 8 => Ok(Some(u64::from_be_bytes(key.as_ref().try_into().unwrap()))),
                Some(Ok(_)) | None => Ok(None),
                Some(Err(e)) => Err(e),
            }
        })
        .await
        .map_err(|e| IndexerError::transient("archive.retained_from join", e))?
        .map_err(|e| IndexerError::storage_io("archive", None, e))
    }

    pub async fn sync(&self) -> Result<(), IndexerError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush_wal(true))
            .await
            .map_err(|e| IndexerError::transient("archive.sync join", e))?
            .map_err(|e| IndexerError::storage_io("archive", None, e))
    }
}
