//! Sharded Key/Value Store (C1).
//!
//! N independent `rocksdb::DB` instances, one per shard directory, dispatched
//! by a stable hash of the key mod N — not column families of a single DB.
//! Every store backing UTXO/Address-Income/Spend data goes through this.

use rocksdb::{MergeOperands, Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::errors::IndexerError;
use crate::types::Outpoint;

/// Comma-append merge operator implementing the list-level fragment grammar.
fn comma_append_merge(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
    for op in operands.iter() {
        if !out.is_empty() {
            out.push(b',');
        }
        out.extend_from_slice(op);
    }
    Some(out)
}

fn fnv1a(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for b in key.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub struct ShardedStore {
    shards: Vec<Arc<DB>>,
    shard_count: usize,
}

impl ShardedStore {
    pub fn open(base_dir: &Path, shard_count: usize) -> Result<Self, IndexerError> {
        let mut shards = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let shard_dir = base_dir.join(format!("shard_{i}"));
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.set_merge_operator_associative("comma_append", comma_append_merge);

            let db = DB::open(&opts, &shard_dir)
                .map_err(|e| IndexerError::storage_io(base_dir.display().to_string(), Some(i), e))?;
            shards.push(Arc::new(db));
        }
        Ok(Self { shards, shard_count })
    }

    pub fn shard_index(&self, key: &str) -> usize {
        (fnv1a(key) % self.shard_count as u64) as usize
    }

    fn shard_for(&self, key: &str) -> Arc<DB> {
        self.shards[self.shard_index(key)].clone()
    }

    pub async fn get(&self, key: String) -> Result<Option<String>, IndexerError> {
        let db = self.shard_for(&key);
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes())
                .map(|opt| opt.map(|v| String::from_utf8_lossy(&v).into_owned()))
        })
        .await
        .map_err(|e| IndexerError::transient("shard_store.get join", e))?
        .map_err(|e| IndexerError::storage_io("shard_store", None, e))
    }

    pub async fn set(&self, key: String, value: String) -> Result<(), IndexerError> {
        let db = self.shard_for(&key);
        tokio::task::spawn_blocking(move || db.put(key.as_bytes(), value.as_bytes()))
            .await
            .map_err(|e| IndexerError::transient("shard_store.set join", e))?
            .map_err(|e| IndexerError::storage_io("shard_store", None, e))
    }

    /// Atomically appends `fragment` to the comma-separated list stored at `key`.
    pub async fn merge_append(&self, key: String, fragment: String) -> Result<(), IndexerError> {
        let db = self.shard_for(&key);
        tokio::task::spawn_blocking(move || db.merge(key.as_bytes(), fragment.as_bytes()))
            .await
            .map_err(|e| IndexerError::transient("shard_store.merge_append join", e))?
            .map_err(|e| IndexerError::storage_io("shard_store", None, e))
    }

    pub async fn delete(&self, key: String) -> Result<(), IndexerError> {
        let db = self.shard_for(&key);
        tokio::task::spawn_blocking(move || db.delete(key.as_bytes()))
            .await
            .map_err(|e| IndexerError::transient("shard_store.delete join", e))?
            .map_err(|e| IndexerError::storage_io("shard_store", None, e))
    }

    /// Groups `items` by shard and applies one `WriteBatch` of merges per
    /// shard, bounded to `workers` shards in flight at once.
    pub async fn bulk_merge_concurrent(
        &self,
        items: Vec<(String, String)>,
        workers: usize,
    ) -> Result<(), IndexerError> {
        let mut by_shard: HashMap<usize, Vec<(String, String)>> = HashMap::new();
        for (key, fragment) in items {
            by_shard.entry(self.shard_index(&key)).or_default().push((key, fragment));
        }

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(by_shard.len());

        for (shard_i, batch) in by_shard {
            let db = self.shards[shard_i].clone();
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| IndexerError::Cancelled)?;
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut write_batch = rocksdb::WriteBatch::default();
                for (key, fragment) in batch {
                    write_batch.merge(key.as_bytes(), fragment.as_bytes());
                }
                db.write(write_batch)
            }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| IndexerError::transient("bulk_merge_concurrent join", e))?
                .map_err(|e| IndexerError::storage_io("shard_store", None, e))?;
        }
        Ok(())
    }

    /// Looks up `keys` across shards with a worker pool roughly `cores * 4`
    /// wide, merging per-shard accumulators into one result map.
    pub async fn query_addresses_for_outpoints(
        &self,
        keys: Vec<String>,
        workers: usize,
    ) -> Result<HashMap<String, Option<String>>, IndexerError> {
        let mut by_shard: HashMap<usize, Vec<String>> = HashMap::new();
        for key in keys {
            by_shard.entry(self.shard_index(&key)).or_default().push(key);
        }

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(by_shard.len());

        for (shard_i, shard_keys) in by_shard {
            let db = self.shards[shard_i].clone();
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| IndexerError::Cancelled)?;
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut out = HashMap::with_capacity(shard_keys.len());
                for key in shard_keys {
                    let value = db
                        .get(key.as_bytes())?
                        .map(|v| String::from_utf8_lossy(&v).into_owned());
                    out.insert(key, value);
                }
                Ok::<_, rocksdb::Error>(out)
            }));
        }

        let mut merged = HashMap::new();
        for handle in handles {
            let partial = handle
                .await
                .map_err(|e| IndexerError::transient("query_addresses_for_outpoints join", e))?
                .map_err(|e| IndexerError::storage_io("shard_store", None, e))?;
            merged.extend(partial);
        }
        Ok(merged)
    }

    /// Implements `query_addresses_for_outpoints`: fetches the
    /// encompassing tx_id's UTXO-record for each outpoint, decodes the
    /// fragment at the requested output index to recover the address, and
    /// groups outpoints by address. Built atop [`Self::query_addresses_for_outpoints`]
    /// so the per-shard fan-out logic lives in one place.
    pub async fn resolve_outpoint_addresses(
        &self,
        outpoints: Vec<Outpoint>,
        workers: usize,
    ) -> Result<HashMap<String, Vec<Outpoint>>, IndexerError> {
        let mut by_tx: HashMap<String, Vec<Outpoint>> = HashMap::new();
        for outpoint in outpoints {
            by_tx.entry(outpoint.tx_id.clone()).or_default().push(outpoint);
        }

        let tx_ids: Vec<String> = by_tx.keys().cloned().collect();
        let values = self.query_addresses_for_outpoints(tx_ids, workers).await?;

        let mut grouped: HashMap<String, Vec<Outpoint>> = HashMap::new();
        for (tx_id, outpoints) in by_tx {
            let Some(Some(value)) = values.get(&tx_id).cloned() else { continue };
            let fragments: Vec<&str> = value.split(',').filter(|f| !f.is_empty()).collect();
            for outpoint in outpoints {
                let Some(fragment) = fragments.get(outpoint.output_index as usize) else { continue };
                let Some((address, _rest)) = fragment.split_once('@') else { continue };
                grouped.entry(address.to_string()).or_default().push(outpoint);
            }
        }
        Ok(grouped)
    }

    /// Read-modify-write: drop fragments from the comma-separated list at
    /// `key` that `predicate` rejects. Used by reorg rollback to strip
    /// orphaned fragments without discarding the rest of the list.
    pub async fn rewrite_filtered<F>(&self, key: String, predicate: F) -> Result<(), IndexerError>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let db = self.shard_for(&key);
        tokio::task::spawn_blocking(move || {
            let existing = db.get(key.as_bytes())?;
            let Some(existing) = existing else { return Ok(()) };
            let text = String::from_utf8_lossy(&existing);
            let kept: Vec<&str> = text
                .split(',')
                .filter(|fragment| !fragment.is_empty())
                .filter(|fragment| predicate(fragment))
                .collect();

            if kept.is_empty() {
                db.delete(key.as_bytes())
            } else {
                db.put(key.as_bytes(), kept.join(",").as_bytes())
            }
        })
        .await
        .map_err(|e| IndexerError::transient("rewrite_filtered join", e))?
        .map_err(|e| IndexerError::storage_io("shard_store", None, e))
    }

    /// Forces a full compaction of every shard. Called by the memory
    /// watchdog when resident memory crosses the configured ceiling — an
    /// out-of-band remedial action, not part of the normal write path.
    pub async fn compact_all(&self) -> Result<(), IndexerError> {
        for (i, shard) in self.shards.iter().enumerate() {
            let db = shard.clone();
            tokio::task::spawn_blocking(move || {
                db.compact_range(None::<&[u8]>, None::<&[u8]>);
            })
            .await
            .map_err(|e| IndexerError::transient("shard_store.compact_all join", e))
            .map_err(|e| {
                tracing::warn!(shard = i, error = %e, "shard compaction join failed");
                e
            })?;
        }
        Ok(())
    }

    /// Flushes the WAL of every shard, forcing a durable fsync.
    pub async fn sync(&self) -> Result<(), IndexerError> {
        for (i, shard) in self.shards.iter().enumerate() {
            let db = shard.clone();
            tokio::task::spawn_blocking(move || db.flush_wal(true))
                .await
                .map_err(|e| IndexerError::transient("shard_store.sync join", e))?
                .map_err(|e| IndexerError::storage_io("shard_store", Some(i), e))?;
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Iterates every key/value pair in a single shard with the given key prefix.
    pub fn iterate_shard(&self, shard_i: usize, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let db = &self.shards[shard_i];
        let mut out = Vec::new();
        let iter = db.prefix_iterator(prefix);
        for item in iter {
            let Ok((k, v)) = item else { break };
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        out
    }
}
