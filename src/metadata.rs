//! Metadata Store (C8).
//!
//! A single non-sharded RocksDB instance holding indexer-wide bookkeeping:
//! checkpoint height, mempool-clean height, running address/UTXO counts, and
//! the per-shard resume cursors for the background counter sweep. Writes are
//! serialized behind a mutex since this store sees far less traffic than the
//! sharded stores and correctness here matters more than throughput.

use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::IndexerError;

const KEY_LAST_INDEXED_HEIGHT: &[u8] = b"last_indexed_height";
const KEY_LAST_MEMPOOL_CLEAN_HEIGHT: &[u8] = b"last_mempool_clean_height";
const KEY_TOTAL_ADDRESS_COUNT: &[u8] = b"total_address_count";
const KEY_TOTAL_UTXO_COUNT: &[u8] = b"total_utxo_count";
const KEY_ADDRESS_LAST_KEYS: &[u8] = b"address_last_keys";
const KEY_UTXO_LAST_KEYS: &[u8] = b"utxo_last_keys";

/// Per-shard resume cursor for the background counter (§5): the last key
/// observed in each shard's keyspace when a sweep was interrupted or
/// completed.
pub type ShardCursors = HashMap<usize, Vec<u8>>;

pub struct MetadataStore {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn open(base_dir: &Path) -> Result<Self, IndexerError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, base_dir.join("metadata"))
            .map_err(|e| IndexerError::storage_io("metadata", None, e))?;
        Ok(Self { db: Arc::new(db), write_lock: Mutex::new(()) })
    }

    async fn get_u64(&self, key: &'static [u8]) -> Result<Option<u64>, IndexerError> {
        let db = self.db.clone();
        let raw = tokio::task::spawn_blocking(move || db.get(key))
            .await
            .map_err(|e| IndexerError::transient("metadata.get join", e))?
            .map_err(|e| IndexerError::storage_io("metadata", None, e))?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IndexerError::corrupt("metadata", String::from_utf8_lossy(key), "not 8 bytes"))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
        }
    }

    async fn put_u64(&self, key: &'static [u8], value: u64) -> Result<(), IndexerError> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.put(key, value.to_le_bytes()))
            .await
            .map_err(|e| IndexerError::transient("metadata.put join", e))?
            .map_err(|e| IndexerError::storage_io("metadata", None, e))
    }

    pub async fn last_indexed_height(&self) -> Result<Option<u64>, IndexerError> {
        self.get_u64(KEY_LAST_INDEXED_HEIGHT).await
    }

    pub async fn set_last_indexed_height(&self, height: u64) -> Result<(), IndexerError> {
        self.put_u64(KEY_LAST_INDEXED_HEIGHT, height).await
    }

    pub async fn last_mempool_clean_height(&self) -> Result<Option<u64>, IndexerError> {
        self.get_u64(KEY_LAST_MEMPOOL_CLEAN_HEIGHT).await
    }

    pub async fn set_last_mempool_clean_height(&self, height: u64) -> Result<(), IndexerError> {
        self.put_u64(KEY_LAST_MEMPOOL_CLEAN_HEIGHT, height).await
    }

    pub async fn total_address_count(&self) -> Result<u64, IndexerError> {
        Ok(self.get_u64(KEY_TOTAL_ADDRESS_COUNT).await?.unwrap_or(0))
    }

    pub async fn set_total_address_count(&self, count: u64) -> Result<(), IndexerError> {
        self.put_u64(KEY_TOTAL_ADDRESS_COUNT, count).await
    }

    pub async fn total_utxo_count(&self) -> Result<u64, IndexerError> {
        Ok(self.get_u64(KEY_TOTAL_UTXO_COUNT).await?.unwrap_or(0))
    }

    pub async fn set_total_utxo_count(&self, count: u64) -> Result<(), IndexerError> {
        self.put_u64(KEY_TOTAL_UTXO_COUNT, count).await
    }

    async fn get_cursors(&self, key: &'static [u8]) -> Result<ShardCursors, IndexerError> {
        let db = self.db.clone();
        let raw = tokio::task::spawn_blocking(move || db.get(key))
            .await
            .map_err(|e| IndexerError::transient("metadata.get_cursors join", e))?
            .map_err(|e| IndexerError::storage_io("metadata", None, e))?;
        match raw {
            None => Ok(HashMap::new()),
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| IndexerError::corrupt("metadata", String::from_utf8_lossy(key), format!("{e}"))),
        }
    }

    async fn put_cursors(&self, key: &'static [u8], cursors: &ShardCursors) -> Result<(), IndexerError> {
        let encoded = bincode::serialize(cursors)
            .map_err(|e| IndexerError::corrupt("metadata", String::from_utf8_lossy(key), format!("encode: {e}")))?;
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.put(key, encoded))
            .await
            .map_err(|e| IndexerError::transient("metadata.put_cursors join", e))?
            .map_err(|e| IndexerError::storage_io("metadata", None, e))
    }

    pub async fn address_last_keys(&self) -> Result<ShardCursors, IndexerError> {
        self.get_cursors(KEY_ADDRESS_LAST_KEYS).await
    }

    pub async fn set_address_last_keys(&self, cursors: &ShardCursors) -> Result<(), IndexerError> {
        self.put_cursors(KEY_ADDRESS_LAST_KEYS, cursors).await
    }

    pub async fn utxo_last_keys(&self) -> Result<ShardCursors, IndexerError> {
        self.get_cursors(KEY_UTXO_LAST_KEYS).await
    }

    pub async fn set_utxo_last_keys(&self, cursors: &ShardCursors) -> Result<(), IndexerError> {
        self.put_cursors(KEY_UTXO_LAST_KEYS, cursors).await
    }

    pub async fn sync(&self) -> Result<(), IndexerError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush_wal(true))
            .await
            .map_err(|e| IndexerError::transient("metadata.sync join", e))?
            .map_err(|e| IndexerError::storage_io("metadata", None, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn checkpoint_height_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.last_indexed_height().await.unwrap(), None);

        store.set_last_indexed_height(12345).await.unwrap();
        assert_eq!(store.last_indexed_height().await.unwrap(), Some(12345));
    }

    #[tokio::test]
    async fn counts_default_to_zero() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.total_address_count().await.unwrap(), 0);
        assert_eq!(store.total_utxo_count().await.unwrap(), 0);

        store.set_total_address_count(42).await.unwrap();
        store.set_total_utxo_count(99).await.unwrap();
        assert_eq!(store.total_address_count().await.unwrap(), 42);
        assert_eq!(store.total_utxo_count().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn cursor_maps_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.address_last_keys().await.unwrap().is_empty());

        let mut cursors = HashMap::new();
        cursors.insert(0usize, b"addr123".to_vec());
        cursors.insert(3usize, b"addr999".to_vec());
        store.set_address_last_keys(&cursors).await.unwrap();

        let loaded = store.address_last_keys().await.unwrap();
        assert_eq!(loaded.get(&0), Some(&b"addr123".to_vec()));
        assert_eq!(loaded.get(&3), Some(&b"addr999".to_vec()));
    }

    #[tokio::test]
    async fn mempool_clean_height_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.set_last_mempool_clean_height(777).await.unwrap();
        assert_eq!(store.last_mempool_clean_height().await.unwrap(), Some(777));
    }
}
