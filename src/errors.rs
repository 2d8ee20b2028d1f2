//! Error taxonomy (C11).
//!
//! One variant per error kind the design calls out. Every variant carries
//! enough context to populate a structured log line without the caller
//! having to reconstruct it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Retriable failure talking to the node or network (RPC timeout, connection reset).
    #[error("transient error calling {context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Underlying storage media failure. Retried a bounded number of times, then fatal.
    #[error("storage I/O error on {store}/{shard:?}: {source}")]
    StorageIo {
        store: String,
        shard: Option<usize>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stored value could not be parsed. Fatal for the single record, not the process.
    #[error("corrupt value at key {key} in {store}: {reason}")]
    Corrupt { store: String, key: String, reason: String },

    /// An invariant the pipeline relies on was violated. Always fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Reorg rollback target is older than the archive's retention window.
    #[error("reorg beyond horizon: requested rollback to height {requested_height}, archive retains from {retained_from}")]
    ReorgBeyondHorizon { requested_height: u64, retained_from: u64 },

    /// Clean shutdown requested; not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl IndexerError {
    pub fn transient(context: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        IndexerError::Transient { context: context.into(), source: Box::new(source) }
    }

    pub fn storage_io(
        store: impl Into<String>,
        shard: Option<usize>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        crate::metrics::increment_storage_errors();
        IndexerError::StorageIo { store: store.into(), shard, source: Box::new(source) }
    }

    pub fn corrupt(store: impl Into<String>, key: impl Into<String>, reason: impl Into<String>) -> Self {
        IndexerError::Corrupt { store: store.into(), key: key.into(), reason: reason.into() }
    }

    /// Whether the pipeline should abort the whole process rather than retry the block.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::InvariantViolation(_) | IndexerError::ReorgBeyondHorizon { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
