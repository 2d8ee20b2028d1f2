//! Mempool Bridge (C7).
//!
//! The indexer tracks confirmed UTXOs only; it has no opinion on mempool
//! policy. This module exposes the narrow interface a host application uses
//! to tell the indexer which unconfirmed income/spend fragments it has
//! already reflected elsewhere, so a reindex or warmup doesn't double count
//! them. Standalone operation uses [`LoggingMempoolBridge`], which records
//! the calls and does nothing else.

use async_trait::async_trait;

use crate::errors::IndexerError;
use crate::types::Outpoint;

#[async_trait]
pub trait MempoolBridge: Send + Sync {
    /// Notifies the bridge that `outpoints` were newly created by
    /// unconfirmed transactions and should be excluded from the indexer's
    /// confirmed UTXO view until mined.
    async fn batch_delete_income(&self, outpoints: Vec<Outpoint>) -> Result<(), IndexerError>;

    /// Notifies the bridge that `outpoints` were spent by unconfirmed
    /// transactions.
    async fn batch_delete_spend(&self, outpoints: Vec<Outpoint>) -> Result<(), IndexerError>;
}

/// Default bridge for standalone operation: logs the calls at debug level
/// and performs no bookkeeping of its own.
pub struct LoggingMempoolBridge;

#[async_trait]
impl MempoolBridge for LoggingMempoolBridge {
    async fn batch_delete_income(&self, outpoints: Vec<Outpoint>) -> Result<(), IndexerError> {
        tracing::debug!(count = outpoints.len(), "mempool bridge: batch_delete_income (no-op)");
        Ok(())
    }

    async fn batch_delete_spend(&self, outpoints: Vec<Outpoint>) -> Result<(), IndexerError> {
        tracing::debug!(count = outpoints.len(), "mempool bridge: batch_delete_spend (no-op)");
        Ok(())
    }
}
