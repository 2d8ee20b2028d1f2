//! Normalized domain model shared by every component of the indexer.
//!
//! These types are the contract between the Block Normalizer (C4) and
//! everything downstream of it (C5 pipeline, C6 reorg, C2 archive). Nothing
//! in this module talks to a chain node or a store directly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the sentinel previous-tx-id used by coinbase inputs: sixty-four '0' hex chars.
pub const COINBASE_SENTINEL_LEN: usize = 64;

/// Rendered address used when a scriptPubKey cannot be decoded into a payable address.
pub const UNDECODABLE_ADDRESS: &str = "errAddress";

/// `(tx_id, output_index)` — globally unique identifier of a UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub tx_id: String,
    pub output_index: u32,
}

impl Outpoint {
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        Self { tx_id: tx_id.into(), output_index }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_id.len() == COINBASE_SENTINEL_LEN && self.tx_id.bytes().all(|b| b == b'0')
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

impl std::str::FromStr for Outpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx_id, idx) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("malformed outpoint: {s}"))?;
        let output_index: u32 = idx
            .parse()
            .map_err(|_| format!("malformed outpoint index: {s}"))?;
        Ok(Outpoint { tx_id: tx_id.to_string(), output_index })
    }
}

/// A single transaction output: `(address, amount, block_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    /// Rendered payable address, or [`UNDECODABLE_ADDRESS`] if the script could not be decoded.
    pub address: String,
    /// Amount in the chain's smallest unit.
    pub amount: u64,
}

/// A reference to a previously-created output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub spending_tx_id: String,
    pub prev_outpoint: Outpoint,
}

impl Input {
    pub fn is_coinbase(&self) -> bool {
        self.prev_outpoint.is_coinbase()
    }
}

/// `(id, [Input], [Output])`. Order of inputs/outputs within a transaction is
/// preserved from the block; output order doubles as output_index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

/// A normalized block: the sole output of the Block Normalizer (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub block_hash: String,
    pub prev_block_hash: String,
    pub transactions: Vec<Transaction>,
    /// Block header time, as seconds since epoch.
    pub timestamp: u64,
    /// Set when this is a sub-batch of a larger block split for memory
    /// pressure. Only the final partial of a height may advance the checkpoint.
    pub partial: bool,
}

impl Block {
    /// Decimal-string rendering of `timestamp`, as stored in fragments.
    pub fn block_time(&self) -> String {
        self.timestamp.to_string()
    }
}
