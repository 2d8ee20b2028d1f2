//! Block Normalizer (C4).
//!
//! Per-chain adapter producing a [`Block`] from raw node bytes. Must not call
//! into C1/C3/C5 — its only collaborator is the Node RPC boundary.

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::address::scriptpubkey_to_address;
use crate::config::ChainParams;
use crate::errors::IndexerError;
use crate::rpc::NodeRpcClient;
use crate::types::{Block, Input, Output, Outpoint, Transaction};

#[async_trait]
pub trait BlockNormalizer: Send + Sync {
    /// Returns one or more partial sub-blocks for `height`, in order; only
    /// the last carries `partial = false`.
    async fn normalize(&self, height: u64) -> Result<Vec<Block>, IndexerError>;
}

pub struct BitcoinFamilyNormalizer {
    rpc: Arc<dyn NodeRpcClient>,
    params: ChainParams,
    /// Transactions per partial sub-block; a block with more than this many
    /// transactions is split to bound per-batch memory.
    split_threshold: usize,
}

impl BitcoinFamilyNormalizer {
    pub fn new(rpc: Arc<dyn NodeRpcClient>, params: ChainParams, split_threshold: usize) -> Self {
        Self { rpc, params, split_threshold }
    }
}

#[async_trait]
impl BlockNormalizer for BitcoinFamilyNormalizer {
    async fn normalize(&self, height: u64) -> Result<Vec<Block>, IndexerError> {
        let block_hash = self.rpc.get_block_hash(height).await?;
        let raw = self.rpc.get_block_raw(&block_hash).await?;

        let mut cursor = Cursor::new(raw.as_slice());
        let header = read_header(&mut cursor)?;
        let computed_hash = double_sha256_reversed_hex(&header.raw);

        if computed_hash != block_hash.to_lowercase() {
            return Err(IndexerError::Corrupt {
                store: "normalizer".to_string(),
                key: block_hash,
                reason: format!("header hash mismatch at height {height}: computed {computed_hash}"),
            });
        }

        let tx_count = read_varint(&mut cursor)?;
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(read_transaction(&mut cursor, &self.params)?);
        }

        if self.split_threshold == 0 || transactions.len() <= self.split_threshold {
            return Ok(vec![Block {
                height,
                block_hash: computed_hash,
                prev_block_hash: header.prev_block_hash,
                transactions,
                timestamp: header.timestamp,
                partial: false,
            }]);
        }

        let chunks: Vec<Vec<Transaction>> = transactions
            .chunks(self.split_threshold)
            .map(|c| c.to_vec())
            .collect();
        let last_idx = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, txs)| Block {
                height,
                block_hash: computed_hash.clone(),
                prev_block_hash: header.prev_block_hash.clone(),
                transactions: txs,
                timestamp: header.timestamp,
                partial: i != last_idx,
            })
            .collect())
    }
}

struct Header {
    raw: [u8; 80],
    prev_block_hash: String,
    timestamp: u64,
}

fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<Header, IndexerError> {
    let mut raw = [0u8; 80];
    cursor
        .read_exact(&mut raw)
        .map_err(|e| IndexerError::corrupt("normalizer", "header", format!("short header: {e}")))?;

    let mut prev_hash_bytes = raw[4..36].to_vec();
    prev_hash_bytes.reverse();
    let prev_block_hash = hex::encode(prev_hash_bytes);

    let timestamp = u32::from_le_bytes(raw[68..72].try_into().unwrap()) as u64;

    Ok(Header { raw, prev_block_hash, timestamp })
}

fn double_sha256_reversed_hex(data: &[u8]) -> String {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut bytes: Vec<u8> = second.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64, IndexerError> {
    let prefix = cursor
        .read_u8()
        .map_err(|e| IndexerError::corrupt("normalizer", "varint", format!("{e}")))?;
    let value = match prefix {
        0xfd => cursor.read_u16::<LittleEndian>().map(|v| v as u64),
        0xfe => cursor.read_u32::<LittleEndian>().map(|v| v as u64),
        0xff => cursor.read_u64::<LittleEndian>(),
        _ => return Ok(prefix as u64),
    };
    value.map_err(|e| IndexerError::corrupt("normalizer", "varint", format!("{e}")))
}

fn read_transaction(cursor: &mut Cursor<&[u8]>, params: &ChainParams) -> Result<Transaction, IndexerError> {
    let tx_start = cursor.position() as usize;

    let _version = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| IndexerError::corrupt("normalizer", "tx.version", format!("{e}")))?;

    let input_count = read_varint(cursor)?;
    let mut inputs = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        let mut prev_tx_id_bytes = [0u8; 32];
        cursor
            .read_exact(&mut prev_tx_id_bytes)
            .map_err(|e| IndexerError::corrupt("normalizer", "tx.input.prevout", format!("{e}")))?;
        let mut display_bytes = prev_tx_id_bytes.to_vec();
        display_bytes.reverse();
        let prev_tx_id = hex::encode(display_bytes);

        let prev_output_index = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| IndexerError::corrupt("normalizer", "tx.input.index", format!("{e}")))?;

        let script_sig_len = read_varint(cursor)?;
        skip_bytes(cursor, script_sig_len)?;

        let _sequence = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| IndexerError::corrupt("normalizer", "tx.input.sequence", format!("{e}")))?;

        inputs.push(Input {
            spending_tx_id: String::new(),
            prev_outpoint: Outpoint::new(prev_tx_id, prev_output_index),
        });
    }

    let output_count = read_varint(cursor)?;
    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let amount = cursor
            .read_i64::<LittleEndian>()
            .map_err(|e| IndexerError::corrupt("normalizer", "tx.output.value", format!("{e}")))?;
        let script_len = read_varint(cursor)?;
        let mut script = vec![0u8; script_len as usize];
        cursor
            .read_exact(&mut script)
            .map_err(|e| IndexerError::corrupt("normalizer", "tx.output.script", format!("{e}")))?;

        outputs.push(Output {
            address: scriptpubkey_to_address(&script, params),
            amount: amount.max(0) as u64,
        });
    }

    let _locktime = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| IndexerError::corrupt("normalizer", "tx.locktime", format!("{e}")))?;

    let tx_end = cursor.position() as usize;
    let raw_tx = &cursor.get_ref()[tx_start..tx_end];
    let tx_id = double_sha256_reversed_hex(raw_tx);

    for input in inputs.iter_mut() {
        input.spending_tx_id = tx_id.clone();
    }

    Ok(Transaction { id: tx_id, inputs, outputs })
}

fn skip_bytes(cursor: &mut Cursor<&[u8]>, n: u64) -> Result<(), IndexerError> {
    let mut buf = vec![0u8; n as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| IndexerError::corrupt("normalizer", "script", format!("short script: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(n: u64) -> Vec<u8> {
        if n < 0xfd {
            vec![n as u8]
        } else if n <= 0xffff {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(n as u16).to_le_bytes());
            v
        } else {
            let mut v = vec![0xff];
            v.extend_from_slice(&n.to_le_bytes());
            v
        }
    }

    fn coinbase_tx_bytes() -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes()); // version
        tx.extend(varint(1)); // 1 input
        tx.extend_from_slice(&[0u8; 32]); // coinbase prevout hash
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes()); // prevout index
        tx.extend(varint(4));
        tx.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]); // scriptSig
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes()); // sequence
        tx.extend(varint(1)); // 1 output
        tx.extend_from_slice(&5000i64.to_le_bytes()); // amount
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0u8; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        tx.extend(varint(script.len() as u64));
        tx.extend_from_slice(&script);
        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }

    #[test]
    fn decodes_single_coinbase_transaction() {
        let tx_bytes = coinbase_tx_bytes();
        let mut cursor = Cursor::new(tx_bytes.as_slice());
        let tx = read_transaction(&mut cursor, &ChainParams::BITCOIN).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert!(tx.inputs[0].is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].amount, 5000);
    }

    #[test]
    fn varint_round_trip() {
        for n in [0u64, 1, 252, 253, 65535, 65536, u32::MAX as u64 + 1] {
            let bytes = varint(n);
            let mut cursor = Cursor::new(bytes.as_slice());
            assert_eq!(read_varint(&mut cursor).unwrap(), n);
        }
    }
}
