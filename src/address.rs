// address.rs
//
// scriptPubKey -> payable address decoding (C4). P2PKH, P2SH and bare P2PK
// only — the Bitcoin-family scripts this indexer's supported chains actually
// use. Version bytes are per-chain, supplied by the caller.

use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

use crate::config::ChainParams;
use crate::types::UNDECODABLE_ADDRESS;

pub fn compute_address_hash(data: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(data);
    Ripemd160::digest(&sha).to_vec()
}

pub fn hash_address(hash: &[u8], version: u8) -> String {
    let mut extended = vec![version];
    extended.extend_from_slice(hash);

    let checksum = sha256d(&extended);
    extended.extend_from_slice(&checksum[0..4]);

    bs58::encode(extended).into_string()
}

fn sha256d(data: &[u8]) -> Vec<u8> {
    let first = Sha256::digest(data);
    Sha256::digest(first).to_vec()
}

fn scriptpubkey_to_p2pkh_address(script: &[u8], params: &ChainParams) -> Option<String> {
    if script.len() == 25 && script[0] == 0x76 && script[1] == 0xa9 && script[2] == 0x14 && script[23] == 0x88 && script[24] == 0xac {
        Some(hash_address(&script[3..23], params.p2pkh_version))
    } else {
        None
    }
}

fn scriptpubkey_to_p2sh_address(script: &[u8], params: &ChainParams) -> Option<String> {
    if script.len() == 23 && script[0] == 0xa9 && script[1] == 0x14 && script[22] == 0x87 {
        Some(hash_address(&script[2..22], params.p2sh_version))
    } else {
        None
    }
}

fn compress_pubkey(pub_key_bytes: &[u8]) -> Option<Vec<u8>> {
    match pub_key_bytes.len() {
        65 if pub_key_bytes[0] == 0x04 => {
            let x = &pub_key_bytes[1..33];
            let y = &pub_key_bytes[33..65];
            let parity = if y[31] % 2 == 0 { 2 } else { 3 };
            let mut compressed = vec![parity];
            compressed.extend_from_slice(x);
            Some(compressed)
        }
        33 if pub_key_bytes[0] == 0x02 || pub_key_bytes[0] == 0x03 => Some(pub_key_bytes.to_vec()),
        _ => None,
    }
}

fn extract_pubkey_from_script(script: &[u8]) -> Option<&[u8]> {
    const OP_CHECKSIG: u8 = 0xac;

    if script.last()? != &OP_CHECKSIG {
        return None;
    }

    match script.len() {
        67 => Some(&script[1..66]),
        35 => Some(&script[1..34]),
        _ => None,
    }
}

fn scriptpubkey_to_p2pk(script: &[u8], params: &ChainParams) -> Option<String> {
    const OP_DUP: u8 = 0x76;

    if script.contains(&OP_DUP) {
        return None;
    }

    let pubkey = extract_pubkey_from_script(script)?;
    let compressed = compress_pubkey(pubkey)?;
    let pubkey_hash = compute_address_hash(&compressed);

    Some(hash_address(&pubkey_hash, params.p2pkh_version))
}

/// Decode a scriptPubKey into a payable address, falling back to
/// [`UNDECODABLE_ADDRESS`] for scripts this indexer doesn't classify
/// (OP_RETURN, multisig, anything nonstandard).
pub fn scriptpubkey_to_address(script: &[u8], params: &ChainParams) -> String {
    const OP_DUP: u8 = 0x76;
    const OP_HASH160: u8 = 0xa9;
    const OP_EQUAL: u8 = 0x87;
    const OP_EQUALVERIFY: u8 = 0x88;
    const OP_CHECKSIG: u8 = 0xac;

    if script.is_empty() {
        return UNDECODABLE_ADDRESS.to_string();
    }

    match script {
        [OP_DUP, OP_HASH160, 0x14, .., OP_EQUALVERIFY, OP_CHECKSIG] if script.len() == 25 => {
            scriptpubkey_to_p2pkh_address(script, params).unwrap_or_else(|| UNDECODABLE_ADDRESS.to_string())
        }
        [OP_HASH160, 0x14, .., OP_EQUAL] if script.len() == 23 => {
            scriptpubkey_to_p2sh_address(script, params).unwrap_or_else(|| UNDECODABLE_ADDRESS.to_string())
        }
        [.., OP_CHECKSIG] if !script.contains(&OP_DUP) && script.len() > 1 => {
            scriptpubkey_to_p2pk(script, params).unwrap_or_else(|| UNDECODABLE_ADDRESS.to_string())
        }
        _ => UNDECODABLE_ADDRESS.to_string(),
    }
}
