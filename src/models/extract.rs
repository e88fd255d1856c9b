use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::TxStatus;

fn sha256_hex(input: String) -> String {
    hex::encode(Sha256::digest(input))
}

/// Normalized transfer as handed to observers. Amounts are display strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub wx_id: String,
    pub tx_id: String,
    pub symbol: String,
    /// `address:amount` entries.
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub amount: String,
    pub fees: String,
    pub decimals: u32,
    pub block_hash: String,
    pub block_height: u64,
    pub confirm_time: u64,
    pub status: TxStatus,
}

impl Transfer {
    pub fn wx_id_for(tx_id: &str, symbol: &str) -> String {
        sha256_hex(format!("{}_{}", symbol, tx_id))
    }
}

/// One side (input or output) of a transfer touching a watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recharge {
    pub sid: String,
    pub tx_id: String,
    pub address: String,
    pub amount: String,
    pub symbol: String,
    pub block_hash: String,
    pub block_height: u64,
    /// Always 0 on an account-model chain.
    pub index: u64,
    pub created_at: i64,
}

impl Recharge {
    pub fn input_sid(tx_id: &str, symbol: &str, index: u64) -> String {
        sha256_hex(format!("{}_{}_input_{}", tx_id, symbol, index))
    }

    pub fn output_sid(tx_id: &str, symbol: &str, index: u64) -> String {
        sha256_hex(format!("{}_{}_output_{}", tx_id, symbol, index))
    }
}

/// Everything one watched source key learns from one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxExtractData {
    pub transaction: Transfer,
    pub inputs: Vec<Recharge>,
    pub outputs: Vec<Recharge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractResult {
    pub txid: String,
    pub block_hash: String,
    pub block_height: u64,
    pub block_time: u64,
    pub success: bool,
    /// Keyed by source key. Empty when no side of the transfer is watched.
    pub extract_data: BTreeMap<String, TxExtractData>,
    pub failure: Option<String>,
}

impl ExtractResult {
    pub fn failed(txid: &str, block_height: u64, reason: impl Into<String>) -> Self {
        Self {
            txid: txid.to_string(),
            block_hash: String::new(),
            block_height,
            block_time: 0,
            success: false,
            extract_data: BTreeMap::new(),
            failure: Some(reason.into()),
        }
    }
}
