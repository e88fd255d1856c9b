use std::fmt::Display;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod extract;
pub use extract::{ExtractResult, Recharge, Transfer, TxExtractData};

/// One logical block: every tip block of a tipset folded together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    /// CIDs of the tip blocks, in tipset order.
    pub tipset_key: Vec<String>,
    /// Transfers left out of `transactions` because their receipt could not
    /// be looked up.
    #[serde(default)]
    pub unresolved: Vec<UnresolvedTransaction>,
}

impl Block {
    pub fn header(&self, symbol: &str, fork: bool) -> BlockHeader {
        BlockHeader {
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            height: self.height,
            time: self.timestamp,
            fork,
            symbol: symbol.to_string(),
        }
    }

    pub fn to_local(&self) -> LocalBlock {
        LocalBlock {
            height: self.height,
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedTransaction {
    pub tx_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Success,
    Failed,
    /// No receipt has been looked up yet.
    Unknown,
}

impl TxStatus {
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 { TxStatus::Success } else { TxStatus::Failed }
    }
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Success => write!(f, "1"),
            TxStatus::Failed => write!(f, "0"),
            TxStatus::Unknown => write!(f, "-1"),
        }
    }
}

/// A value transfer message. Amounts are smallest-unit integer strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub value: String,
    pub nonce: u64,
    pub gas: String,
    pub gas_price: String,
    pub method: u64,
    pub status: TxStatus,
    pub block_height: u64,
    pub block_hash: String,
    pub timestamp: u64,
}

impl Transaction {
    /// Sender-scoped identity of the transfer.
    pub fn sender_nonce_key(&self) -> String {
        format!("{}_{}", self.from, self.nonce)
    }

    pub fn backfill(&mut self, height: u64, hash: &str, timestamp: u64) {
        self.block_height = height;
        self.block_hash = hash.to_string();
        self.timestamp = timestamp;
    }
}

/// Durable "chain progress observed so far" pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub height: u64,
    pub hash: String,
}

/// Payload of a new-block or fork notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub previous_hash: String,
    pub height: u64,
    pub time: u64,
    pub fork: bool,
    pub symbol: String,
}

/// Header of an accepted block kept for fork resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlock {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: u64,
}

impl LocalBlock {
    pub fn header(&self, symbol: &str, fork: bool) -> BlockHeader {
        BlockHeader {
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            height: self.height,
            time: self.timestamp,
            fork,
            symbol: symbol.to_string(),
        }
    }
}

/// A height, or a single transaction at a height, waiting for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedScanRecord {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "block_height")]
    pub height: u64,
    pub tx_id: Option<String>,
    pub reason: String,
}

impl FailedScanRecord {
    /// The id is derived from `(height, txid, symbol)`, so recording the same
    /// failure twice overwrites instead of duplicating.
    pub fn new(height: u64, tx_id: Option<&str>, reason: impl Into<String>, symbol: &str) -> Self {
        let id = hex::encode(Sha256::digest(format!(
            "{}_{}_{}",
            height,
            tx_id.unwrap_or_default(),
            symbol
        )));
        Self {
            id,
            symbol: symbol.to_string(),
            height,
            tx_id: tx_id.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Balance of a watched address, in display units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub symbol: String,
    pub address: String,
    pub balance: String,
}

/// Argument passed to the watched-address predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub address: String,
    pub symbol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_record_id_is_deterministic() {
        let a = FailedScanRecord::new(100, Some("bafy1"), "rpc down", "FIL");
        let b = FailedScanRecord::new(100, Some("bafy1"), "still down", "FIL");
        let c = FailedScanRecord::new(100, None, "rpc down", "FIL");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn test_tx_status_codes() {
        assert_eq!(TxStatus::from_exit_code(0), TxStatus::Success);
        assert_eq!(TxStatus::from_exit_code(6), TxStatus::Failed);
        assert_eq!(TxStatus::Success.to_string(), "1");
        assert_eq!(TxStatus::Failed.to_string(), "0");
    }
}
