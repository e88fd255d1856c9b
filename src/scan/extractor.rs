//! Turns one raw transfer into per-source-key extracted data.

use std::{collections::BTreeMap, sync::Arc};

use log::{debug, error, warn};

use crate::{
    amount::{self, AmountError},
    models::{ExtractResult, Recharge, ScanTarget, Transaction, Transfer, TxExtractData},
    rpc::METHOD_SEND,
};

/// Host-supplied predicate: the source key of a watched address, `None` when
/// the address is not watched.
pub type ScanTargetFunc = Arc<dyn Fn(&ScanTarget) -> Option<String> + Send + Sync>;

pub(crate) const MISSING_TARGET_FUNC: &str = "scan target func is not set";

#[derive(Debug, Clone)]
pub struct TransactionExtractor {
    symbol: String,
    decimals: u32,
}

/// Display forms shared by both legs of a transfer.
struct Amounts {
    value: String,
    fees: String,
}

impl TransactionExtractor {
    pub fn new(symbol: &str, decimals: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            decimals,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Extracts the watched legs of `tx`. The transaction must already carry
    /// its block height, hash and timestamp.
    ///
    /// `success` is false when the predicate is missing or when an amount of a
    /// watched transfer cannot be converted; in both cases no data is returned.
    pub fn extract(&self, tx: &Transaction, target_func: Option<&ScanTargetFunc>) -> ExtractResult {
        let Some(target_func) = target_func else {
            error!(
                symbol = &*self.symbol,
                tx_id = &*tx.hash,
                height = tx.block_height;
                "Cannot extract transaction: scan target func is not set"
            );
            return self.failed(tx, MISSING_TARGET_FUNC.to_string());
        };

        let mut result = ExtractResult {
            txid: tx.hash.clone(),
            block_hash: tx.block_hash.clone(),
            block_height: tx.block_height,
            block_time: tx.timestamp,
            success: true,
            extract_data: BTreeMap::new(),
            failure: None,
        };

        if tx.method != METHOD_SEND {
            debug!(tx_id = &*tx.hash, method = tx.method; "Skipping non-transfer message");
            return result;
        }

        let from_key = target_func(&ScanTarget {
            address: tx.from.clone(),
            symbol: self.symbol.clone(),
        });
        let to_key = target_func(&ScanTarget {
            address: tx.to.clone(),
            symbol: self.symbol.clone(),
        });
        if from_key.is_none() && to_key.is_none() {
            return result;
        }

        let amounts = match self.amounts(tx) {
            Ok(amounts) => amounts,
            Err(e) => {
                warn!(
                    tx_id = &*tx.hash,
                    height = tx.block_height,
                    error:% = e;
                    "Failed to convert amounts of watched transfer"
                );
                return self.failed(tx, format!("amount conversion failed: {}", e));
            },
        };

        let transfer = self.transfer(tx, &amounts);
        let created_at = chrono::Utc::now().timestamp();
        let empty_entry = || TxExtractData {
            transaction: transfer.clone(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        };

        if let Some(key) = from_key {
            result
                .extract_data
                .entry(key)
                .or_insert_with(empty_entry)
                .inputs
                .push(Recharge {
                    sid: Recharge::input_sid(&tx.hash, &self.symbol, 0),
                    tx_id: tx.hash.clone(),
                    address: tx.from.clone(),
                    amount: amounts.value.clone(),
                    symbol: self.symbol.clone(),
                    block_hash: tx.block_hash.clone(),
                    block_height: tx.block_height,
                    index: 0,
                    created_at,
                });
        }
        if let Some(key) = to_key {
            result
                .extract_data
                .entry(key)
                .or_insert_with(empty_entry)
                .outputs
                .push(Recharge {
                    sid: Recharge::output_sid(&tx.hash, &self.symbol, 0),
                    tx_id: tx.hash.clone(),
                    address: tx.to.clone(),
                    amount: amounts.value.clone(),
                    symbol: self.symbol.clone(),
                    block_hash: tx.block_hash.clone(),
                    block_height: tx.block_height,
                    index: 0,
                    created_at,
                });
        }

        result
    }

    fn amounts(&self, tx: &Transaction) -> Result<Amounts, AmountError> {
        let value = amount::to_display(&tx.value, self.decimals)?;
        let fees = amount::format_units(&amount::fee(&tx.gas, &tx.gas_price)?, self.decimals);
        Ok(Amounts { value, fees })
    }

    fn transfer(&self, tx: &Transaction, amounts: &Amounts) -> Transfer {
        Transfer {
            wx_id: Transfer::wx_id_for(&tx.hash, &self.symbol),
            tx_id: tx.hash.clone(),
            symbol: self.symbol.clone(),
            from: vec![format!("{}:{}", tx.from, amounts.value)],
            to: vec![format!("{}:{}", tx.to, amounts.value)],
            amount: amounts.value.clone(),
            fees: amounts.fees.clone(),
            decimals: self.decimals,
            block_hash: tx.block_hash.clone(),
            block_height: tx.block_height,
            confirm_time: tx.timestamp,
            status: tx.status,
        }
    }

    fn failed(&self, tx: &Transaction, reason: String) -> ExtractResult {
        ExtractResult {
            block_hash: tx.block_hash.clone(),
            block_time: tx.timestamp,
            ..ExtractResult::failed(&tx.hash, tx.block_height, reason)
        }
    }
}
