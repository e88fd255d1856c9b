//! Chain access.
//!
//! The scanner only talks to the chain through [`ChainClient`]; [`LotusClient`]
//! is the production implementation over Lotus JSON-RPC.

use async_trait::async_trait;

mod error;
mod http_client;
mod lotus_client;
mod types;

pub use error::RpcError;
pub use http_client::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};
pub use lotus_client::{LotusClient, METHOD_SEND};

use crate::models::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// 0 means the message executed successfully.
    pub exit_code: i64,
    pub gas_used: i64,
}

/// On-chain state of an account, amounts in the smallest unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBalance {
    pub address: String,
    pub balance: String,
    pub nonce: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Height of the current chain head.
    async fn get_max_height(&self) -> Result<u64, RpcError>;

    /// The block at `height`. On a null round the node may return the closest
    /// earlier block, so callers must check the returned height.
    async fn get_block_by_height(&self, height: u64, include_transactions: bool) -> Result<Block, RpcError>;

    /// Block header (no transactions) for a previously observed block hash.
    async fn get_block_by_hash(&self, hash: &str) -> Result<Block, RpcError>;

    /// Any error means the receipt is not available yet.
    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, RpcError>;

    /// An address without an actor on chain has a zero balance.
    async fn get_address_balance(&self, address: &str) -> Result<AddressBalance, RpcError>;
}
