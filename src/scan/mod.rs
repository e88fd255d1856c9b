//! Chain following: the scan loop, fork resolution, the concurrent extraction
//! pipeline and reconciliation of failed heights.

use thiserror::Error;

mod builder;
mod config;
mod dedup;
mod events;
mod extractor;
mod pipeline;
mod reorg;
mod retry;
mod scan_db_handler;
mod scanner;
mod targets;

#[cfg(test)]
pub(crate) mod test_utils;

pub use builder::ScannerBuilder;
pub use config::{
    DEFAULT_MAX_EXTRACTING_SIZE, DEFAULT_RETENTION_HEIGHTS, DEFAULT_SCAN_INTERVAL, ScanConfig,
};
pub use dedup::DeliveryLedger;
pub use events::{
    BlockScanObserver, ChannelObserver, LoggingObserver, ObserverError, ObserverRegistry, ScanNotification,
};
pub use extractor::{ScanTargetFunc, TransactionExtractor};
pub use pipeline::{BatchExtractor, BatchOutcome};
pub use retry::{ReconcileSummary, UNRECOVERABLE_TX_REASON};
pub use scan_db_handler::ScanDbHandler;
pub use scanner::{ScanPassSummary, Scanner, ScannerState};
pub use targets::WatchList;

use crate::{db::ScanDbError, rpc::RpcError};

/// Errors that can occur while scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    /// An unrecoverable error; the scanner stops.
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),

    /// A temporary error that may resolve on the next pass.
    #[error("Intermittent error: {0}")]
    Intermittent(String),

    #[error("Chain client error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Database execution error: {0}")]
    DbError(#[from] ScanDbError),

    /// The host wired the scanner incorrectly (e.g. no scan target function).
    /// Retrying does not help.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot {action} a scanner that is {from:?}")]
    InvalidTransition { from: ScannerState, action: &'static str },

    /// Some transactions of the block could not be extracted or delivered.
    /// They are recorded for reconciliation.
    #[error("Extraction failed for {failed} of {total} transactions at height {height}")]
    BatchFailed { height: u64, failed: usize, total: usize },
}
