//! Observer notifications.
//!
//! Observers are invoked synchronously in registration order. A failing
//! [`BlockScanObserver::block_extract_data_notify`] never aborts a batch; the
//! pipeline turns it into a failed scan record instead.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! scanner.add_observer(Arc::new(ChannelObserver::new(tx)));
//!
//! while let Some(notification) = rx.recv().await {
//!     match notification {
//!         ScanNotification::NewBlock(header) if header.fork => println!("fork at {}", header.height),
//!         ScanNotification::NewBlock(header) => println!("block {}", header.height),
//!         ScanNotification::ExtractData { source_key, data } => println!("{} -> {}", source_key, data.transaction.tx_id),
//!     }
//! }
//! ```

use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::log::{mask_amount, mask_string};
use crate::models::{BlockHeader, TxExtractData};

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("Observer rejected notification: {0}")]
    Rejected(String),

    #[error("Observer channel closed")]
    ChannelClosed,
}

pub trait BlockScanObserver: Send + Sync {
    /// A block was accepted (`fork == false`) or invalidated by a fork (`fork == true`).
    fn block_scan_notify(&self, header: &BlockHeader);

    /// Extracted data for one watched source key.
    fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> Result<(), ObserverError>;
}

#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn BlockScanObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn BlockScanObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn BlockScanObserver>> {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn notify_block(&self, header: &BlockHeader) {
        for observer in self.snapshot() {
            observer.block_scan_notify(header);
        }
    }

    /// Delivers to every observer, even after one fails; returns the first failure.
    pub fn notify_extract_data(&self, source_key: &str, data: &TxExtractData) -> Result<(), ObserverError> {
        let mut first_error = None;
        for observer in self.snapshot() {
            if let Err(e) = observer.block_extract_data_notify(source_key, data) {
                warn!(
                    source_key = source_key,
                    tx_id = &*data.transaction.tx_id,
                    error:% = e;
                    "Observer failed to accept extracted data"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone)]
pub enum ScanNotification {
    NewBlock(BlockHeader),
    ExtractData { source_key: String, data: TxExtractData },
}

/// Forwards notifications into an unbounded channel.
#[derive(Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<ScanNotification>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<ScanNotification>) -> Self {
        Self { sender }
    }
}

impl BlockScanObserver for ChannelObserver {
    fn block_scan_notify(&self, header: &BlockHeader) {
        if self.sender.send(ScanNotification::NewBlock(header.clone())).is_err() {
            debug!(height = header.height; "Notification receiver dropped");
        }
    }

    fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> Result<(), ObserverError> {
        self.sender
            .send(ScanNotification::ExtractData {
                source_key: source_key.to_string(),
                data: data.clone(),
            })
            .map_err(|_| ObserverError::ChannelClosed)
    }
}

pub struct LoggingObserver;

impl BlockScanObserver for LoggingObserver {
    fn block_scan_notify(&self, header: &BlockHeader) {
        let time = chrono::DateTime::from_timestamp(header.time as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        if header.fork {
            warn!(
                symbol = &*header.symbol,
                height = header.height,
                hash = &*header.hash;
                "Block invalidated by fork"
            );
        } else {
            info!(
                symbol = &*header.symbol,
                height = header.height,
                hash = &*header.hash,
                time = &*time;
                "New block"
            );
        }
    }

    fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> Result<(), ObserverError> {
        for leg in data.inputs.iter().chain(data.outputs.iter()) {
            info!(
                source_key = source_key,
                tx_id = &*data.transaction.tx_id,
                address = &*mask_string(&leg.address),
                amount = &*mask_amount(&leg.amount);
                "Watched transfer"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::test_utils::{RecordingObserver, extract_data};

    #[test]
    fn test_registry_notifies_in_order_and_continues_after_failure() {
        let registry = ObserverRegistry::new();
        let first = Arc::new(RecordingObserver::failing_on(&["tx-1"]));
        let second = Arc::new(RecordingObserver::default());
        registry.add(first.clone());
        registry.add(second.clone());

        let data = extract_data("tx-1");
        assert!(registry.notify_extract_data("acct", &data).is_err());
        // The second observer still received it
        assert_eq!(second.delivered_tx_ids(), vec!["tx-1".to_string()]);
        assert!(first.delivered_tx_ids().is_empty());
    }

    #[tokio::test]
    async fn test_channel_observer_forwards_and_reports_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = ChannelObserver::new(tx);
        let data = extract_data("tx-9");
        observer.block_extract_data_notify("acct", &data).unwrap();
        match rx.recv().await {
            Some(ScanNotification::ExtractData { source_key, data }) => {
                assert_eq!(source_key, "acct");
                assert_eq!(data.transaction.tx_id, "tx-9");
            },
            other => panic!("unexpected notification: {:?}", other),
        }
        drop(rx);
        assert!(matches!(
            observer.block_extract_data_notify("acct", &data),
            Err(ObserverError::ChannelClosed)
        ));
    }
}
