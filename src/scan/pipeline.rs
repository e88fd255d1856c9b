//! Bounded-concurrency extraction of one block's transactions.
//!
//! Every transaction takes a token from the scanner's pool before its
//! extraction is dispatched to the blocking pool, so the dispatch loop stalls
//! when the pool is exhausted. A single collector task consumes the results,
//! notifies observers, records failures and reports back through a one-shot
//! channel once all `N` results are accounted for.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::sync::{Semaphore, mpsc, oneshot};

use super::{
    ScanError,
    dedup::DeliveryLedger,
    events::ObserverRegistry,
    extractor::{ScanTargetFunc, TransactionExtractor},
    scan_db_handler::ScanDbHandler,
};
use crate::models::{ExtractResult, FailedScanRecord, Transaction};

/// Counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Transactions dispatched for extraction.
    pub total: usize,
    /// Transactions whose watched legs reached every observer.
    pub delivered: usize,
    pub failed: usize,
    /// Duplicates and already delivered transactions that were not dispatched.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct CollectorReport {
    delivered: usize,
    failed: usize,
}

#[derive(Clone)]
pub struct BatchExtractor {
    extractor: TransactionExtractor,
    tokens: Arc<Semaphore>,
    observers: Arc<ObserverRegistry>,
    db: ScanDbHandler,
    ledger: Arc<Mutex<DeliveryLedger>>,
}

impl BatchExtractor {
    pub fn new(
        extractor: TransactionExtractor,
        tokens: Arc<Semaphore>,
        observers: Arc<ObserverRegistry>,
        db: ScanDbHandler,
        ledger: Arc<Mutex<DeliveryLedger>>,
    ) -> Self {
        Self {
            extractor,
            tokens,
            observers,
            db,
            ledger,
        }
    }

    pub fn symbol(&self) -> &str {
        self.extractor.symbol()
    }

    /// Extracts and delivers every transaction of the block at `height`.
    ///
    /// All transactions are attempted even when some fail. Returns
    /// [`ScanError::BatchFailed`] when at least one of them could not be
    /// extracted or delivered; each failure is stored as a [`FailedScanRecord`].
    pub async fn extract_batch(
        &self,
        height: u64,
        transactions: &[Transaction],
        target_func: Option<ScanTargetFunc>,
    ) -> Result<BatchOutcome, ScanError> {
        let (pending, skipped) = self.pending_transactions(transactions);
        let total = pending.len();
        if total == 0 {
            debug!(height = height, skipped = skipped; "Nothing to extract");
            return Ok(BatchOutcome {
                skipped,
                ..Default::default()
            });
        }

        let sender_keys: HashMap<String, String> = pending
            .iter()
            .map(|tx| (tx.hash.clone(), tx.sender_nonce_key()))
            .collect();

        // Capacity `total` so workers never wait on the collector.
        let (result_tx, result_rx) = mpsc::channel::<ExtractResult>(total);
        let (done_tx, done_rx) = oneshot::channel::<CollectorReport>();

        let collector = Collector {
            height,
            symbol: self.symbol().to_string(),
            observers: self.observers.clone(),
            db: self.db.clone(),
            ledger: self.ledger.clone(),
            sender_keys,
        };
        tokio::spawn(async move {
            let report = collector.run(result_rx, total).await;
            let _ = done_tx.send(report);
        });

        for tx in pending {
            let permit = self
                .tokens
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ScanError::Fatal(anyhow!("Extraction token pool is closed")))?;
            let extractor = self.extractor.clone();
            let target_func = target_func.clone();
            let result_tx = result_tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = extractor.extract(&tx, target_func.as_ref());
                drop(permit);
                if result_tx.blocking_send(result).is_err() {
                    warn!(tx_id = &*tx.hash; "Extraction result dropped: collector is gone");
                }
            });
        }
        drop(result_tx);

        let report = done_rx
            .await
            .map_err(|_| ScanError::Intermittent(format!("Collector for height {} ended without report", height)))?;

        let outcome = BatchOutcome {
            total,
            delivered: report.delivered,
            failed: report.failed,
            skipped,
        };
        if outcome.failed > 0 {
            return Err(ScanError::BatchFailed {
                height,
                failed: outcome.failed,
                total,
            });
        }

        info!(
            height = height,
            total = total,
            delivered = outcome.delivered,
            skipped = skipped;
            "Block transactions extracted"
        );
        Ok(outcome)
    }

    /// Drops duplicates within the batch and transactions already delivered.
    fn pending_transactions(&self, transactions: &[Transaction]) -> (Vec<Transaction>, usize) {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen_hashes = HashSet::new();
        let mut seen_senders = HashSet::new();
        let mut pending = Vec::with_capacity(transactions.len());
        let mut skipped = 0;

        for tx in transactions {
            let fresh_hash = seen_hashes.insert(tx.hash.clone());
            let fresh_sender = seen_senders.insert(tx.sender_nonce_key());
            if !fresh_hash || !fresh_sender || ledger.is_delivered(tx) {
                debug!(tx_id = &*tx.hash, nonce = tx.nonce; "Skipping duplicate or delivered transaction");
                skipped += 1;
                continue;
            }
            pending.push(tx.clone());
        }
        (pending, skipped)
    }
}

struct Collector {
    height: u64,
    symbol: String,
    observers: Arc<ObserverRegistry>,
    db: ScanDbHandler,
    ledger: Arc<Mutex<DeliveryLedger>>,
    sender_keys: HashMap<String, String>,
}

impl Collector {
    async fn run(self, mut results: mpsc::Receiver<ExtractResult>, expected: usize) -> CollectorReport {
        let mut report = CollectorReport::default();
        let mut received = 0;

        while received < expected {
            let Some(result) = results.recv().await else {
                break;
            };
            received += 1;
            self.handle(result, &mut report).await;
        }

        // A worker that died without reporting still counts.
        if received < expected {
            let missing = expected - received;
            error!(height = self.height, missing = missing; "Extraction tasks ended without a result");
            report.failed += missing;
            self.record_failure(None, format!("{} extraction tasks ended without a result", missing))
                .await;
        }
        report
    }

    async fn handle(&self, result: ExtractResult, report: &mut CollectorReport) {
        if !result.success {
            report.failed += 1;
            let reason = result.failure.unwrap_or_else(|| "extraction failed".to_string());
            self.record_failure(Some(&result.txid), reason).await;
            return;
        }
        if result.extract_data.is_empty() {
            return;
        }

        let mut rejected = None;
        for (source_key, data) in &result.extract_data {
            if let Err(e) = self.observers.notify_extract_data(source_key, data) {
                rejected.get_or_insert(e);
            }
        }

        match rejected {
            Some(e) => {
                report.failed += 1;
                self.record_failure(Some(&result.txid), format!("observer rejected extracted data: {}", e))
                    .await;
            },
            None => {
                report.delivered += 1;
                let sender_key = self.sender_keys.get(&result.txid).cloned().unwrap_or_default();
                self.ledger
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .mark_delivered(&result.txid, &sender_key, self.height);
            },
        }
    }

    async fn record_failure(&self, tx_id: Option<&str>, reason: String) {
        let record = FailedScanRecord::new(self.height, tx_id, reason, &self.symbol);
        if let Err(e) = self.db.save_unscan_record(&record).await {
            error!(
                height = self.height,
                tx_id = tx_id.unwrap_or_default(),
                error:% = e;
                "Failed to save unscan record"
            );
        }
    }
}
