//! Reconciliation of heights recorded as failed.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use super::{ScanError, extractor::ScanTargetFunc, scanner::ScannerInner};

/// Node answer for a message it has never seen; such records are never
/// recoverable.
pub const UNRECOVERABLE_TX_REASON: &str = "No information available about transaction";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub heights_retried: usize,
    pub heights_recovered: usize,
    pub records_purged: usize,
}

impl ScannerInner {
    /// Re-extracts every height that has failed records and clears the
    /// records of the heights that now succeed. Height 0 is never retried.
    /// Records of transfers the node knows nothing about are purged last.
    pub(super) async fn rescan_failed_records(
        &self,
        target_func: &ScanTargetFunc,
    ) -> Result<ReconcileSummary, ScanError> {
        let symbol = self.config.symbol.as_str();
        let mut summary = ReconcileSummary::default();

        let mut by_height: BTreeMap<u64, usize> = BTreeMap::new();
        for record in self.db.get_unscan_records(symbol).await? {
            *by_height.entry(record.height).or_default() += 1;
        }

        for (height, records) in by_height {
            if height == 0 {
                continue;
            }
            summary.heights_retried += 1;
            info!(height = height, records = records; "Rescanning failed height");

            let block = match self.chain.get_block_by_height(height, true).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(height = height, error:% = e; "Failed height still unavailable");
                    continue;
                },
            };

            if block.height != height {
                debug!(height = height, returned = block.height; "Failed height is a null round");
            } else if let Err(e) = self
                .batch
                .extract_batch(height, &block.transactions, Some(target_func.clone()))
                .await
            {
                warn!(height = height, error:% = e; "Failed height still does not extract");
                continue;
            }

            self.db.delete_unscan_records_by_height(height, symbol).await?;
            // Transfers still lacking a receipt keep their records
            if self.record_unresolved(&block).await {
                summary.heights_recovered += 1;
            }
        }

        summary.records_purged = self.purge_unrecoverable_records().await?;
        Ok(summary)
    }

    pub(super) async fn purge_unrecoverable_records(&self) -> Result<usize, ScanError> {
        let symbol = self.config.symbol.as_str();
        let mut purged = 0;
        for record in self.db.get_unscan_records(symbol).await? {
            if record.reason.contains(UNRECOVERABLE_TX_REASON) {
                purged += self.db.delete_unscan_record_by_id(&record.id, symbol).await?;
            }
        }
        if purged > 0 {
            info!(purged = purged; "Purged unrecoverable unscan records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db;
    use crate::models::{FailedScanRecord, ScanCursor};
    use crate::scan::{
        ScannerBuilder,
        test_utils::{MockChain, RecordingObserver, block_hash, transfer, watching},
    };

    #[tokio::test]
    async fn test_reconciliation_recovers_and_purges() {
        let (_dir, pool) = db::test_pool();
        let chain = MockChain::linear(20);
        chain.set_transactions(10, vec![transfer("tx-10", "f1sender", "f1watched", 3, 10)]);
        chain.fail_height(12);
        let observer = Arc::new(RecordingObserver::default());
        let scanner = ScannerBuilder::new(chain.clone(), pool)
            .observer(observer.clone())
            .scan_target_func(watching(&[("f1watched", "acct")]))
            .build()
            .unwrap();

        let db = scanner.db_handler();
        db.save_current_block_head(
            "FIL",
            &ScanCursor {
                height: 20,
                hash: block_hash(20, 0),
            },
        )
        .await
        .unwrap();
        for record in [
            FailedScanRecord::new(10, Some("tx-10"), "observer rejected extracted data", "FIL"),
            FailedScanRecord::new(12, None, "[1]tipset at 12 unavailable", "FIL"),
            FailedScanRecord::new(0, None, "sentinel", "FIL"),
            FailedScanRecord::new(
                0,
                Some("bafy-gone"),
                format!("[-5]{}", UNRECOVERABLE_TX_REASON),
                "FIL",
            ),
        ] {
            db.save_unscan_record(&record).await.unwrap();
        }

        let summary = scanner.scan_block_task().await.unwrap();
        assert_eq!(
            summary.reconcile,
            ReconcileSummary {
                heights_retried: 2,
                heights_recovered: 1,
                records_purged: 1,
            }
        );
        assert_eq!(observer.delivered_tx_ids(), vec!["tx-10".to_string()]);

        let mut remaining: Vec<_> = db
            .get_unscan_records("FIL")
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.height, r.reason))
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![(0, "sentinel".to_string()), (12, "[1]tipset at 12 unavailable".to_string())]
        );

        // Once the node serves the height again the record goes away
        chain.heal_height(12);
        let summary = scanner.scan_block_task().await.unwrap();
        assert_eq!(summary.reconcile.heights_recovered, 1);
        assert_eq!(db.get_unscan_records("FIL").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_null_round_height_clears_its_records() {
        let (_dir, pool) = db::test_pool();
        let chain = MockChain::linear(10);
        chain.make_null_round(8);
        let observer = Arc::new(RecordingObserver::default());
        let scanner = ScannerBuilder::new(chain.clone(), pool)
            .observer(observer.clone())
            .scan_target_func(watching(&[("f1watched", "acct")]))
            .build()
            .unwrap();

        let db = scanner.db_handler();
        db.save_current_block_head(
            "FIL",
            &ScanCursor {
                height: 10,
                hash: block_hash(10, 0),
            },
        )
        .await
        .unwrap();
        db.save_unscan_record(&FailedScanRecord::new(8, None, "[1]tipset at 8 unavailable", "FIL"))
            .await
            .unwrap();

        let summary = scanner.scan_block_task().await.unwrap();
        assert_eq!(summary.reconcile.heights_retried, 1);
        assert_eq!(summary.reconcile.heights_recovered, 1);
        assert!(db.get_unscan_records("FIL").await.unwrap().is_empty());
        assert!(chain.requests().contains(&8));
        assert!(observer.delivered_tx_ids().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_without_receipt_keeps_its_record() {
        let (_dir, pool) = db::test_pool();
        let chain = MockChain::linear(10);
        chain.set_transactions(
            9,
            vec![
                transfer("tx-ok", "f1sender", "f1watched", 1, 9),
                transfer("tx-pending", "f1sender", "f1watched", 2, 9),
            ],
        );
        chain.miss_receipt(9, "tx-pending", "block has no receipt yet: tx-pending");
        let observer = Arc::new(RecordingObserver::default());
        let scanner = ScannerBuilder::new(chain.clone(), pool)
            .observer(observer.clone())
            .scan_target_func(watching(&[("f1watched", "acct")]))
            .build()
            .unwrap();

        let db = scanner.db_handler();
        db.save_current_block_head(
            "FIL",
            &ScanCursor {
                height: 10,
                hash: block_hash(10, 0),
            },
        )
        .await
        .unwrap();
        db.save_unscan_record(&FailedScanRecord::new(9, Some("tx-ok"), "observer rejected extracted data", "FIL"))
            .await
            .unwrap();

        let summary = scanner.scan_block_task().await.unwrap();
        assert_eq!(summary.reconcile.heights_retried, 1);
        assert_eq!(summary.reconcile.heights_recovered, 0);
        assert_eq!(observer.delivered_tx_ids(), vec!["tx-ok".to_string()]);

        let records = db.get_unscan_records("FIL").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].height, 9);
        assert_eq!(records[0].tx_id.as_deref(), Some("tx-pending"));
    }
}
