//! The scan loop and its lifecycle.
//!
//! A [`Scanner`] owns one background driver task that triggers a scan pass
//! every `scan_interval` while the scanner is [`ScannerState::Running`]. A
//! pass walks the chain one height at a time from the persisted cursor until
//! it catches up with the head, resolving forks on the way, then re-scans the
//! last few heights and reconciles failed records.
//!
//! # Example
//!
//! ```rust,ignore
//! let scanner = ScannerBuilder::new(chain, pool)
//!     .config(ScanConfig::new("FIL"))
//!     .observer(Arc::new(LoggingObserver))
//!     .scan_target_func(watch_list.scan_target_func())
//!     .build()?;
//!
//! scanner.run()?;
//! tokio::signal::ctrl_c().await?;
//! scanner.shutdown().await?;
//! ```

use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use super::{
    ScanError,
    config::ScanConfig,
    dedup::DeliveryLedger,
    events::{BlockScanObserver, ObserverRegistry},
    extractor::{MISSING_TARGET_FUNC, ScanTargetFunc},
    pipeline::BatchExtractor,
    retry::ReconcileSummary,
    scan_db_handler::ScanDbHandler,
};
use crate::{
    amount,
    models::{Balance, Block, BlockHeader, FailedScanRecord, ScanCursor},
    rpc::{ChainClient, RpcError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// What one scan pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPassSummary {
    pub start_height: u64,
    pub end_height: u64,
    pub blocks_scanned: u64,
    pub forks: u64,
    /// Accepted blocks with at least one transaction recorded as failed.
    pub failed_batches: u64,
    pub rescanned: u64,
    pub reconcile: ReconcileSummary,
}

pub(crate) struct ScannerInner {
    pub(super) config: ScanConfig,
    pub(super) chain: Arc<dyn ChainClient>,
    pub(super) db: ScanDbHandler,
    pub(super) observers: Arc<ObserverRegistry>,
    pub(super) ledger: Arc<Mutex<DeliveryLedger>>,
    pub(super) batch: BatchExtractor,
    target_func: RwLock<Option<ScanTargetFunc>>,
    state: watch::Sender<ScannerState>,
    /// Serializes passes with the manual operations that move the cursor.
    pass_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    pub(super) fn new(
        config: ScanConfig,
        chain: Arc<dyn ChainClient>,
        db: ScanDbHandler,
        observers: Arc<ObserverRegistry>,
        batch: BatchExtractor,
        ledger: Arc<Mutex<DeliveryLedger>>,
        target_func: Option<ScanTargetFunc>,
    ) -> Self {
        let (state, _) = watch::channel(ScannerState::Idle);
        Self {
            inner: Arc::new(ScannerInner {
                config,
                chain,
                db,
                observers,
                ledger,
                batch,
                target_func: RwLock::new(target_func),
                state,
                pass_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.inner.state()
    }

    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }

    pub fn db_handler(&self) -> &ScanDbHandler {
        &self.inner.db
    }

    /// Starts the periodic driver (from `Idle`) or resumes it (from `Paused`).
    /// Must be called inside a tokio runtime.
    pub fn run(&self) -> Result<(), ScanError> {
        let previous = self.inner.transition(
            "run",
            |s| matches!(s, ScannerState::Idle | ScannerState::Paused | ScannerState::Running),
            ScannerState::Running,
        )?;
        match previous {
            ScannerState::Idle => {
                info!(
                    symbol = &*self.inner.config.symbol,
                    interval_secs = self.inner.config.scan_interval.as_secs();
                    "Scanner started"
                );
                let handle = tokio::spawn(drive(self.inner.clone()));
                *self.inner.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            },
            ScannerState::Paused => self.inner.wake.notify_one(),
            _ => {},
        }
        Ok(())
    }

    /// Takes effect at the top of the next loop iteration; an in-flight block
    /// always finishes first.
    pub fn pause(&self) -> Result<(), ScanError> {
        self.inner.transition(
            "pause",
            |s| matches!(s, ScannerState::Running | ScannerState::Paused),
            ScannerState::Paused,
        )?;
        info!(symbol = &*self.inner.config.symbol; "Scanner paused");
        Ok(())
    }

    pub fn restart(&self) -> Result<(), ScanError> {
        self.inner
            .transition("restart", |s| s == ScannerState::Paused, ScannerState::Running)?;
        info!(symbol = &*self.inner.config.symbol; "Scanner restarted");
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ScanError> {
        self.inner.state.send_replace(ScannerState::Stopped);
        self.inner.shutdown.cancel();
        Ok(())
    }

    /// Stops the scanner and waits for the driver to finish its current block.
    pub async fn shutdown(&self) -> Result<(), ScanError> {
        self.stop()?;
        let handle = self.inner.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| ScanError::Fatal(anyhow!("Scanner driver panicked: {}", e)))?;
        }
        Ok(())
    }

    /// Resolves once the scanner reaches [`ScannerState::Stopped`], including
    /// after a fatal error inside the driver.
    pub async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ScannerState::Stopped).await;
    }

    pub fn add_observer(&self, observer: Arc<dyn BlockScanObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn set_block_scan_target_func(&self, target_func: ScanTargetFunc) {
        *self.inner.target_func.write().unwrap_or_else(|e| e.into_inner()) = Some(target_func);
    }

    /// One scan pass. Normally invoked by the driver.
    pub async fn scan_block_task(&self) -> Result<ScanPassSummary, ScanError> {
        self.inner.scan_block_task().await
    }

    /// Extracts the block at `height` and notifies it as a new block, without
    /// fork checks and without moving the cursor.
    pub async fn scan_block(&self, height: u64) -> Result<(), ScanError> {
        let _pass = self.inner.pass_lock.lock().await;
        let target_func = self.inner.require_target_func()?;
        let block = self.inner.scan_block_at(height, &target_func).await?;
        self.inner
            .observers
            .notify_block(&block.header(&self.inner.config.symbol, false));
        Ok(())
    }

    /// Makes `height` the next height to scan.
    pub async fn set_rescan_block_height(&self, height: u64) -> Result<(), ScanError> {
        if height == 0 {
            return Err(ScanError::Configuration(
                "block height to rescan must be greater than 0".to_string(),
            ));
        }
        let _pass = self.inner.pass_lock.lock().await;
        let symbol = self.inner.config.symbol.as_str();
        let cursor_height = height - 1;
        let block = self.inner.chain.get_block_by_height(cursor_height, false).await?;
        let cursor = ScanCursor {
            height: cursor_height,
            hash: block.hash,
        };

        self.inner.db.save_current_block_head(symbol, &cursor).await?;
        self.inner.db.delete_local_blocks_above(symbol, cursor_height).await?;
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget_from(height);
        info!(symbol = symbol, height = height; "Rescan height set");
        Ok(())
    }

    /// Header of the last scanned block. Before the first pass this is the
    /// block one below the chain head, as the first pass will start there.
    pub async fn get_scanned_block_header(&self) -> Result<BlockHeader, ScanError> {
        let symbol = self.inner.config.symbol.as_str();
        match self.inner.db.get_current_block_head(symbol).await? {
            Some(cursor) => Ok(match self.inner.db.get_local_block(symbol, cursor.height).await? {
                Some(local) if local.hash == cursor.hash => local.header(symbol, false),
                _ => BlockHeader {
                    hash: cursor.hash,
                    previous_hash: String::new(),
                    height: cursor.height,
                    time: 0,
                    fork: false,
                    symbol: symbol.to_string(),
                },
            }),
            None => {
                let block = self.inner.initial_block().await?;
                Ok(block.header(symbol, false))
            },
        }
    }

    /// Header of the chain head.
    pub async fn get_current_block_header(&self) -> Result<BlockHeader, ScanError> {
        let max_height = self.inner.chain.get_max_height().await?;
        let block = self.inner.chain.get_block_by_height(max_height, false).await?;
        Ok(block.header(&self.inner.config.symbol, false))
    }

    /// 0 when nothing was scanned yet.
    pub async fn get_scanned_block_height(&self) -> Result<u64, ScanError> {
        Ok(self
            .inner
            .db
            .get_current_block_head(&self.inner.config.symbol)
            .await?
            .map_or(0, |cursor| cursor.height))
    }

    pub fn scan_tx_mempool(&self) {
        self.inner.scan_tx_mempool();
    }

    /// Current balances of `addresses`, in display units.
    pub async fn get_balance_by_address(&self, addresses: &[&str]) -> Result<Vec<Balance>, ScanError> {
        let mut balances = Vec::with_capacity(addresses.len());
        for address in addresses {
            let on_chain = self.inner.chain.get_address_balance(address).await?;
            let balance = amount::to_display(&on_chain.balance, self.inner.config.decimals)
                .map_err(|e| RpcError::Malformed(format!("balance of {}: {}", address, e)))?;
            balances.push(Balance {
                symbol: self.inner.config.symbol.clone(),
                address: on_chain.address,
                balance,
            });
        }
        Ok(balances)
    }
}

async fn drive(inner: Arc<ScannerInner>) {
    let mut interval = tokio::time::interval(inner.config.scan_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {},
            _ = inner.wake.notified() => {},
        }
        if inner.state() != ScannerState::Running {
            continue;
        }

        match inner.scan_block_task().await {
            Ok(summary) => {
                info!(
                    symbol = &*inner.config.symbol,
                    from = summary.start_height,
                    to = summary.end_height,
                    blocks = summary.blocks_scanned,
                    forks = summary.forks;
                    "Scan pass finished"
                );
            },
            Err(e @ ScanError::Configuration(_)) => {
                error!(error:% = e; "Scanner misconfigured, pausing until restarted");
                inner.state.send_if_modified(|state| {
                    let running = *state == ScannerState::Running;
                    if running {
                        *state = ScannerState::Paused;
                    }
                    running
                });
            },
            Err(e @ ScanError::Fatal(_)) => {
                error!(error:% = e; "A fatal error occurred during the scan pass");
                inner.state.send_replace(ScannerState::Stopped);
                inner.shutdown.cancel();
                break;
            },
            Err(ScanError::DbError(e)) => {
                error!(error:% = e; "A DB error occurred during the scan pass");
            },
            Err(e) => {
                warn!(error:% = e; "Scan pass failed, will retry after interval");
            },
        }
    }
    info!(symbol = &*inner.config.symbol; "Scanner stopped");
}

impl ScannerInner {
    pub(super) fn state(&self) -> ScannerState {
        *self.state.borrow()
    }

    /// Moves to `to` when `allowed` accepts the current state; returns the
    /// previous state.
    fn transition(
        &self,
        action: &'static str,
        allowed: impl FnOnce(ScannerState) -> bool,
        to: ScannerState,
    ) -> Result<ScannerState, ScanError> {
        let mut outcome = Err(ScanError::InvalidTransition {
            from: ScannerState::Stopped,
            action,
        });
        self.state.send_if_modified(|state| {
            let from = *state;
            if allowed(from) {
                outcome = Ok(from);
                *state = to;
                from != to
            } else {
                outcome = Err(ScanError::InvalidTransition { from, action });
                false
            }
        });
        outcome
    }

    /// Pause and stop are honoured between blocks only.
    fn interrupted(&self) -> bool {
        matches!(self.state(), ScannerState::Paused | ScannerState::Stopped)
    }

    fn require_target_func(&self) -> Result<ScanTargetFunc, ScanError> {
        self.target_func
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                error!(symbol = &*self.config.symbol; "Scan target func is not set, nothing can be extracted");
                ScanError::Configuration(MISSING_TARGET_FUNC.to_string())
            })
    }

    pub(super) async fn scan_block_task(&self) -> Result<ScanPassSummary, ScanError> {
        let _pass = self.pass_lock.lock().await;
        let target_func = self.require_target_func()?;
        let symbol = self.config.symbol.as_str();

        let mut cursor = self.load_cursor().await?;
        let mut summary = ScanPassSummary {
            start_height: cursor.height,
            ..Default::default()
        };

        loop {
            if self.interrupted() {
                info!(symbol = symbol, height = cursor.height; "Scan pass interrupted");
                break;
            }

            let max_height = match self.chain.get_max_height().await {
                Ok(height) => height,
                Err(e) => {
                    warn!(error:% = e; "Cannot get chain head height");
                    break;
                },
            };
            if cursor.height >= max_height {
                debug!(symbol = symbol, height = max_height; "Scanned full chain data");
                break;
            }

            let block = match self.fetch_next_block(cursor.height + 1, max_height).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(height = cursor.height + 1, error:% = e; "Cannot get next block");
                    self.record_height_failure(cursor.height + 1, &e).await;
                    break;
                },
            };

            if block.previous_hash != cursor.hash {
                cursor = self.resolve_fork(&cursor, &block).await?;
                summary.forks += 1;
                continue;
            }

            if !self.accept_block(&block, &target_func).await? {
                summary.failed_batches += 1;
            }
            summary.blocks_scanned += 1;
            cursor = ScanCursor {
                height: block.height,
                hash: block.hash,
            };
        }
        summary.end_height = cursor.height;

        let rescan_from = cursor.height.saturating_sub(self.config.rescan_last_block_count);
        for height in rescan_from..cursor.height {
            if self.scan_block_at(height, &target_func).await.is_ok() {
                summary.rescanned += 1;
            }
        }

        if self.config.scan_mempool {
            self.scan_tx_mempool();
        }

        summary.reconcile = self.rescan_failed_records(&target_func).await?;
        self.prune_history(cursor.height).await;
        Ok(summary)
    }

    /// Persisted cursor, or a fresh one one below the chain head.
    async fn load_cursor(&self) -> Result<ScanCursor, ScanError> {
        let symbol = self.config.symbol.as_str();
        if let Some(cursor) = self.db.get_current_block_head(symbol).await? {
            return Ok(cursor);
        }

        let block = self.initial_block().await?;
        let cursor = ScanCursor {
            height: block.height,
            hash: block.hash.clone(),
        };
        self.db.save_current_block_head(symbol, &cursor).await?;
        self.db.save_local_block(symbol, block.to_local()).await?;
        info!(symbol = symbol, height = cursor.height, hash = &*cursor.hash; "Scan cursor initialized");
        Ok(cursor)
    }

    async fn initial_block(&self) -> Result<Block, ScanError> {
        let max_height = self.chain.get_max_height().await?;
        Ok(self
            .chain
            .get_block_by_height(max_height.saturating_sub(1), false)
            .await?)
    }

    /// Block at `next`, stepping over null rounds for which the node answers
    /// with an earlier block.
    async fn fetch_next_block(&self, next: u64, max_height: u64) -> Result<Block, ScanError> {
        let mut height = next;
        loop {
            if height > max_height {
                return Err(ScanError::Intermittent(format!(
                    "no block between heights {} and {}",
                    next, max_height
                )));
            }
            info!(height = height; "Scanning height");
            let block = self.chain.get_block_by_height(height, true).await?;
            if block.height >= height {
                return Ok(block);
            }
            info!(height = height, returned = block.height; "Height is a null round, trying the next one");
            height += 1;
        }
    }

    /// Extracts, persists and announces a block extending the cursor. Returns
    /// false when some transactions were recorded as failed.
    async fn accept_block(&self, block: &Block, target_func: &ScanTargetFunc) -> Result<bool, ScanError> {
        let symbol = self.config.symbol.as_str();
        let complete = self.extract_block(block, target_func).await?;

        let cursor = ScanCursor {
            height: block.height,
            hash: block.hash.clone(),
        };
        self.db.save_current_block_head(symbol, &cursor).await?;
        self.db.save_local_block(symbol, block.to_local()).await?;
        self.observers.notify_block(&block.header(symbol, false));
        Ok(complete)
    }

    /// Runs the pipeline over the block's transactions. Failures other than
    /// per-transaction ones are recorded against the whole height, and
    /// transfers without a receipt are recorded one by one.
    async fn extract_block(&self, block: &Block, target_func: &ScanTargetFunc) -> Result<bool, ScanError> {
        let resolved = self.record_unresolved(block).await;
        match self
            .batch
            .extract_batch(block.height, &block.transactions, Some(target_func.clone()))
            .await
        {
            Ok(_) => Ok(resolved),
            Err(e @ ScanError::BatchFailed { .. }) => {
                warn!(height = block.height, error:% = e; "Block extracted with failures");
                Ok(false)
            },
            Err(e @ ScanError::Fatal(_)) => Err(e),
            Err(e) => {
                warn!(height = block.height, error:% = e; "Block extraction failed");
                self.record_height_failure(block.height, &e).await;
                Ok(false)
            },
        }
    }

    /// Fetch and extract `height` outside the fork-aware loop. A fetch failure
    /// is recorded for reconciliation.
    pub(super) async fn scan_block_at(&self, height: u64, target_func: &ScanTargetFunc) -> Result<Block, ScanError> {
        let block = match self.chain.get_block_by_height(height, true).await {
            Ok(block) => block,
            Err(e) => {
                warn!(height = height, error:% = e; "Cannot get block data");
                let e = ScanError::from(e);
                self.record_height_failure(height, &e).await;
                return Err(e);
            },
        };
        info!(height = block.height; "Rescanning block");
        self.extract_block(&block, target_func).await?;
        Ok(block)
    }

    async fn record_height_failure(&self, height: u64, e: &ScanError) {
        let record = FailedScanRecord::new(height, None, e.to_string(), &self.config.symbol);
        if let Err(e) = self.db.save_unscan_record(&record).await {
            error!(height = height, error:% = e; "Failed to save unscan record");
        }
    }

    /// Records every transfer of `block` whose receipt is missing. Returns
    /// true when there was none.
    pub(super) async fn record_unresolved(&self, block: &Block) -> bool {
        for unresolved in &block.unresolved {
            let record = FailedScanRecord::new(
                block.height,
                Some(&unresolved.tx_id),
                unresolved.reason.as_str(),
                &self.config.symbol,
            );
            if let Err(e) = self.db.save_unscan_record(&record).await {
                error!(height = block.height, tx_id = &*unresolved.tx_id, error:% = e; "Failed to save unscan record");
            }
        }
        block.unresolved.is_empty()
    }

    fn scan_tx_mempool(&self) {
        info!(symbol = &*self.config.symbol; "Scanning mempool");
    }

    async fn prune_history(&self, newest_height: u64) {
        let floor = newest_height.saturating_sub(self.config.retention_heights);
        if floor == 0 {
            return;
        }
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).prune_below(floor);
        match self.db.prune_local_blocks_below(&self.config.symbol, floor).await {
            Ok(pruned) if pruned > 0 => debug!(below = floor, pruned = pruned; "Pruned cached blocks"),
            Ok(_) => {},
            Err(e) => warn!(error:% = e; "Failed to prune cached blocks"),
        }
    }
}
