use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use tokio::sync::Semaphore;

use crate::{
    db::SqlitePool,
    rpc::ChainClient,
    scan::{
        BlockScanObserver, ObserverRegistry, ScanConfig, ScanError, ScanTargetFunc, Scanner, TransactionExtractor,
        dedup::DeliveryLedger, pipeline::BatchExtractor, scan_db_handler::ScanDbHandler,
    },
};

/// Builder for a [`Scanner`].
///
/// The chain client and database pool are required; everything else has a
/// default taken from [`ScanConfig::default`].
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tokio::sync::Semaphore;
///
/// // Two scanners drawing from one extraction token pool
/// let tokens = Arc::new(Semaphore::new(20));
///
/// let scanner = ScannerBuilder::new(chain, pool)
///     .config(ScanConfig::new("FIL"))
///     .rescan_last_block_count(2)
///     .token_pool(tokens.clone())
///     .observer(Arc::new(LoggingObserver))
///     .scan_target_func(watch_list.scan_target_func())
///     .build()?;
/// ```
pub struct ScannerBuilder {
    chain: Arc<dyn ChainClient>,
    pool: SqlitePool,
    config: ScanConfig,
    /// Shared token pool. A private pool of `max_extracting_size` tokens is
    /// created when unset.
    token_pool: Option<Arc<Semaphore>>,
    observers: Vec<Arc<dyn BlockScanObserver>>,
    target_func: Option<ScanTargetFunc>,
}

impl ScannerBuilder {
    pub fn new(chain: Arc<dyn ChainClient>, pool: SqlitePool) -> Self {
        Self {
            chain,
            pool,
            config: ScanConfig::default(),
            token_pool: None,
            observers: Vec::new(),
            target_func: None,
        }
    }

    pub fn config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.config.symbol = symbol.to_string();
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.config.scan_interval = interval;
        self
    }

    pub fn rescan_last_block_count(mut self, count: u64) -> Self {
        self.config.rescan_last_block_count = count;
        self
    }

    /// Capacity of the private extraction token pool.
    pub fn max_extracting_size(mut self, size: usize) -> Self {
        self.config.max_extracting_size = size;
        self
    }

    /// Uses an existing token pool instead of a private one, so several
    /// scanners can share extraction capacity.
    pub fn token_pool(mut self, tokens: Arc<Semaphore>) -> Self {
        self.token_pool = Some(tokens);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn BlockScanObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn scan_target_func(mut self, target_func: ScanTargetFunc) -> Self {
        self.target_func = Some(target_func);
        self
    }

    /// # Errors
    ///
    /// [`ScanError::Configuration`] for an empty symbol, a zero scan interval
    /// or an empty token pool.
    pub fn build(self) -> Result<Scanner, ScanError> {
        if self.config.symbol.trim().is_empty() {
            return Err(ScanError::Configuration("symbol must not be empty".to_string()));
        }
        if self.config.scan_interval.is_zero() {
            return Err(ScanError::Configuration("scan interval must be positive".to_string()));
        }

        let tokens = match self.token_pool {
            Some(tokens) => tokens,
            None if self.config.max_extracting_size == 0 => {
                return Err(ScanError::Configuration(
                    "max extracting size must be positive".to_string(),
                ));
            },
            None => Arc::new(Semaphore::new(self.config.max_extracting_size)),
        };
        if tokens.is_closed() {
            return Err(ScanError::Fatal(anyhow!("Extraction token pool is closed")));
        }

        let db = ScanDbHandler::new(self.pool);
        let observers = Arc::new(ObserverRegistry::new());
        for observer in self.observers {
            observers.add(observer);
        }
        let ledger = Arc::new(Mutex::new(DeliveryLedger::new()));
        let batch = BatchExtractor::new(
            TransactionExtractor::new(&self.config.symbol, self.config.decimals),
            tokens,
            observers.clone(),
            db.clone(),
            ledger.clone(),
        );

        Ok(Scanner::new(
            self.config,
            self.chain,
            db,
            observers,
            batch,
            ledger,
            self.target_func,
        ))
    }
}
