use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::cli::{ApplyArgs, DatabaseArgs, NodeArgs};
use crate::rpc::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::scan::{DEFAULT_MAX_EXTRACTING_SIZE, DEFAULT_RETENTION_HEIGHTS, DEFAULT_SCAN_INTERVAL, ScanConfig};

/// The `[scanner]` section of the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub symbol: String,
    pub server_api: String,
    pub access_token: Option<String>,
    pub decimals: u32,
    pub database_path: PathBuf,
    pub scan_interval_secs: u64,
    pub rescan_last_block_count: u64,
    pub max_extracting_size: usize,
    pub scan_mempool: bool,
    pub rpc_timeout_secs: u64,
    pub rpc_max_retries: u32,
    pub dedup_retention_heights: u64,
    /// Watched address to source key.
    pub watch: HashMap<String, String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            symbol: "FIL".to_string(),
            server_api: "http://127.0.0.1:1234/rpc/v0".to_string(),
            access_token: None,
            decimals: 18,
            database_path: PathBuf::from("data/fil/scanner.db"),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL.as_secs(),
            rescan_last_block_count: 0,
            max_extracting_size: DEFAULT_MAX_EXTRACTING_SIZE,
            scan_mempool: false,
            rpc_timeout_secs: DEFAULT_TIMEOUT_SECS,
            rpc_max_retries: DEFAULT_MAX_RETRIES,
            dedup_retention_heights: DEFAULT_RETENTION_HEIGHTS,
            watch: HashMap::new(),
        }
    }
}

impl ScannerConfig {
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            rescan_last_block_count: self.rescan_last_block_count,
            max_extracting_size: self.max_extracting_size,
            scan_mempool: self.scan_mempool,
            retention_heights: self.dedup_retention_heights,
        }
    }
}

impl ApplyArgs for ScannerConfig {
    fn apply_database(&mut self, args: &DatabaseArgs) {
        if let Some(database_path) = &args.database_path {
            self.database_path = database_path.clone();
        }
    }

    fn apply_node(&mut self, args: &NodeArgs) {
        if let Some(server_api) = &args.server_api {
            self.server_api = server_api.clone();
        }
        if let Some(access_token) = &args.access_token {
            self.access_token = Some(access_token.clone());
        }
    }
}
