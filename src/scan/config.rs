use std::time::Duration;

/// Capacity of the extraction token pool.
pub const DEFAULT_MAX_EXTRACTING_SIZE: usize = 20;

/// Period of the driver that triggers scan passes.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// How far below the newest scanned height delivery history and cached block
/// headers are kept (one day of 30 second epochs).
pub const DEFAULT_RETENTION_HEIGHTS: u64 = 2880;

pub const DEFAULT_DECIMALS: u32 = 18;

/// Runtime settings of one [`Scanner`](super::Scanner).
///
/// # Example
///
/// ```rust,ignore
/// let config = ScanConfig {
///     rescan_last_block_count: 3,
///     ..ScanConfig::new("FIL")
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Chain symbol; scopes the cursor, failed records and notifications.
    pub symbol: String,
    /// Decimal places between the smallest unit and the display unit.
    pub decimals: u32,
    pub scan_interval: Duration,
    /// Heights below the final cursor re-scanned after each pass.
    pub rescan_last_block_count: u64,
    pub max_extracting_size: usize,
    pub scan_mempool: bool,
    pub retention_heights: u64,
}

impl ScanConfig {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            symbol: "FIL".to_string(),
            decimals: DEFAULT_DECIMALS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            rescan_last_block_count: 0,
            max_extracting_size: DEFAULT_MAX_EXTRACTING_SIZE,
            scan_mempool: false,
            retention_heights: DEFAULT_RETENTION_HEIGHTS,
        }
    }
}
