//! Long-running scanner process.
//!
//! The [`Daemon`] wires the database, the Lotus client, the watch list and the
//! [`Scanner`] together from a [`ScannerConfig`], lets the scanner's driver
//! trigger a pass every `scan_interval_secs`, and shuts it down on Ctrl+C.
//!
//! # Usage Example
//!
//! ```ignore
//! let cfg = config::load_configuration(Path::new("config/config.toml"))?;
//! let daemon = Daemon::new(config::scanner_config(&cfg)?);
//! daemon.run().await?;
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::signal;

use crate::{
    config::ScannerConfig,
    db,
    rpc::LotusClient,
    scan::{LoggingObserver, Scanner, ScannerBuilder, WatchList},
};

pub struct Daemon {
    config: ScannerConfig,
    watch_list: WatchList,
}

impl Daemon {
    pub fn new(config: ScannerConfig) -> Self {
        let watch_list = WatchList::from_map(config.watch.clone());
        Self { config, watch_list }
    }

    /// Addresses can be added or removed while the daemon runs.
    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    /// Builds a scanner with the configured chain client, database and
    /// watch list. Nothing is started.
    pub fn build_scanner(&self) -> Result<Scanner> {
        let pool = db::init_db(&self.config.database_path)
            .with_context(|| format!("Could not open database {}", self.config.database_path.display()))?;
        let chain = LotusClient::with_config(
            &self.config.server_api,
            self.config.access_token.clone(),
            self.config.rpc_max_retries,
            Duration::from_secs(self.config.rpc_timeout_secs),
        )
        .context("Could not create Lotus client")?;

        info!(
            symbol = &*self.config.symbol,
            server_api = &*self.config.server_api,
            watched = self.watch_list.len();
            "Scanner configured"
        );
        if self.watch_list.is_empty() {
            warn!("No watched addresses configured, nothing will be delivered");
        }

        ScannerBuilder::new(Arc::new(chain), pool)
            .config(self.config.scan_config())
            .observer(Arc::new(LoggingObserver))
            .scan_target_func(self.watch_list.scan_target_func())
            .build()
            .map_err(|e| anyhow!("Could not build scanner: {}", e))
    }

    /// Runs until Ctrl+C or until the scanner stops on a fatal error.
    pub async fn run(&self) -> Result<()> {
        let scanner = self.build_scanner()?;
        scanner.run()?;
        info!("Daemon started. Press Ctrl+C to stop.");

        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error:% = e; "Failed to listen for Ctrl+C");
                }
                info!("Received shutdown signal, stopping scanner...");
            }
            _ = scanner.stopped() => {
                error!("Scanner stopped unexpectedly");
                return Err(anyhow!("Scanner stopped on a fatal error"));
            }
        }

        scanner.shutdown().await?;
        info!("Daemon stopped gracefully.");
        Ok(())
    }
}
