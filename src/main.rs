use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use filscan::{
    cli::{ApplyArgs, Cli, Commands},
    config,
    daemon::Daemon,
    log::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let cfg = config::load_configuration(&cli.config)?;
    let mut scanner_config = config::scanner_config(&cfg)?;
    scanner_config.apply_node(&cli.node);
    scanner_config.apply_database(&cli.database);

    let daemon = Daemon::new(scanner_config);
    match cli.command {
        Commands::Daemon => daemon.run().await,
        Commands::ScanBlock { height } => {
            let scanner = daemon.build_scanner()?;
            scanner
                .scan_block(height)
                .await
                .with_context(|| format!("Could not scan height {}", height))?;
            info!(height = height; "Block scanned");
            Ok(())
        },
        Commands::SetRescanHeight { height } => {
            let scanner = daemon.build_scanner()?;
            scanner
                .set_rescan_block_height(height)
                .await
                .with_context(|| format!("Could not set rescan height {}", height))?;
            info!(height = height; "Next scan starts at this height");
            Ok(())
        },
    }
}
