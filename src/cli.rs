use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "filscan")]
#[command(about = "Filecoin block scanner", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        help = "Path to the configuration file",
        default_value = "config/config.toml"
    )]
    pub config: PathBuf,
    #[command(flatten)]
    pub node: NodeArgs,
    #[command(flatten)]
    pub database: DatabaseArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    #[arg(short = 'u', long, global = true, help = "Lotus JSON-RPC endpoint")]
    pub server_api: Option<String>,
    #[arg(long, global = true, help = "Bearer token for the Lotus endpoint")]
    pub access_token: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    #[arg(short, long, global = true, help = "Path to the scanner database file")]
    pub database_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan continuously until Ctrl+C
    Daemon,
    /// Extract a single height and notify it, without moving the scan cursor
    ScanBlock {
        #[arg(long, help = "Block height to scan")]
        height: u64,
    },
    /// Make the given height the next one the daemon scans
    SetRescanHeight {
        #[arg(long, help = "Block height to scan next")]
        height: u64,
    },
}

/// Command line values that override the configuration file.
pub trait ApplyArgs {
    fn apply_database(&mut self, args: &DatabaseArgs);
    fn apply_node(&mut self, args: &NodeArgs);
}
