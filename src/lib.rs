pub mod amount;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod db;
pub mod log;
pub mod models;
pub mod rpc;
pub mod scan;

pub use crate::db::init_db;
pub use crate::rpc::{ChainClient, LotusClient};
pub use crate::scan::{ScanError, Scanner, ScannerBuilder};
