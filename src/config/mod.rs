mod defaults;
mod loader;

pub use defaults::ScannerConfig;
pub use loader::{get_default_config, load_configuration, scanner_config, write_config_to};
