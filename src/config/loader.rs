use std::{fs, fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use config::{Config, Environment};
use log::info;

use super::ScannerConfig;

pub fn get_default_config() -> &'static str {
    include_str!("../../config/config.toml")
}

/// Reads `path` (writing the default file first when it does not exist) and
/// layers `FILSCAN_*` environment variables on top, e.g.
/// `FILSCAN_SCANNER__SERVER_API`.
pub fn load_configuration(path: &Path) -> Result<Config> {
    if !path.exists() {
        write_config_to(path, get_default_config()).context("Could not create default config")?;
        info!(path:% = path.display(); "Created new configuration file");
    }

    let filename = path.to_str().context("Invalid config file path")?;

    Config::builder()
        .add_source(config::File::with_name(filename))
        .add_source(Environment::with_prefix("FILSCAN").prefix_separator("_").separator("__"))
        .build()
        .context("Could not build config")
}

/// The `[scanner]` section; missing keys take their defaults.
pub fn scanner_config(cfg: &Config) -> Result<ScannerConfig> {
    match cfg.get::<ScannerConfig>("scanner") {
        Ok(scanner) => Ok(scanner),
        Err(config::ConfigError::NotFound(_)) => Ok(ScannerConfig::default()),
        Err(e) => Err(e).context("Invalid [scanner] configuration"),
    }
}

pub fn write_config_to(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create parent directories")?;
    }

    let mut file = File::create(path).context("Failed to create config file")?;
    file.write_all(source.as_bytes())
        .context("Failed to write config content")?;
    file.write_all(b"\n").context("Failed to write newline")?;
    Ok(())
}
