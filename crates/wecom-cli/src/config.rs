//! Configuration loading.

use std::path::{Path, PathBuf};
use tracing::info;
use wecom_types::config::WecomConfig;
use wecom_types::error::{WecomError, WecomResult};

/// Load configuration from `path`, or the default location.
///
/// A missing file yields defaults. A file that exists but does not parse is
/// an error: serving with silently dropped accounts is worse than refusing
/// to start.
pub fn load_config(path: Option<&Path>) -> WecomResult<WecomConfig> {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return Ok(WecomConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)?;
    let config: WecomConfig = toml::from_str(&contents)
        .map_err(|e| WecomError::Config(format!("{}: {e}", config_path.display())))?;
    info!(
        path = %config_path.display(),
        accounts = config.accounts.len(),
        "Loaded configuration"
    );
    Ok(config)
}

/// `~/.wecom-bridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".wecom-bridge")
        .join("config.toml")
}
