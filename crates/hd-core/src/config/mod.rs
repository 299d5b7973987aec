//! Configuration management for hostdeck

mod daemon;
pub mod serde_utils;

pub use daemon::{DaemonConfig, EventsConfig, JobsConfig, SessionSettings};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostdeck")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file is missing
pub fn load_config_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        other => other,
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(
            load_config::<DaemonConfig>(&path),
            Err(ConfigError::NotFound(_))
        ));
        let config: DaemonConfig = load_config_or_default(&path).unwrap();
        assert_eq!(config.ipc_port, crate::ipc::DEFAULT_IPC_PORT);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DaemonConfig::default();
        config.ipc_port = 40123;
        config.auth_token = Some("secret".to_string());
        save_config(&path, &config).unwrap();

        let loaded: DaemonConfig = load_config(&path).unwrap();
        assert_eq!(loaded.ipc_port, 40123);
        assert_eq!(loaded.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "ipc_port = \"not a number\"").unwrap();

        assert!(matches!(
            load_config::<DaemonConfig>(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
