//! Recovery configuration

use crate::HostPlatform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host platform used to pick platform-specific recovery paths
    pub host_platform: HostPlatform,
    /// Extension every synthesized module name must carry
    pub module_extension: String,
    /// Default tracing filter when `RUST_LOG` is not set
    pub log_filter: String,
    /// Output settings
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_platform: HostPlatform::current(),
            module_extension: ".dll".to_string(),
            log_filter: "info".to_string(),
            output: OutputConfig::default(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory the assembly models are written to
    pub directory: Option<PathBuf>,
    /// Pretty-print JSON output
    pub pretty: bool,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.host_platform = HostPlatform::Windows;
        config.output.pretty = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.host_platform, HostPlatform::Windows);
        assert!(loaded.output.pretty);
        assert_eq!(loaded.module_extension, ".dll");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{ "log_filter": "debug" }"#).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.module_extension, ".dll");
        assert!(config.output.directory.is_none());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(crate::Error::Config(_))));
    }
}
