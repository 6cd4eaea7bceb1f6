//! CLI configuration management.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    /// Workflow file used when `--workflow` is not given.
    pub workflow_file: Option<PathBuf>,
    /// Directory finished runs are archived to.
    pub archive_dir: Option<PathBuf>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("dev", "ferrous-ci", "ferrous")
            .ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let optional_path = |value: &str| (!value.is_empty()).then(|| PathBuf::from(value));
        match key {
            "workflow_file" => self.workflow_file = optional_path(value),
            "archive_dir" => self.archive_dir = optional_path(value),
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => return Err(format!("Invalid log format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_known_keys() {
        let mut config = CliConfig::default();
        config.set("workflow_file", "ci/ferrous.yaml").unwrap();
        config.set("archive_dir", "/var/lib/ferrous/runs").unwrap();
        config.set("log_format", "json").unwrap();

        assert_eq!(config.workflow_file, Some(PathBuf::from("ci/ferrous.yaml")));
        assert_eq!(config.archive_dir, Some(PathBuf::from("/var/lib/ferrous/runs")));
        assert_eq!(config.log_format, LogFormat::Json);

        config.set("archive_dir", "").unwrap();
        assert_eq!(config.archive_dir, None);
    }

    #[test]
    fn test_set_rejects_unknown_values() {
        let mut config = CliConfig::default();
        assert!(config.set("log_format", "xml").is_err());
        assert!(config.set("api_url", "http://localhost").is_err());
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: CliConfig = serde_yaml::from_str("archive_dir: runs\n").unwrap();
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.workflow_file, None);
    }
}
