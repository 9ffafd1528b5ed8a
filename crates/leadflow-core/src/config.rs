use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LeadflowError, Result};

/// Top-level configuration for Leadflow.
///
/// Loaded from `~/.leadflow/config.toml` by default. Every section falls back
/// to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl LeadflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LeadflowConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or unparseable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LeadflowError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.leadflow/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Pipeline scheduling, timeout and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Length of one stage-offset unit in seconds. Stage offsets are 0, 5,
    /// 10, 15 and 20 units after lead creation.
    pub delay_unit_secs: u64,
    /// Upper bound on any single external collaborator call.
    pub stage_timeout_ms: u64,
    /// Attempts per stage before a transient failure is flagged.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Idle wake-up interval for picking up work scheduled by other processes.
    pub poll_interval_secs: u64,
    pub max_concurrent_stages: usize,
    /// Lifetime of a generated preview before it needs regenerating.
    pub preview_ttl_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delay_unit_secs: 60,
            stage_timeout_ms: 10_000,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            poll_interval_secs: 15,
            max_concurrent_stages: 16,
            preview_ttl_days: 14,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Engagement scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Length of each trend comparison window.
    pub trend_period_days: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            trend_period_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside `general.data_dir`.
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: "leadflow.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default_values() {
        let config = LeadflowConfig::default();

        assert_eq!(config.general.data_dir, "~/.leadflow/data");
        assert_eq!(config.general.log_level, "info");

        assert_eq!(config.pipeline.delay_unit_secs, 60);
        assert_eq!(config.pipeline.stage_timeout_ms, 10_000);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.backoff_base_ms, 2_000);
        assert_eq!(config.pipeline.backoff_max_ms, 60_000);
        assert_eq!(config.pipeline.poll_interval_secs, 15);
        assert_eq!(config.pipeline.max_concurrent_stages, 16);
        assert_eq!(config.pipeline.preview_ttl_days, 14);

        assert_eq!(config.scoring.trend_period_days, 7);
        assert_eq!(config.storage.db_file, "leadflow.db");
    }

    #[test]
    fn test_config_load_valid_toml() {
        let content = r#"
[general]
data_dir = "/tmp/leadflow-test"
log_level = "debug"

[pipeline]
delay_unit_secs = 1
stage_timeout_ms = 250
max_attempts = 5

[scoring]
trend_period_days = 14
"#;
        let file = create_temp_config(content);
        let config = LeadflowConfig::load(file.path()).unwrap();

        assert_eq!(config.general.data_dir, "/tmp/leadflow-test");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.pipeline.delay_unit_secs, 1);
        assert_eq!(config.pipeline.stage_timeout(), Duration::from_millis(250));
        assert_eq!(config.pipeline.max_attempts, 5);
        // Unspecified keys within a section keep their defaults.
        assert_eq!(config.pipeline.backoff_base_ms, 2_000);
        assert_eq!(config.scoring.trend_period_days, 14);
        assert_eq!(config.storage.db_file, "leadflow.db");
    }

    #[test]
    fn test_config_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = LeadflowConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "~/.leadflow/data");
        assert_eq!(config.pipeline.max_attempts, 3);
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        let result = LeadflowConfig::load(file.path());
        assert!(matches!(result, Err(LeadflowError::Config(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = LeadflowConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.leadflow/data");
    }

    #[test]
    fn test_config_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("dir").join("config.toml");

        let mut config = LeadflowConfig::default();
        config.pipeline.max_concurrent_stages = 4;
        config.save(&path).unwrap();

        assert!(path.exists());
        let reloaded = LeadflowConfig::load(&path).unwrap();
        assert_eq!(reloaded.general.log_level, "info");
        assert_eq!(reloaded.pipeline.max_concurrent_stages, 4);
    }
}
