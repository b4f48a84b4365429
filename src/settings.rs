use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Where this store's meta/data engines persist and where peers reach it.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageSettings {
    pub path: PathBuf,
    #[serde(default = "StorageSettings::default_max_apply_threads")]
    pub max_apply_threads: usize,
}

impl StorageSettings {
    fn default_max_apply_threads() -> usize {
        num_cpus::get().max(1)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RaftSettings {
    #[serde(default = "RaftSettings::default_election_tick")]
    pub election_tick: usize,
    #[serde(default = "RaftSettings::default_heartbeat_tick")]
    pub heartbeat_tick: usize,
    #[serde(default = "RaftSettings::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "RaftSettings::default_split_check_ticks")]
    pub split_check_ticks: u64,
}

impl RaftSettings {
    fn default_election_tick() -> usize {
        10
    }
    fn default_heartbeat_tick() -> usize {
        2
    }
    fn default_tick_interval_ms() -> u64 {
        100
    }
    fn default_split_check_ticks() -> u64 {
        100
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterSettings {
    #[serde(default)]
    pub enabled: bool,
    pub pd_first_free_id: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self { enabled: false, pd_first_free_id: 1000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub store_id: u64,
    #[serde(default = "Settings::default_log_level")]
    pub log_level: String,
    pub storage: StorageSettings,
    #[serde(default = "RaftSettings::default_for_settings")]
    pub raft: RaftSettings,
    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl RaftSettings {
    fn default_for_settings() -> RaftSettings {
        RaftSettings {
            election_tick: Self::default_election_tick(),
            heartbeat_tick: Self::default_heartbeat_tick(),
            tick_interval_ms: Self::default_tick_interval_ms(),
            split_check_ticks: Self::default_split_check_ticks(),
        }
    }
}

impl Settings {
    fn default_log_level() -> String {
        "INFO".to_string()
    }

    /// Layers, lowest to highest priority: built-in defaults, `config/config.yaml`
    /// if present, then `CELLSTORE__`-prefixed environment variables (double
    /// underscore separates nesting, e.g. `CELLSTORE__STORAGE__PATH`).
    pub fn new(config_path: Option<String>) -> Result<Self, SettingsError> {
        let config_path = config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let config = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("CELLSTORE").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_env() {
        std::env::set_var("CELLSTORE__STORE_ID", "7");
        std::env::set_var("CELLSTORE__STORAGE__PATH", "/tmp/cellstore-test");
        let settings = Settings::new(Some("/nonexistent/config.yaml".to_string())).unwrap();
        assert_eq!(settings.store_id, 7);
        assert_eq!(settings.raft.election_tick, 10);
        std::env::remove_var("CELLSTORE__STORE_ID");
        std::env::remove_var("CELLSTORE__STORAGE__PATH");
    }
}
