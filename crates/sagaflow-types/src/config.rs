//! Engine configuration types for sagaflow.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default, so a missing or partial file is
//! always valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the sagaflow engine.
///
/// Loaded from `<data_dir>/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub events: EventSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Executor worker-pool and timeout defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Maximum number of steps running at once across all instances.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Step timeout used when a step does not declare its own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Global timeout used when a definition does not declare its own.
    #[serde(default = "default_global_timeout_secs")]
    pub default_global_timeout_secs: u64,
}

fn default_max_parallel_steps() -> usize {
    8
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_global_timeout_secs() -> u64 {
    1800
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            default_step_timeout_secs: default_step_timeout_secs(),
            default_global_timeout_secs: default_global_timeout_secs(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSettings {
    /// Broadcast channel capacity; slow subscribers lag past this.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_parallel_steps, 8);
        assert_eq!(config.executor.default_step_timeout_secs, 300);
        assert_eq!(config.executor.default_global_timeout_secs, 1800);
        assert_eq!(config.events.channel_capacity, 1024);
        assert!(!config.logging.json);
        assert!(!config.logging.otel);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.executor.max_parallel_steps, 8);
        assert_eq!(config.events.channel_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_partial() {
        let toml_str = r#"
[executor]
max_parallel_steps = 2

[logging]
json = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.max_parallel_steps, 2);
        assert_eq!(config.executor.default_step_timeout_secs, 300);
        assert!(config.logging.json);
        assert!(!config.logging.otel);
    }
}
