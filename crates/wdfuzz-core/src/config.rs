//! Top-level fuzzer configuration, one section per subsystem.

use std::path::Path;

use serde::{Deserialize, Serialize};
use wdfuzz_explore::FuzzingConfig;
use wdfuzz_model::StateMapperConfig;
use wdfuzz_shm::ShmConfig;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Silence on the RX path before the watchdog fires.
    pub timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    pub transport: ShmConfig,
    pub state_mapper: StateMapperConfig,
    pub fuzzing: FuzzingConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

impl FuzzerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.transport.max_channels == 0 {
            problems.push("transport.max_channels must be at least 1".to_string());
        }
        if self.transport.buffer_size == 0 {
            problems.push("transport.buffer_size must be non-zero".to_string());
        }
        if self.watchdog.enabled && self.watchdog.timeout_ms == 0 {
            problems.push("watchdog.timeout_ms must be non-zero when enabled".to_string());
        }
        problems.extend(
            self.fuzzing
                .problems()
                .into_iter()
                .map(|p| format!("fuzzing: {p}")),
        );

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = FuzzerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, FuzzerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_parse() {
        let config = FuzzerConfig::from_json_str(
            r#"{
                "transport": { "max_channels": 2, "timeout_ms": 500 },
                "state_mapper": {
                    "mapping": [{
                        "layer_name": "RRC",
                        "filter": "rrc.type",
                        "state_name_field": ["rrc.missing", "rrc.type"]
                    }],
                    "initial_state": "TX / RRC / setup"
                },
                "fuzzing": { "enable_duplication": true, "iteration_trigger": "Release" },
                "watchdog": { "timeout_ms": 1000 },
                "logging": { "level": "debug", "json": true }
            }"#,
        )
        .unwrap();
        assert_eq!(config.transport.max_channels, 2);
        assert_eq!(config.transport.timeout_ms, Some(500));
        assert_eq!(config.state_mapper.mapping.len(), 1);
        assert!(config.fuzzing.enable_duplication);
        assert_eq!(config.fuzzing.iteration_trigger.as_deref(), Some("Release"));
        assert_eq!(config.watchdog.timeout_ms, 1000);
        assert!(config.watchdog.enabled);
        assert!(config.logging.json);
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = FuzzerConfig::default();
        config.transport.max_channels = 0;
        config.fuzzing.default_mutation_probability = 1.5;
        config.watchdog.timeout_ms = 0;

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("max_channels"));
        assert!(problems.iter().any(|p| p.starts_with("fuzzing:")));
    }

    #[test]
    fn test_unknown_json_is_a_parse_error() {
        assert!(matches!(
            FuzzerConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
