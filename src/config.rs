//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/sequencer.toml`)
//! 2. environment variables prefixed with `LABSEQ_`
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! LABSEQ_APPLICATION__LOG_LEVEL=debug
//! LABSEQ_ENGINE__ABORT_TIMEOUT=10s
//! LABSEQ_INSTRUMENTS__DEBUG_FALLBACK=true
//! ```
//!
//! Every section has defaults, so an empty or missing file is a valid
//! configuration.
//!
//! # Example
//!
//! ```no_run
//! use lab_sequencer::config::SequencerConfig;
//!
//! let config = SequencerConfig::load_from("config/sequencer.toml")?;
//! println!("Abort timeout: {:?}", config.engine.abort_timeout);
//! for sequence in &config.sequences {
//!     println!("{}: {} steps", sequence.name, sequence.steps.len());
//! }
//! # Ok::<(), lab_sequencer::config::ConfigError>(())
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error_recovery::RetryPolicy;
use crate::parameter::{ParameterSet, ParameterValue};
use crate::sequence::{FailurePolicy, SequenceSpec, StepTemplate};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sequencer.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequencerConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Declarative sequence definitions
    #[serde(default)]
    pub sequences: Vec<SequenceDefinition>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Sequence engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long an aborted step may take to terminate before forced teardown
    #[serde(default = "default_abort_timeout", with = "humantime_serde")]
    pub abort_timeout: Duration,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Capacity of the outbound event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abort_timeout: default_abort_timeout(),
            failure_policy: FailurePolicy::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Instrument configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// Substitute simulated instruments for resources that fail to open
    #[serde(default)]
    pub debug_fallback: bool,
    /// Retry policy for physical opens
    #[serde(default)]
    pub open_retry: RetryPolicy,
    /// Role or alias → resource key (e.g. `meter = "GPIB0::26::INSTR"`)
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
}

impl InstrumentsConfig {
    /// Resource key for `alias`; unknown aliases are used as keys verbatim.
    pub fn resolve(&self, alias: &str) -> String {
        self.addresses
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for data files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Result sink (csv or memory)
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            backend: default_backend(),
        }
    }
}

/// A sequence as written in the configuration file.
///
/// ```toml
/// [[sequences]]
/// name = "It_vs_temperature"
/// common = { vds = 0.075, chip_number = 8 }
///
/// [[sequences.steps]]
/// procedure = "It"
/// sweep = { parameter = "target_T", values = [10, 20, 30] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Values shared by every step
    #[serde(default)]
    pub common: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl SequenceDefinition {
    pub fn to_spec(&self) -> SequenceSpec {
        SequenceSpec {
            name: self.name.clone(),
            common: ParameterSet::from_values(self.common.clone()),
            steps: self.steps.clone(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "lab_sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_abort_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_buffer() -> usize {
    256
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_backend() -> String {
    "csv".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SequencerConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`LABSEQ_` prefix) take precedence over the
    /// file. The result is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABSEQ_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Abort timeout and event buffer are non-zero
    /// - Storage backend is valid (csv, memory)
    /// - Open retry allows at least one attempt
    /// - Sequence names are unique and every step names a procedure
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.abort_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "engine.abort_timeout must be greater than zero".to_string(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_buffer must be greater than zero".to_string(),
            ));
        }

        let valid_backends = ["csv", "memory"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid storage backend '{}'. Must be one of: {}",
                self.storage.backend,
                valid_backends.join(", ")
            )));
        }

        if self.instruments.open_retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "instruments.open_retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for sequence in &self.sequences {
            if sequence.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Sequence name cannot be empty".to_string(),
                ));
            }
            if !names.insert(&sequence.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate sequence name: '{}'",
                    sequence.name
                )));
            }
            if let Some(pos) = sequence.steps.iter().position(|s| s.procedure.is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "Sequence '{}': step {} has no procedure",
                    sequence.name, pos
                )));
            }
        }

        Ok(())
    }

    /// Look up a sequence definition by name
    pub fn sequence(&self, name: &str) -> Option<&SequenceDefinition> {
        self.sequences.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SequencerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.abort_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn test_load_sequences_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [engine]
            abort_timeout = "5s"
            failure_policy = "stop"

            [instruments]
            debug_fallback = true
            addresses = { meter = "GPIB0::26::INSTR", laser = "COM4" }

            [[sequences]]
            name = "temperature"
            common = { vds = 0.075 }

            [[sequences.steps]]
            procedure = "It"
            overrides = { vg = 1.0 }

            [[sequences.steps]]
            procedure = "It"
            sweep = { parameter = "target_T", values = [10, 20, 30] }
            skip_startup = true
            "#,
        );

        let config = SequencerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.engine.abort_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.failure_policy, FailurePolicy::StopOnFailure);
        assert_eq!(config.instruments.resolve("meter"), "GPIB0::26::INSTR");
        assert_eq!(config.instruments.resolve("gate"), "gate");

        let spec = config.sequence("temperature").unwrap().to_spec();
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.common.value("vds"), Some(&ParameterValue::Float(0.075)));
        assert!(spec.steps[0].overrides.contains("vg"));
        let sweep = spec.steps[1].sweep.as_ref().unwrap();
        assert_eq!(sweep.values.len(), 3);
        assert!(spec.steps[1].skip_startup);
    }

    #[test]
    fn test_invalid_log_level() {
        let file = write_config("[application]\nlog_level = \"loud\"\n");
        let err = SequencerConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("log_level")));
    }

    #[test]
    fn test_duplicate_sequence_names() {
        let file = write_config(
            r#"
            [[sequences]]
            name = "a"
            [[sequences]]
            name = "a"
            "#,
        );
        let err = SequencerConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate sequence name"));
    }

    #[test]
    fn test_bad_duration_is_load_error() {
        let file = write_config("[engine]\nabort_timeout = \"soon\"\n");
        let err = SequencerConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SequencerConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.backend, "csv");
        assert!(config.sequences.is_empty());
    }
}
