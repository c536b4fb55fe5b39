//! Runtime configuration and per-context constants
//!
//! [`ShellConfig`] holds process-wide defaults and can be loaded from TOML.
//! [`ShellConstants`] is resolved once for every context from its environment
//! map, falling back to the configured defaults, and sizes every channel and
//! process created in that context.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ShellError, ShellResult};

pub const SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE: &str = "SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE";
pub const PIPELINE_CHANNEL_BUFFER_SIZE: &str = "PIPELINE_CHANNEL_BUFFER_SIZE";
pub const PIPELINE_RW_PACKET_SIZE: &str = "PIPELINE_RW_PACKET_SIZE";

pub const DEFAULT_SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE: usize = 8;
pub const DEFAULT_PIPELINE_CHANNEL_BUFFER_SIZE: usize = 64;
pub const DEFAULT_PIPELINE_RW_PACKET_SIZE: usize = 4096;

/// Buffer sizes threaded through every channel and process of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConstants {
    /// Capacity, in chunks, of the stdin channel of a standalone process.
    pub input_stream_buffer_size: usize,
    /// Capacity, in chunks, of every channel between pipeline stages.
    pub channel_buffer_size: usize,
    /// Maximum bytes per chunk and per OS read.
    pub rw_packet_size: usize,
}

impl Default for ShellConstants {
    fn default() -> Self {
        Self {
            input_stream_buffer_size: DEFAULT_SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE,
            channel_buffer_size: DEFAULT_PIPELINE_CHANNEL_BUFFER_SIZE,
            rw_packet_size: DEFAULT_PIPELINE_RW_PACKET_SIZE,
        }
    }
}

impl ShellConstants {
    /// Resolve the constants from `env`.
    ///
    /// Keys present in `env` must hold positive integers. Missing keys take the
    /// value from `defaults`, which is written back so `env` always reports the
    /// effective value.
    pub fn resolve(env: &mut HashMap<String, String>, defaults: &ShellConstants) -> ShellResult<Self> {
        Ok(Self {
            input_stream_buffer_size: resolve_key(
                env,
                SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE,
                defaults.input_stream_buffer_size,
            )?,
            channel_buffer_size: resolve_key(
                env,
                PIPELINE_CHANNEL_BUFFER_SIZE,
                defaults.channel_buffer_size,
            )?,
            rw_packet_size: resolve_key(env, PIPELINE_RW_PACKET_SIZE, defaults.rw_packet_size)?,
        })
    }
}

fn resolve_key(env: &mut HashMap<String, String>, key: &str, default: usize) -> ShellResult<usize> {
    match env.get(key) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ShellError::InvalidConfig {
                key: key.to_string(),
                value: raw.clone(),
            }),
        },
        None => {
            env.insert(key.to_string(), default.to_string());
            Ok(default)
        }
    }
}

/// What a pipeline does when one of its stages exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the exit code and let sibling stages run to completion.
    #[default]
    Continue,
    /// Cancel every remaining stage on the first failure.
    Abort,
}

/// Log format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Install a subscriber when the runtime is created.
    pub enabled: bool,
    /// Filter directive used when `PSH_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Defaults for contexts whose environment lacks the constant keys.
    pub constants: ShellConstants,
    /// Policy for pipelines that do not choose one.
    pub failure_policy: FailurePolicy,
    /// Seed the root environment from the host process environment.
    pub inherit_host_env: bool,
    pub logging: LoggingConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            constants: ShellConstants::default(),
            failure_policy: FailurePolicy::default(),
            inherit_host_env: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl ShellConfig {
    pub fn from_toml_str(content: &str) -> ShellResult<Self> {
        toml::from_str(content).map_err(|e| ShellError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ShellResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ShellError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults_and_are_written_back() {
        let mut env = HashMap::new();
        let constants = ShellConstants::resolve(&mut env, &ShellConstants::default()).unwrap();

        assert_eq!(constants, ShellConstants::default());
        assert_eq!(env[SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE], "8");
        assert_eq!(env[PIPELINE_CHANNEL_BUFFER_SIZE], "64");
        assert_eq!(env[PIPELINE_RW_PACKET_SIZE], "4096");
    }

    #[test]
    fn supplied_keys_win_over_defaults() {
        let mut env = HashMap::from([
            (SYSTEM_PROCESS_INPUT_STREAM_BUFFER_SIZE.to_string(), "1".to_string()),
            (PIPELINE_CHANNEL_BUFFER_SIZE.to_string(), "2".to_string()),
            (PIPELINE_RW_PACKET_SIZE.to_string(), "3".to_string()),
        ]);
        let constants = ShellConstants::resolve(&mut env, &ShellConstants::default()).unwrap();
        assert_eq!(
            constants,
            ShellConstants {
                input_stream_buffer_size: 1,
                channel_buffer_size: 2,
                rw_packet_size: 3,
            }
        );
        assert_eq!(env[PIPELINE_RW_PACKET_SIZE], "3");
    }

    #[test]
    fn unusable_values_are_rejected() {
        for bad in ["0", "-4", "lots", ""] {
            let mut env = HashMap::from([(PIPELINE_RW_PACKET_SIZE.to_string(), bad.to_string())]);
            let err = ShellConstants::resolve(&mut env, &ShellConstants::default()).unwrap_err();
            assert!(matches!(err, ShellError::InvalidConfig { ref key, .. } if key == PIPELINE_RW_PACKET_SIZE));
        }
    }

    #[test]
    fn config_parses_from_toml() {
        let config = ShellConfig::from_toml_str(
            r#"
            failure_policy = "abort"
            inherit_host_env = false

            [constants]
            rw_packet_size = 512

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(!config.inherit_host_env);
        assert_eq!(config.constants.rw_packet_size, 512);
        assert_eq!(
            config.constants.channel_buffer_size,
            DEFAULT_PIPELINE_CHANNEL_BUFFER_SIZE
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.enabled);
    }

    #[test]
    fn empty_toml_is_the_default_config() {
        assert_eq!(ShellConfig::from_toml_str("").unwrap(), ShellConfig::default());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ShellConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ShellError::Config(_)));
    }
}
