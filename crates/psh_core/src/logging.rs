//! tracing subscriber setup
//!
//! The engine only emits `tracing` events. Hosts that do not install their
//! own subscriber can call [`init`] (or enable `logging.enabled` in the
//! [`ShellConfig`](crate::config::ShellConfig)) to get stderr output filtered
//! by `PSH_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ShellError, ShellResult};

/// Environment variable holding a filter directive, e.g. `psh_core=debug`.
pub const LOG_ENV_VAR: &str = "PSH_LOG";

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init(config: &LoggingConfig) -> ShellResult<bool> {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ShellError::Config(format!("invalid log level '{}': {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Plain => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    Ok(installed.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = LoggingConfig {
            enabled: true,
            level: "warn".to_string(),
            format: LogFormat::Compact,
        };
        init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }

    #[test]
    fn bad_level_is_a_config_error() {
        if std::env::var(LOG_ENV_VAR).is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "psh_core=notalevel".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init(&config), Err(ShellError::Config(_))));
    }
}
