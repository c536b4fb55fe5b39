//! Error types for shell contexts and pipelines
//!
//! Construction errors (bad directory, bad configuration value, unwireable
//! pipeline, unspawnable executable) are returned to the caller. Failures that
//! happen while a pipeline runs are captured per stage in the
//! [`PipelineReport`](crate::pipeline::PipelineReport) instead.

use std::path::PathBuf;

use psh_hal::HalError;

/// Result type for all PipeShell core operations
pub type ShellResult<T> = Result<T, ShellError>;

/// Main error type for core operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShellError {
    /// Working directory target is missing or not a directory
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A recognized numeric key held an unusable value
    #[error("Invalid value '{value}' for {key}: expected a positive integer")]
    InvalidConfig { key: String, value: String },

    /// Stages cannot be wired in the requested order
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Spawn, process, channel or I/O failure from the HAL
    #[error(transparent)]
    Hal(#[from] HalError),
}

impl ShellError {
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, ShellError::Hal(err) if err.is_spawn())
    }

    pub fn is_not_a_directory(&self) -> bool {
        matches!(self, ShellError::NotADirectory(_))
    }
}
