//! Error handling for the PipeShell HAL
//!
//! This module provides structured error types for channel and process
//! operations, so failures can be propagated to the engine with enough
//! context to report them per pipeline stage.

use std::io;
use std::result;

/// Result type for HAL operations
pub type HalResult<T> = result::Result<T, HalError>;

/// Error types for HAL operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum HalError {
    /// Executable could not be resolved or started
    #[error("Spawn error for '{program}': {message}")]
    Spawn { program: String, message: String },

    /// Waiting on or signalling a process failed
    #[error("Process error in {operation}: {message}")]
    Process {
        operation: String,
        pid: Option<u32>,
        message: String,
    },

    /// Write attempted after the producer closed the channel
    #[error("Channel {channel} is closed")]
    ClosedChannel { channel: u64 },

    /// Channel was closed in the error state
    #[error("Channel {channel} failed: {reason}")]
    ChannelFailed { channel: u64, reason: String },

    /// I/O operation failed
    #[error("I/O error in {operation}: {message}")]
    Io {
        operation: String,
        path: Option<String>,
        kind: io::ErrorKind,
        message: String,
    },
}

impl From<io::Error> for HalError {
    fn from(err: io::Error) -> Self {
        HalError::Io {
            operation: "unknown".to_string(),
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// Helper functions for creating specific error types
impl HalError {
    pub fn spawn_error(program: &str, message: &str) -> Self {
        HalError::Spawn {
            program: program.to_string(),
            message: message.to_string(),
        }
    }

    pub fn process_error(operation: &str, pid: Option<u32>, message: &str) -> Self {
        HalError::Process {
            operation: operation.to_string(),
            pid,
            message: message.to_string(),
        }
    }

    pub fn io_error(operation: &str, path: Option<&str>, err: io::Error) -> Self {
        HalError::Io {
            operation: operation.to_string(),
            path: path.map(|s| s.to_string()),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, HalError::Spawn { .. })
    }

    pub fn is_closed_channel(&self) -> bool {
        matches!(self, HalError::ClosedChannel { .. })
    }

    pub fn is_channel_failed(&self) -> bool {
        matches!(self, HalError::ChannelFailed { .. })
    }
}
