//! PipeShell Core Library
//!
//! An embeddable shell runtime driven from Rust code: processes and pipelines
//! run inside [`ShellContext`]s that scope the working directory, environment,
//! shell-local variables and standard streams. Platform plumbing (channels,
//! OS processes) lives in `psh_hal`.

// Re-export commonly used types and functions
pub use config::{FailurePolicy, LogFormat, LoggingConfig, ShellConfig, ShellConstants};
pub use context::{ShellContext, SubShellOptions};
pub use error::{ShellError, ShellResult};
pub use pipeline::{Pipeline, PipelineReport, StageReport};
pub use runtime::{ShellOptions, ShellOutcome, ShellRuntime, StreamTarget};
pub use stage::{Command, Sink, Source, Stage, StageOutcome, StoreResult};

pub use psh_hal::{Channel, HalError, ProcessHandle, ProcessStatus};

// Public modules
pub mod config;
pub mod context;
pub mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod pipeline;
pub mod runtime;
pub mod stage;
