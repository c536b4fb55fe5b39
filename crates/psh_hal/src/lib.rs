//! PipeShell Hardware Abstraction Layer (HAL)
//!
//! This crate isolates the platform-facing half of the shell runtime:
//! - [`Channel`]: bounded, concurrent byte transport between pipeline stages
//! - [`ProcessHandle`]: OS processes with explicit environment and directory,
//!   whose standard streams are bridged to channels
//! - [`resolve_program`]: executable lookup against a context `PATH`

pub mod channel;
pub mod error;
pub mod process;
pub mod resolve;

pub use channel::Channel;
pub use error::{HalError, HalResult};
pub use process::{Outlet, ProcessHandle, ProcessId, ProcessIo, ProcessSpec, ProcessStatus};
pub use resolve::resolve_program;
