//! Process management for PipeShell HAL
//!
//! This module spawns OS processes with an explicit environment snapshot and
//! working directory, and bridges their standard streams to [`Channel`]s
//! through forwarding tasks.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::error::{HalError, HalResult};
use crate::resolve::resolve_program;

/// Process identifier type
pub type ProcessId = u32;

/// Exit code reported when a process terminated without one.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// What to run: the resolved command line, environment and directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment of the child; the host environment is not inherited.
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    /// Command line as a single display string.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Destination of a process output stream.
#[derive(Debug, Clone)]
pub struct Outlet {
    pub channel: Channel,
    /// Close the channel when the OS stream ends. Off for shared streams such
    /// as a context stdout.
    pub close_on_eof: bool,
}

impl Outlet {
    /// Outlet owned by this process: closed on end of stream.
    pub fn owned(channel: Channel) -> Self {
        Self {
            channel,
            close_on_eof: true,
        }
    }

    /// Outlet shared with other writers: left open.
    pub fn shared(channel: Channel) -> Self {
        Self {
            channel,
            close_on_eof: false,
        }
    }
}

/// Stream wiring for a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessIo {
    /// Channel feeding the process stdin; `None` connects the null device.
    pub stdin: Option<Channel>,
    pub stdout: Outlet,
    pub stderr: Outlet,
}

/// Process status enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Handle exists but the OS process was not started yet
    NotStarted,
    /// Process is running
    Running,
    /// Process has exited
    Exited(i32),
    /// Process could not be waited on
    Failed(String),
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Exited(_) | ProcessStatus::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            ProcessStatus::NotStarted => 0,
            ProcessStatus::Running => 1,
            ProcessStatus::Exited(_) | ProcessStatus::Failed(_) => 2,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "not started"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(code) => write!(f, "exited ({code})"),
            ProcessStatus::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Process handle for a spawned OS process and its stream forwarders
pub struct ProcessHandle {
    spec: ProcessSpec,
    pid: Option<ProcessId>,
    child: Child,
    status: ProcessStatus,
    stdin: Option<Channel>,
    stdin_pump: Option<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn `spec` and start forwarding its streams through `io`.
    ///
    /// OS reads are performed with a buffer of `packet_size` bytes. Must be
    /// called from within a tokio runtime.
    pub fn spawn(spec: ProcessSpec, io: ProcessIo, packet_size: usize) -> HalResult<Self> {
        if !spec.cwd.is_dir() {
            return Err(HalError::spawn_error(
                &spec.program,
                &format!("working directory {} is not a directory", spec.cwd.display()),
            ));
        }
        let executable = resolve_program(
            &spec.program,
            spec.env.get("PATH").map(String::as_str),
            &spec.cwd,
        )?;

        let mut command = Command::new(&executable);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(if io.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| HalError::spawn_error(&spec.program, &e.to_string()))?;
        let pid = child.id();
        tracing::debug!(pid, command = %spec.command_line(), cwd = %spec.cwd.display(), "process spawned");

        let packet_size = packet_size.max(1);
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_output(stdout, io.stdout, packet_size, pid)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_output(stderr, io.stderr, packet_size, pid)));
        }
        let stdin_pump = match (child.stdin.take(), io.stdin.clone()) {
            (Some(os_stdin), Some(channel)) => Some(tokio::spawn(pump_stdin(os_stdin, channel))),
            _ => None,
        };

        let mut handle = Self {
            spec,
            pid,
            child,
            status: ProcessStatus::NotStarted,
            stdin: io.stdin,
            stdin_pump,
            forwarders,
        };
        handle.transition(ProcessStatus::Running);
        Ok(handle)
    }

    /// Get process ID
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn status(&self) -> &ProcessStatus {
        &self.status
    }

    /// Channel feeding the process stdin, if it was spawned with one.
    pub fn stdin(&self) -> Option<&Channel> {
        self.stdin.as_ref()
    }

    /// Wait for the process to exit and for its output to be fully forwarded.
    pub async fn wait(&mut self) -> HalResult<i32> {
        match &self.status {
            ProcessStatus::Exited(code) => return Ok(*code),
            ProcessStatus::Failed(cause) => {
                return Err(HalError::process_error("wait", self.pid, cause))
            }
            _ => {}
        }

        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let message = e.to_string();
                self.transition(ProcessStatus::Failed(message.clone()));
                return Err(HalError::process_error("wait", self.pid, &message));
            }
        };
        let code = exit_code(status);

        // Nothing reads the stdin channel any more; unblock its producer.
        if let Some(pump) = self.stdin_pump.take() {
            pump.abort();
        }
        if let Some(stdin) = &self.stdin {
            stdin.fail("process exited");
        }
        while let Some(forwarder) = self.forwarders.pop() {
            let _ = forwarder.await;
        }

        tracing::debug!(pid = self.pid, code, command = %self.spec.program, "process exited");
        self.transition(ProcessStatus::Exited(code));
        Ok(code)
    }

    /// Forcibly terminate the process.
    pub fn kill(&mut self) -> HalResult<()> {
        if self.status.is_terminal() {
            return Ok(());
        }
        self.child
            .start_kill()
            .map_err(|e| HalError::process_error("kill", self.pid, &e.to_string()))
    }

    /// Send signal to process (Unix only)
    #[cfg(unix)]
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> HalResult<()> {
        use nix::unistd::Pid;

        let pid = self
            .pid
            .ok_or_else(|| HalError::process_error("signal", None, "process already reaped"))?;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
            HalError::process_error("signal", Some(pid), &format!("Failed to send signal: {e}"))
        })
    }

    fn transition(&mut self, next: ProcessStatus) {
        advance(&mut self.status, next);
    }
}

// Status never regresses.
fn advance(status: &mut ProcessStatus, next: ProcessStatus) {
    if next.rank() > status.rank() {
        *status = next;
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.spec.command_line())
            .field("status", &self.status)
            .finish()
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

async fn forward_output<R>(mut reader: R, outlet: Outlet, packet_size: usize, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; packet_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = outlet.channel.write(&buf[..n]).await {
                    // Dropping the reader hands the child a broken pipe.
                    tracing::debug!(pid, error = %e, "output forwarding stopped");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to read process output");
                break;
            }
        }
    }
    if outlet.close_on_eof {
        outlet.channel.close();
    }
}

async fn pump_stdin(mut stdin: ChildStdin, channel: Channel) {
    loop {
        match channel.read().await {
            Ok(Some(chunk)) => {
                if let Err(e) = stdin.write_all(&chunk).await {
                    channel.fail(format!("process stdin closed: {e}"));
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stdin source failed");
                break;
            }
        }
    }
    // Dropping the handle closes the OS pipe so the child sees end of input.
    let _ = stdin.shutdown().await;
}
