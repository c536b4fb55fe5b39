//! Pipeline stages
//!
//! A [`Stage`] is anything with byte streams: an OS process ([`Command`]), a
//! data [`Source`] that starts a pipeline, or a [`Sink`] that ends one. Source
//! and sink stages run as tasks defined here; process stages are driven by
//! the pipeline executor through [`psh_hal::ProcessHandle`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use psh_hal::{Channel, Outlet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// An external command to run as a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    stderr: Option<Channel>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stderr: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a variable to this command's environment only, on top of the
    /// context environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Send stderr to `channel` instead of the context stderr. The channel is
    /// shared, so it is not closed when the process ends.
    pub fn stderr_to(mut self, channel: Channel) -> Self {
        self.stderr = Some(channel);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn stderr_channel(&self) -> Option<&Channel> {
        self.stderr.as_ref()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// First stage of a pipeline: produces bytes, has no upstream.
#[derive(Debug, Clone)]
pub enum Source {
    Bytes(Vec<u8>),
    File(PathBuf),
    /// Forward everything read from an existing channel.
    Channel(Channel),
    /// Produces nothing; downstream sees end of stream immediately.
    Empty,
}

impl Source {
    pub fn text(text: impl Into<String>) -> Self {
        Source::Bytes(text.into().into_bytes())
    }
}

/// Last stage of a pipeline: consumes bytes, has no downstream.
#[derive(Debug, Clone)]
pub enum Sink {
    /// Accumulate the output for later inspection.
    Store(StoreResult),
    File { path: PathBuf, append: bool },
    /// Forward into an existing channel without closing it.
    Channel(Channel),
    Discard,
}

/// One link of a pipeline.
#[derive(Debug, Clone)]
pub enum Stage {
    Process(Command),
    Source(Source),
    Sink(Sink),
}

impl Stage {
    /// Short description used in reports and logs.
    pub fn label(&self) -> String {
        match self {
            Stage::Process(command) => command.to_string(),
            Stage::Source(Source::Bytes(bytes)) => format!("source:bytes({})", bytes.len()),
            Stage::Source(Source::File(path)) => format!("source:file({})", path.display()),
            Stage::Source(Source::Channel(channel)) => format!("source:channel({})", channel.id()),
            Stage::Source(Source::Empty) => "source:empty".to_string(),
            Stage::Sink(Sink::Store(_)) => "sink:store".to_string(),
            Stage::Sink(Sink::File { path, .. }) => format!("sink:file({})", path.display()),
            Stage::Sink(Sink::Channel(channel)) => format!("sink:channel({})", channel.id()),
            Stage::Sink(Sink::Discard) => "sink:discard".to_string(),
        }
    }

    /// Resolve relative file paths against `cwd`.
    pub(crate) fn anchored(self, cwd: &Path) -> Stage {
        match self {
            Stage::Source(Source::File(path)) => Stage::Source(Source::File(cwd.join(path))),
            Stage::Sink(Sink::File { path, append }) => Stage::Sink(Sink::File {
                path: cwd.join(path),
                append,
            }),
            other => other,
        }
    }
}

impl From<Command> for Stage {
    fn from(command: Command) -> Self {
        Stage::Process(command)
    }
}

impl From<Source> for Stage {
    fn from(source: Source) -> Self {
        Stage::Source(source)
    }
}

impl From<Sink> for Stage {
    fn from(sink: Sink) -> Self {
        Stage::Sink(sink)
    }
}

/// Shared accumulator behind [`Sink::Store`].
///
/// Clones observe the same storage, so a handle kept by the caller sees what
/// the pipeline stored. Successive pipelines append.
#[derive(Debug, Clone, Default)]
pub struct StoreResult {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StoreResult {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, chunk: Vec<u8>) {
        self.lock().push(chunk);
    }

    /// Chunks in the order they were received.
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.lock().clone()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.lock().concat()
    }

    /// Stored bytes decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().iter().all(Vec::is_empty)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// How a stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Process stage exit code.
    Exited(i32),
    /// Source or sink ran to completion.
    Completed,
    Failed(String),
}

impl StageOutcome {
    /// Shell-style status: failures count as 1.
    pub fn code(&self) -> i32 {
        match self {
            StageOutcome::Exited(code) => *code,
            StageOutcome::Completed => 0,
            StageOutcome::Failed(_) => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 0
    }
}

pub(crate) const ABORTED: &str = "aborted";

fn interrupted(abort: &CancellationToken, error: impl fmt::Display) -> StageOutcome {
    if abort.is_cancelled() {
        StageOutcome::Failed(ABORTED.to_string())
    } else {
        StageOutcome::Failed(error.to_string())
    }
}

fn finish(outlet: &Outlet) {
    if outlet.close_on_eof {
        outlet.channel.close();
    }
}

// A shared outlet such as the context stdout outlives this stage and stays open.
fn abandon(outlet: &Outlet, reason: String) {
    if outlet.close_on_eof {
        outlet.channel.fail(reason);
    }
}

/// Produce `source` into `out`.
pub(crate) async fn run_source(
    source: Source,
    out: Outlet,
    packet_size: usize,
    abort: CancellationToken,
) -> StageOutcome {
    let outcome = match source {
        Source::Empty => StageOutcome::Completed,
        Source::Bytes(bytes) => match out.channel.write(&bytes).await {
            Ok(()) => StageOutcome::Completed,
            Err(e) => return downstream_gone(&abort, e),
        },
        Source::Channel(input) => loop {
            match input.read().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = out.channel.write(&chunk).await {
                        return downstream_gone(&abort, e);
                    }
                }
                Ok(None) => break StageOutcome::Completed,
                Err(e) => {
                    abandon(&out, format!("source failed: {e}"));
                    return interrupted(&abort, e);
                }
            }
        },
        Source::File(path) => {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    abandon(&out, format!("cannot open {}", path.display()));
                    return StageOutcome::Failed(format!("{}: {e}", path.display()));
                }
            };
            let mut buf = vec![0u8; packet_size.max(1)];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break StageOutcome::Completed,
                    Ok(n) => {
                        if let Err(e) = out.channel.write(&buf[..n]).await {
                            return downstream_gone(&abort, e);
                        }
                    }
                    Err(e) => {
                        abandon(&out, format!("cannot read {}", path.display()));
                        return StageOutcome::Failed(format!("{}: {e}", path.display()));
                    }
                }
            }
        }
    };
    finish(&out);
    outcome
}

// A consumer that stops early is a broken pipe, not a failure of the producer.
fn downstream_gone(abort: &CancellationToken, error: psh_hal::HalError) -> StageOutcome {
    if abort.is_cancelled() {
        return StageOutcome::Failed(ABORTED.to_string());
    }
    tracing::debug!(error = %error, "downstream closed before source finished");
    StageOutcome::Completed
}

/// Consume `input` into `sink`. Returns the bytes consumed by a store sink.
pub(crate) async fn run_sink(
    sink: Sink,
    input: Channel,
    abort: CancellationToken,
) -> (StageOutcome, Option<Vec<u8>>) {
    match sink {
        Sink::Store(store) => {
            let mut received = Vec::new();
            loop {
                match input.read().await {
                    Ok(Some(chunk)) => {
                        received.extend_from_slice(&chunk);
                        store.push(chunk);
                    }
                    Ok(None) => break (StageOutcome::Completed, Some(received)),
                    Err(e) => break (interrupted(&abort, e), Some(received)),
                }
            }
        }
        Sink::File { path, append } => {
            let mut options = tokio::fs::OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            let mut file = match options.open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    input.fail(format!("cannot open {}", path.display()));
                    return (StageOutcome::Failed(format!("{}: {e}", path.display())), None);
                }
            };
            loop {
                match input.read().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = file.write_all(&chunk).await {
                            input.fail(format!("cannot write {}", path.display()));
                            return (StageOutcome::Failed(format!("{}: {e}", path.display())), None);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return (interrupted(&abort, e), None),
                }
            }
            match file.flush().await {
                Ok(()) => (StageOutcome::Completed, None),
                Err(e) => (StageOutcome::Failed(format!("{}: {e}", path.display())), None),
            }
        }
        Sink::Channel(target) => loop {
            match input.read().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = target.write(&chunk).await {
                        input.fail(format!("sink channel unavailable: {e}"));
                        break (interrupted(&abort, e), None);
                    }
                }
                Ok(None) => break (StageOutcome::Completed, None),
                Err(e) => break (interrupted(&abort, e), None),
            }
        },
        Sink::Discard => loop {
            match input.read().await {
                Ok(Some(_)) => {}
                Ok(None) => break (StageOutcome::Completed, None),
                Err(e) => break (interrupted(&abort, e), None),
            }
        },
    }
}
