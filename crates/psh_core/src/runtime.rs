//! Root contexts and the top-level entry point
//!
//! [`ShellRuntime`] turns [`ShellOptions`] into a root [`ShellContext`] whose
//! stdout and stderr channels are drained to a [`StreamTarget`], and
//! [`ShellRuntime::run`] executes a body in that context and reports its
//! final state.

use std::collections::HashMap;
use std::path::PathBuf;

use futures::future::BoxFuture;
use psh_hal::{Channel, HalError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::config::ShellConfig;
use crate::context::{resolve_directory, ShellContext, PWD};
use crate::error::ShellResult;
use crate::stage::StoreResult;

/// Where the output of a root stream ends up.
#[derive(Debug, Clone, Default)]
pub enum StreamTarget {
    /// The host process stdout or stderr.
    #[default]
    Inherit,
    Capture(StoreResult),
    Discard,
}

/// Options for a root context.
#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    /// Working directory; defaults to the host current directory.
    pub dir: Option<PathBuf>,
    /// Complete environment; defaults per [`ShellConfig::inherit_host_env`].
    pub env: Option<HashMap<String, String>>,
    pub vars: Option<HashMap<String, String>>,
    pub stdout: StreamTarget,
    pub stderr: StreamTarget,
}

impl ShellOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn stdout(mut self, target: StreamTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn stderr(mut self, target: StreamTarget) -> Self {
        self.stderr = target;
        self
    }
}

/// Value returned by the body of [`ShellRuntime::run`] together with the
/// final state of the root context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome<T> {
    pub value: T,
    pub pwd: PathBuf,
    pub environment: HashMap<String, String>,
    pub variables: HashMap<String, String>,
}

impl<T> ShellOutcome<T> {
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
enum HostStream {
    Stdout,
    Stderr,
}

/// Entry point creating root contexts.
#[derive(Debug, Clone, Default)]
pub struct ShellRuntime {
    config: ShellConfig,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runtime, installing the log subscriber when
    /// `config.logging.enabled` is set.
    pub fn with_config(config: ShellConfig) -> ShellResult<Self> {
        #[cfg(feature = "logging")]
        if config.logging.enabled {
            crate::logging::init(&config.logging)?;
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Create a root context. Must be called from within a tokio runtime.
    ///
    /// Fails with `NotADirectory` or `InvalidConfig` before anything is
    /// started.
    pub fn root_context(&self, options: ShellOptions) -> ShellResult<ShellContext> {
        let host_cwd = std::env::current_dir()
            .map_err(|e| HalError::io_error("current_dir", None, e))?;
        let cwd = match &options.dir {
            Some(dir) => resolve_directory(&host_cwd, dir)?,
            None => resolve_directory(&host_cwd, &host_cwd)?,
        };
        let environment = match options.env {
            Some(env) => env,
            None if self.config.inherit_host_env => host_environment(),
            None => HashMap::new(),
        };
        let variables = options.vars.unwrap_or_default();

        let mut ctx = ShellContext::root(cwd, environment, variables, &self.config)?;
        let stdout = spawn_drain(ctx.stdout().clone(), options.stdout, HostStream::Stdout);
        let stderr = spawn_drain(ctx.stderr().clone(), options.stderr, HostStream::Stderr);
        ctx.adopt_drain(stdout);
        ctx.adopt_drain(stderr);
        Ok(ctx)
    }

    /// Run `body` in a fresh root context.
    ///
    /// The root streams are flushed to their targets before this returns.
    pub async fn run<T, F>(&self, options: ShellOptions, body: F) -> ShellResult<ShellOutcome<T>>
    where
        F: for<'a> FnOnce(&'a mut ShellContext) -> BoxFuture<'a, ShellResult<T>>,
    {
        let mut ctx = self.root_context(options)?;
        let result = body(&mut ctx).await;
        let outcome = result.map(|value| ShellOutcome {
            value,
            pwd: ctx
                .env(PWD)
                .map(PathBuf::from)
                .unwrap_or_else(|| ctx.cwd().to_path_buf()),
            environment: ctx.environment().clone(),
            variables: ctx.variables().clone(),
        });
        ctx.close().await;
        outcome
    }
}

fn host_environment() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

fn spawn_drain(channel: Channel, target: StreamTarget, stream: HostStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        match target {
            StreamTarget::Inherit => {
                let mut out: Box<dyn AsyncWrite + Send + Unpin> = match stream {
                    HostStream::Stdout => Box::new(tokio::io::stdout()),
                    HostStream::Stderr => Box::new(tokio::io::stderr()),
                };
                let mut healthy = true;
                while let Ok(Some(chunk)) = channel.read().await {
                    if !healthy {
                        continue;
                    }
                    if let Err(e) = out.write_all(&chunk).await {
                        // Keep reading so writers never block on a dead host stream.
                        tracing::warn!(?stream, error = %e, "host stream write failed");
                        healthy = false;
                        continue;
                    }
                    let _ = out.flush().await;
                }
            }
            StreamTarget::Capture(store) => {
                while let Ok(Some(chunk)) = channel.read().await {
                    store.push(chunk);
                }
            }
            StreamTarget::Discard => while let Ok(Some(_)) = channel.read().await {},
        }
    })
}
