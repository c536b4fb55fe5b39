//! Shell contexts
//!
//! A [`ShellContext`] is the scope every command runs in: working directory,
//! environment, shell-local variables and the stdout/stderr channels. Nested
//! contexts are created with [`ShellContext::sub_shell`] and never write back
//! into their parent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use psh_hal::{Channel, Outlet, ProcessHandle, ProcessIo, ProcessSpec};
use tokio::task::JoinHandle;

use crate::config::{FailurePolicy, ShellConfig, ShellConstants};
use crate::error::{ShellError, ShellResult};
use crate::pipeline::{self, Pipeline, PipelineReport};
use crate::stage::Command;

pub const PWD: &str = "PWD";
pub const OLDPWD: &str = "OLDPWD";

/// Overrides for a sub-shell. Unset fields are inherited as documented on
/// [`ShellContext::sub_shell`].
#[derive(Debug, Clone, Default)]
pub struct SubShellOptions {
    pub dir: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub vars: Option<HashMap<String, String>>,
}

impl SubShellOptions {
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
}

// Streams created by the runtime for a root context, and the tasks draining them.
struct RootStreams {
    stdout: Channel,
    stderr: Channel,
    drains: Vec<JoinHandle<()>>,
}

/// Execution scope for processes and pipelines.
pub struct ShellContext {
    cwd: PathBuf,
    environment: HashMap<String, String>,
    variables: HashMap<String, String>,
    stdout: Channel,
    stderr: Channel,
    constants: ShellConstants,
    defaults: ShellConstants,
    failure_policy: FailurePolicy,
    depth: usize,
    root_streams: Option<RootStreams>,
}

/// Resolve `dir` against `base` to a canonical existing directory.
pub(crate) fn resolve_directory(base: &Path, dir: &Path) -> ShellResult<PathBuf> {
    let candidate = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        base.join(dir)
    };
    match std::fs::canonicalize(&candidate) {
        Ok(path) if path.is_dir() => Ok(path),
        _ => Err(ShellError::NotADirectory(candidate)),
    }
}

// Keep PWD equal to `cwd`, remembering the previous value in OLDPWD.
fn reconcile_pwd(environment: &mut HashMap<String, String>, cwd: &Path) {
    let pwd = cwd.to_string_lossy().into_owned();
    if let Some(previous) = environment.get(PWD) {
        if *previous != pwd {
            let previous = previous.clone();
            environment.insert(OLDPWD.to_string(), previous);
        }
    }
    environment.insert(PWD.to_string(), pwd);
}

impl ShellContext {
    /// Build a root context whose streams are owned by this context.
    ///
    /// `cwd` must already be resolved.
    pub(crate) fn root(
        cwd: PathBuf,
        mut environment: HashMap<String, String>,
        variables: HashMap<String, String>,
        config: &ShellConfig,
    ) -> ShellResult<Self> {
        let constants = ShellConstants::resolve(&mut environment, &config.constants)?;
        reconcile_pwd(&mut environment, &cwd);
        let stdout = Channel::new(constants.channel_buffer_size, constants.rw_packet_size);
        let stderr = Channel::new(constants.channel_buffer_size, constants.rw_packet_size);

        tracing::debug!(cwd = %cwd.display(), stdout = stdout.id(), stderr = stderr.id(), "root context created");
        Ok(Self {
            cwd,
            environment,
            variables,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            constants,
            defaults: config.constants,
            failure_policy: config.failure_policy,
            depth: 0,
            root_streams: Some(RootStreams {
                stdout,
                stderr,
                drains: Vec::new(),
            }),
        })
    }

    pub(crate) fn adopt_drain(&mut self, drain: JoinHandle<()>) {
        if let Some(streams) = self.root_streams.as_mut() {
            streams.drains.push(drain);
        }
    }

    /// Value of an environment variable.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Value of a shell-local variable.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Shell-local variables shadow the environment.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.variable(name).or_else(|| self.env(name))
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn stdout(&self) -> &Channel {
        &self.stdout
    }

    pub fn stderr(&self) -> &Channel {
        &self.stderr
    }

    pub fn constants(&self) -> &ShellConstants {
        &self.constants
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Policy used by pipelines of this context that do not choose one.
    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.failure_policy = policy;
    }

    /// Number of sub-shells between this context and the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Set `name` in both the environment and the shell-local variables.
    ///
    /// `PWD` follows the working directory; exporting it only sets the
    /// shell-local variable. Use [`ShellContext::cd`] to move.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name == PWD {
            tracing::debug!("PWD is managed by cd; environment left unchanged");
        } else {
            self.environment.insert(name.clone(), value.clone());
        }
        self.variables.insert(name, value);
    }

    /// Set a shell-local variable. It is never passed to processes.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Remove `name` from both maps. Returns whether anything was removed.
    /// `PWD` cannot be removed from the environment.
    pub fn unset(&mut self, name: &str) -> bool {
        let from_variables = self.variables.remove(name).is_some();
        if name == PWD {
            return from_variables;
        }
        let from_environment = self.environment.remove(name).is_some();
        from_variables || from_environment
    }

    /// Change the working directory. Relative paths resolve against the
    /// current one.
    pub fn cd(&mut self, path: impl AsRef<Path>) -> ShellResult<()> {
        let target = resolve_directory(&self.cwd, path.as_ref())?;
        tracing::debug!(from = %self.cwd.display(), to = %target.display(), "cd");
        // Every successful cd records the prior PWD, even `cd .`.
        let previous = self
            .environment
            .insert(PWD.to_string(), target.to_string_lossy().into_owned());
        if let Some(previous) = previous {
            self.environment.insert(OLDPWD.to_string(), previous);
        }
        self.cwd = target;
        Ok(())
    }

    /// Create a nested context.
    ///
    /// * `dir` must name an existing directory (relative paths resolve against
    ///   this context), otherwise the working directory is inherited.
    /// * `env` replaces the whole environment, otherwise it is copied.
    /// * `vars` become the shell-local variables, otherwise there are none.
    ///
    /// The sub-shell writes to the same stdout and stderr channels. Its
    /// constants are resolved again from its own environment.
    pub fn sub_shell(&self, options: SubShellOptions) -> ShellResult<ShellContext> {
        let cwd = match &options.dir {
            Some(dir) => resolve_directory(&self.cwd, dir)?,
            None => self.cwd.clone(),
        };
        let mut environment = options.env.unwrap_or_else(|| self.environment.clone());
        let constants = ShellConstants::resolve(&mut environment, &self.defaults)?;
        reconcile_pwd(&mut environment, &cwd);

        tracing::debug!(depth = self.depth + 1, cwd = %cwd.display(), "sub-shell created");
        Ok(ShellContext {
            cwd,
            environment,
            variables: options.vars.unwrap_or_default(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            constants,
            defaults: self.defaults,
            failure_policy: self.failure_policy,
            depth: self.depth + 1,
            root_streams: None,
        })
    }

    /// Run `body` in a sub-shell and return its value once the body and
    /// everything it awaited have finished.
    ///
    /// ```ignore
    /// let code = ctx
    ///     .with_sub_shell(SubShellOptions::new().dir("src"), |sub| {
    ///         Box::pin(async move { sub.run(Command::new("ls")).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_sub_shell<T, F>(&self, options: SubShellOptions, body: F) -> ShellResult<T>
    where
        F: for<'a> FnOnce(&'a mut ShellContext) -> BoxFuture<'a, ShellResult<T>>,
    {
        let mut sub = self.sub_shell(options)?;
        body(&mut sub).await
    }

    /// Send this context's stdout to `channel`. Returns the previous channel.
    pub fn redirect_stdout(&mut self, channel: Channel) -> Channel {
        std::mem::replace(&mut self.stdout, channel)
    }

    /// Send this context's stderr to `channel`. Returns the previous channel.
    pub fn redirect_stderr(&mut self, channel: Channel) -> Channel {
        std::mem::replace(&mut self.stderr, channel)
    }

    pub(crate) fn process_spec(&self, command: &Command) -> ProcessSpec {
        let mut env = self.environment.clone();
        env.extend(
            command
                .env_overrides()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        ProcessSpec {
            program: command.program().to_string(),
            args: command.arguments().to_vec(),
            env,
            cwd: self.cwd.clone(),
        }
    }

    fn output_io(&self, command: &Command, stdin: Option<Channel>) -> ProcessIo {
        let stderr = command
            .stderr_channel()
            .cloned()
            .unwrap_or_else(|| self.stderr.clone());
        ProcessIo {
            stdin,
            stdout: Outlet::shared(self.stdout.clone()),
            stderr: Outlet::shared(stderr),
        }
    }

    /// Start a single process writing to this context's streams.
    ///
    /// The process reads from a fresh channel available through
    /// [`ProcessHandle::stdin`]; close it to signal end of input.
    pub fn spawn(&self, command: Command) -> ShellResult<ProcessHandle> {
        let stdin = Channel::new(
            self.constants.input_stream_buffer_size,
            self.constants.rw_packet_size,
        );
        let io = self.output_io(&command, Some(stdin));
        Ok(ProcessHandle::spawn(
            self.process_spec(&command),
            io,
            self.constants.rw_packet_size,
        )?)
    }

    /// Run a single process with no input and return its exit code.
    pub async fn run(&self, command: Command) -> ShellResult<i32> {
        let io = self.output_io(&command, None);
        let mut handle =
            ProcessHandle::spawn(self.process_spec(&command), io, self.constants.rw_packet_size)?;
        Ok(handle.wait().await?)
    }

    /// Execute `pipeline` in this context.
    pub async fn pipeline(&self, pipeline: Pipeline) -> ShellResult<PipelineReport> {
        pipeline::execute(pipeline, self).await
    }

    /// Close the streams owned by a root context and wait until everything
    /// written to them was delivered. Sub-shells have nothing to close.
    pub async fn close(mut self) {
        if let Some(streams) = self.root_streams.take() {
            streams.stdout.close();
            streams.stderr.close();
            for drain in streams.drains {
                if let Err(e) = drain.await {
                    tracing::warn!(error = %e, "stream drain task failed");
                }
            }
        }
    }
}

impl Drop for ShellContext {
    fn drop(&mut self) {
        // Let drain tasks finish when a root context is dropped without close().
        if let Some(streams) = &self.root_streams {
            streams.stdout.close();
            streams.stderr.close();
        }
    }
}

impl std::fmt::Debug for ShellContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellContext")
            .field("cwd", &self.cwd)
            .field("depth", &self.depth)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("constants", &self.constants)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}
