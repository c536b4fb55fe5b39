//! Pipeline construction and execution
//!
//! Every stage runs as its own tokio task; adjacent stages are connected by a
//! bounded [`Channel`] sized from the context constants. The executor waits for
//! all stages and collects one [`StageReport`] per stage.

use psh_hal::{Channel, Outlet, ProcessHandle, ProcessId, ProcessIo};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::FailurePolicy;
use crate::context::ShellContext;
use crate::error::{ShellError, ShellResult};
use crate::stage::{self, Command, Sink, Source, Stage, StageOutcome, StoreResult, ABORTED};

/// An ordered chain of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
    policy: Option<FailurePolicy>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            policy: None,
        }
    }

    /// Append any stage.
    pub fn then(mut self, stage: impl Into<Stage>) -> Self {
        self.stages.push(stage.into());
        self
    }

    pub fn source(self, source: Source) -> Self {
        self.then(source)
    }

    pub fn process(self, command: Command) -> Self {
        self.then(command)
    }

    pub fn sink(self, sink: Sink) -> Self {
        self.then(sink)
    }

    /// Terminate the pipeline in a store sink sharing `store`.
    pub fn store(self, store: &StoreResult) -> Self {
        self.then(Sink::Store(store.clone()))
    }

    /// Override the context failure policy for this pipeline.
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check that the stages can be wired in order.
    pub fn validate(&self) -> ShellResult<()> {
        if self.stages.is_empty() {
            return Err(ShellError::InvalidPipeline("pipeline has no stages".to_string()));
        }
        let last = self.stages.len() - 1;
        for (index, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Source(_) if index != 0 => {
                    return Err(ShellError::InvalidPipeline(format!(
                        "source at position {index} must be the first stage"
                    )));
                }
                Stage::Sink(_) if index != last => {
                    return Err(ShellError::InvalidPipeline(format!(
                        "sink at position {index} must be the last stage"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub index: usize,
    pub label: String,
    /// OS process id of a process stage.
    pub pid: Option<ProcessId>,
    pub outcome: StageOutcome,
    /// Bytes consumed by a store sink during this run.
    pub output: Option<Vec<u8>>,
}

impl StageReport {
    pub fn is_process(&self) -> bool {
        matches!(self.outcome, StageOutcome::Exited(_)) || self.pid.is_some()
    }
}

/// Result of a whole pipeline, one report per stage in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageReport> {
        self.stages.get(index)
    }

    /// Status of the last process stage, or of the last stage when the
    /// pipeline runs no process.
    pub fn exit_code(&self) -> i32 {
        self.stages
            .iter()
            .rev()
            .find(|report| report.is_process())
            .or_else(|| self.stages.last())
            .map_or(0, |report| report.outcome.code())
    }

    /// Status of every process stage in order.
    pub fn exit_codes(&self) -> Vec<i32> {
        self.stages
            .iter()
            .filter(|report| report.is_process())
            .map(|report| report.outcome.code())
            .collect()
    }

    /// True when every stage, process or not, succeeded.
    pub fn success(&self) -> bool {
        self.stages.iter().all(|report| report.outcome.is_success())
    }

    /// Rightmost non-zero status, like `set -o pipefail`.
    pub fn pipefail_code(&self) -> i32 {
        self.stages
            .iter()
            .rev()
            .map(|report| report.outcome.code())
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    /// Bytes stored by the final store sink, if the pipeline ends in one.
    pub fn output(&self) -> Option<&[u8]> {
        self.stages.last().and_then(|report| report.output.as_deref())
    }

    pub fn output_text(&self) -> Option<String> {
        self.output().map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

fn fail_links(links: &[Channel], reason: &str) {
    for link in links {
        link.fail(reason);
    }
}

/// Run `pipeline` with the streams, environment and constants of `ctx`.
pub(crate) async fn execute(pipeline: Pipeline, ctx: &ShellContext) -> ShellResult<PipelineReport> {
    pipeline.validate()?;
    let policy = pipeline.policy.unwrap_or(ctx.failure_policy());
    let constants = *ctx.constants();
    let stages: Vec<Stage> = pipeline
        .stages
        .into_iter()
        .map(|stage| stage.anchored(ctx.cwd()))
        .collect();
    let count = stages.len();
    let labels: Vec<String> = stages.iter().map(Stage::label).collect();

    let links: Vec<Channel> = (1..count)
        .map(|_| Channel::new(constants.channel_buffer_size, constants.rw_packet_size))
        .collect();
    let abort = CancellationToken::new();
    let mut tasks = JoinSet::new();

    tracing::debug!(stages = count, ?policy, cwd = %ctx.cwd().display(), "pipeline started");

    for (index, stage) in stages.into_iter().enumerate() {
        let label = labels[index].clone();
        let upstream = index.checked_sub(1).map(|i| links[i].clone());
        let downstream = links.get(index).cloned();

        match stage {
            Stage::Process(command) => {
                let stderr = command
                    .stderr_channel()
                    .cloned()
                    .unwrap_or_else(|| ctx.stderr().clone());
                let io = ProcessIo {
                    stdin: upstream,
                    stdout: match downstream {
                        Some(link) => Outlet::owned(link),
                        None => Outlet::shared(ctx.stdout().clone()),
                    },
                    stderr: Outlet::shared(stderr),
                };
                match ProcessHandle::spawn(ctx.process_spec(&command), io, constants.rw_packet_size) {
                    Ok(handle) => {
                        tasks.spawn(run_process(index, label, handle, abort.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(stage = index, command = %label, error = %e, "spawn failed, aborting pipeline");
                        abort.cancel();
                        fail_links(&links, "pipeline aborted: spawn failed");
                        while tasks.join_next().await.is_some() {}
                        return Err(e.into());
                    }
                }
            }
            Stage::Source(source) => {
                let out = match downstream {
                    Some(link) => Outlet::owned(link),
                    None => Outlet::shared(ctx.stdout().clone()),
                };
                let abort = abort.clone();
                let packet_size = constants.rw_packet_size;
                tasks.spawn(async move {
                    let outcome = tokio::select! {
                        outcome = stage::run_source(source, out, packet_size, abort.clone()) => outcome,
                        _ = abort.cancelled() => StageOutcome::Failed(ABORTED.to_string()),
                    };
                    StageReport { index, label, pid: None, outcome, output: None }
                });
            }
            Stage::Sink(sink) => {
                let input = upstream.unwrap_or_else(|| {
                    let empty = Channel::new(1, constants.rw_packet_size);
                    empty.close();
                    empty
                });
                let abort = abort.clone();
                tasks.spawn(async move {
                    let (outcome, output) = tokio::select! {
                        result = stage::run_sink(sink, input, abort.clone()) => result,
                        _ = abort.cancelled() => (StageOutcome::Failed(ABORTED.to_string()), None),
                    };
                    StageReport { index, label, pid: None, outcome, output }
                });
            }
        }
    }

    let mut reports: Vec<Option<StageReport>> = vec![None; count];
    while let Some(joined) = tasks.join_next().await {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline stage task ended abnormally");
                continue;
            }
        };
        if policy == FailurePolicy::Abort && !report.outcome.is_success() && !abort.is_cancelled() {
            tracing::warn!(
                stage = report.index,
                label = %report.label,
                code = report.outcome.code(),
                "stage failed, aborting pipeline"
            );
            abort.cancel();
            fail_links(&links, "pipeline aborted");
        }
        let index = report.index;
        reports[index] = Some(report);
    }

    let stages = reports
        .into_iter()
        .enumerate()
        .map(|(index, report)| {
            report.unwrap_or_else(|| StageReport {
                index,
                label: labels[index].clone(),
                pid: None,
                outcome: StageOutcome::Failed("stage task did not complete".to_string()),
                output: None,
            })
        })
        .collect();
    let report = PipelineReport { stages };
    tracing::debug!(
        exit_code = report.exit_code(),
        success = report.success(),
        "pipeline finished"
    );
    Ok(report)
}

async fn run_process(
    index: usize,
    label: String,
    mut handle: ProcessHandle,
    abort: CancellationToken,
) -> StageReport {
    let pid = handle.pid();
    let finished = tokio::select! {
        result = handle.wait() => Some(result),
        _ = abort.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            if let Err(e) = handle.kill() {
                tracing::debug!(pid, error = %e, "kill after abort failed");
            }
            handle.wait().await
        }
    };
    let outcome = match result {
        Ok(code) => StageOutcome::Exited(code),
        Err(e) => StageOutcome::Failed(e.to_string()),
    };
    StageReport {
        index,
        label,
        pid,
        outcome,
        output: None,
    }
}
