//! Experiment runner: one experiment invocation, start to terminal status
//!
//! Every trigger that resolves to a known kind writes exactly one "started"
//! entry before the script runs and exactly one terminal entry after it,
//! cancellation included.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::catalog::{ExperimentKind, ExperimentParams, ScriptCatalog};
use crate::error::AgentError;
use crate::log_sink::{Severity, SharedSink};
use crate::supervisor::{CapturedOutput, ExitOutcome, Invocation, ProcessSupervisor};

/// Source tag for experiment lifecycle entries
pub const RUNNER_SOURCE: &str = "Experiment";

/// Output lines quoted in a failure entry
const FAILURE_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.write_str("running"),
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Failed { reason } => write!(f, "failed: {reason}"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One experiment invocation
#[derive(Debug, Clone)]
pub struct ExperimentRun {
    pub id: Uuid,
    pub kind: ExperimentKind,
    pub params: ExperimentParams,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub output: CapturedOutput,
}

impl ExperimentRun {
    pub(crate) fn start(kind: ExperimentKind, params: ExperimentParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            params,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            output: CapturedOutput::default(),
        }
    }

    pub(crate) fn finish(mut self, status: RunStatus, output: CapturedOutput) -> Self {
        self.ended_at = Some(Utc::now());
        self.status = status;
        self.output = output;
        self
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Starts experiments on behalf of the control loop
#[async_trait]
pub trait ExperimentTrigger: Send + Sync {
    /// Run the named experiment to a terminal status. Fails only when the
    /// name is not a known kind, in which case nothing is spawned.
    async fn trigger(
        &self,
        kind: &str,
        params: &ExperimentParams,
        cancel: &CancellationToken,
    ) -> Result<ExperimentRun, AgentError>;
}

pub struct ExperimentRunner {
    catalog: ScriptCatalog,
    supervisor: ProcessSupervisor,
    sink: SharedSink,
}

impl ExperimentRunner {
    pub fn new(catalog: ScriptCatalog, supervisor: ProcessSupervisor, sink: SharedSink) -> Self {
        Self {
            catalog,
            supervisor,
            sink,
        }
    }

    /// Run one experiment of a known kind
    pub async fn run_kind(
        &self,
        kind: ExperimentKind,
        params: &ExperimentParams,
        cancel: &CancellationToken,
    ) -> ExperimentRun {
        let entry = self.catalog.entry(kind);
        let args = entry.build_args(params);

        for (flag, value) in kind.out_of_range(params) {
            warn!(%kind, "-{flag} {value} is outside 0-100, passing it to the script unchanged");
        }

        let run = ExperimentRun::start(kind, params.clone());
        self.sink.write(
            RUNNER_SOURCE,
            &format!("experiment {} started: {kind} {}", run.id, args.join(" ")),
            Severity::Info,
        );

        let supervised = self
            .supervisor
            .run(
                Invocation {
                    label: kind.name(),
                    file_name: entry.file_name,
                    content: entry.content,
                    args: &args,
                },
                cancel,
            )
            .await;

        let (status, severity) = match supervised.outcome {
            ExitOutcome::Success => (RunStatus::Succeeded, Severity::Info),
            ExitOutcome::Killed => (RunStatus::Cancelled, Severity::Info),
            outcome @ (ExitOutcome::NonZeroExit(_) | ExitOutcome::SpawnFailed(_)) => (
                RunStatus::Failed {
                    reason: outcome.to_string(),
                },
                Severity::Error,
            ),
        };
        let run = run.finish(status, supervised.output);
        self.sink.write(RUNNER_SOURCE, &terminal_message(&run), severity);
        run
    }
}

#[async_trait]
impl ExperimentTrigger for ExperimentRunner {
    async fn trigger(
        &self,
        kind: &str,
        params: &ExperimentParams,
        cancel: &CancellationToken,
    ) -> Result<ExperimentRun, AgentError> {
        let entry = self.catalog.resolve(kind)?;
        Ok(self.run_kind(entry.kind, params, cancel).await)
    }
}

fn terminal_message(run: &ExperimentRun) -> String {
    let mut message = format!(
        "experiment {} {} after {:.1}s: {}",
        run.id,
        run.status,
        run.elapsed_secs(),
        run.kind
    );
    if matches!(run.status, RunStatus::Failed { .. }) && !run.output.is_empty() {
        let lines: Vec<&str> = run.output.lines().collect();
        let tail = &lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..];
        message.push_str("; output: ");
        message.push_str(&tail.join(" | "));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Failed { reason: "x".into() }.is_terminal());
    }

    #[test]
    fn test_finish_sets_end() {
        let run = ExperimentRun::start(ExperimentKind::CpuStress, ExperimentParams::default());
        assert!(run.ended_at.is_none());
        let run = run.finish(RunStatus::Succeeded, CapturedOutput::default());
        assert!(run.ended_at.is_some());
        assert!(run.elapsed_secs() >= 0.0);
    }

    #[test]
    fn test_failure_message_quotes_output_tail() {
        let mut output = CapturedOutput::new(50);
        for i in 0..12 {
            output.push(format!("line {i}"));
        }
        let run = ExperimentRun::start(ExperimentKind::MemoryStress, ExperimentParams::default())
            .finish(RunStatus::Failed { reason: "exited with code 1".into() }, output);
        let message = terminal_message(&run);
        assert!(message.contains("failed: exited with code 1"));
        assert!(message.contains("line 2 | line 3"));
        assert!(!message.contains("line 1 |"));
        assert!(message.ends_with("line 11"));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use crate::log_sink::RecordingSink;
        use crate::supervisor::SupervisorOptions;
        use std::path::Path;
        use std::sync::Arc;
        use std::time::Duration;

        fn runner(
            dir: &Path,
            catalog: ScriptCatalog,
            sink: Arc<RecordingSink>,
        ) -> ExperimentRunner {
            let supervisor = ProcessSupervisor::new(
                SupervisorOptions {
                    interpreter: "sh".into(),
                    interpreter_args: vec![],
                    script_dir: Some(dir.to_path_buf()),
                    kill_grace: Duration::from_secs(5),
                    drain_timeout: Duration::from_secs(2),
                    capture_lines: 50,
                },
                sink.clone(),
            );
            ExperimentRunner::new(catalog, supervisor, sink)
        }

        #[tokio::test]
        async fn test_success_emits_started_then_succeeded() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let catalog = ScriptCatalog::embedded()
                .with_override(ExperimentKind::CpuStress, "printf '%s\\n' \"$*\"\n");
            let runner = runner(dir.path(), catalog, sink.clone());
            let params = ExperimentParams {
                cpu_percentage: 50,
                cpu_cores: std::num::NonZeroU32::new(2).unwrap(),
                duration_secs: std::num::NonZeroU64::new(60).unwrap(),
                ..Default::default()
            };

            let run = runner
                .trigger("cpu-stress", &params, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(run.status, RunStatus::Succeeded);
            assert_eq!(run.output.text(), "-CPUPercentage 50 -CPU 2 -Duration 60");
            let entries = sink.from_source(RUNNER_SOURCE);
            assert_eq!(entries.len(), 2);
            assert!(entries[0].message.contains("started"));
            assert!(entries[1].message.contains("succeeded"));
            assert_eq!(sink.from_source("cpu-stress").len(), 1);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_failed_with_output() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let catalog = ScriptCatalog::embedded()
                .with_override(ExperimentKind::MemoryStress, "echo not enough memory\nexit 2\n");
            let runner = runner(dir.path(), catalog, sink.clone());

            let run = runner
                .trigger("memory-stress", &ExperimentParams::default(), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(
                run.status,
                RunStatus::Failed { reason: "exited with code 2".into() }
            );
            assert_eq!(run.output.text(), "not enough memory");
            let entries = sink.from_source(RUNNER_SOURCE);
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[1].severity, Severity::Error);
            assert!(entries[1].message.contains("not enough memory"));
        }

        #[tokio::test]
        async fn test_unknown_kind_spawns_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let runner = runner(dir.path(), ScriptCatalog::embedded(), sink.clone());

            let result = runner
                .trigger("disk-stress", &ExperimentParams::default(), &CancellationToken::new())
                .await;

            assert!(matches!(result, Err(AgentError::UnknownKind(ref k)) if k == "disk-stress"));
            assert!(sink.entries().is_empty());
            assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        }

        #[tokio::test]
        async fn test_spawn_failure_is_failed_run() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let supervisor = ProcessSupervisor::new(
                SupervisorOptions {
                    interpreter: "/nonexistent/pwsh".into(),
                    script_dir: Some(dir.path().to_path_buf()),
                    ..Default::default()
                },
                sink.clone(),
            );
            let runner = ExperimentRunner::new(ScriptCatalog::embedded(), supervisor, sink.clone());

            let params = ExperimentParams::default();
            let run = runner
                .run_kind(ExperimentKind::CpuStress, &params, &CancellationToken::new())
                .await;

            assert!(matches!(
                run.status,
                RunStatus::Failed { ref reason } if reason.starts_with("spawn failed")
            ));
            assert_eq!(sink.from_source(RUNNER_SOURCE).len(), 2);
        }
    }
}
