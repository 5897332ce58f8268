//! Process supervisor: owns one external process from spawn to reap
//!
//! The script body is written to a transient file that lives exactly as long
//! as the call. Output is streamed line by line to the log sink while the
//! process runs. On cancellation the child's process group gets SIGTERM,
//! then SIGKILL after a grace period, and the child is always reaped before
//! `run` returns.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SpawnError;
use crate::log_sink::{Severity, SharedSink};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Program that executes the script, e.g. `pwsh`
    pub interpreter: String,
    /// Arguments placed before the script path
    pub interpreter_args: Vec<String>,
    /// Directory for transient script files; the system temp dir when unset
    pub script_dir: Option<PathBuf>,
    /// How long a cancelled child gets between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Upper bound on waiting for output readers after the child is gone
    pub drain_timeout: Duration,
    /// Number of trailing output lines kept in the capture
    pub capture_lines: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            interpreter: "pwsh".to_string(),
            interpreter_args: vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-File".to_string(),
            ],
            script_dir: None,
            kill_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            capture_lines: 200,
        }
    }
}

/// What to run: a script body plus its arguments
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Source tag for streamed output lines
    pub label: &'a str,
    /// Logical file name; its extension is kept on the transient copy
    pub file_name: &'a str,
    pub content: &'a str,
    pub args: &'a [String],
}

/// How the supervised process ended
#[derive(Debug)]
pub enum ExitOutcome {
    Success,
    NonZeroExit(i32),
    SpawnFailed(SpawnError),
    Killed,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => f.write_str("exited successfully"),
            ExitOutcome::NonZeroExit(code) => write!(f, "exited with code {code}"),
            ExitOutcome::SpawnFailed(e) => write!(f, "spawn failed: {e}"),
            ExitOutcome::Killed => f.write_str("killed on cancellation"),
        }
    }
}

/// Trailing lines of a process's combined output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    lines: VecDeque<String>,
    max_lines: usize,
    truncated: bool,
}

impl CapturedOutput {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines,
            truncated: false,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.max_lines == 0 {
            self.truncated = true;
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.truncated = true;
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// True when earlier lines were discarded
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug)]
pub struct SupervisedRun {
    pub output: CapturedOutput,
    pub outcome: ExitOutcome,
}

type SharedCapture = Arc<Mutex<CapturedOutput>>;

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    sink: SharedSink,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions, sink: SharedSink) -> Self {
        Self { options, sink }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Run one script to completion or until `cancel` fires.
    ///
    /// Never returns while the child is still alive.
    pub async fn run(
        &self,
        invocation: Invocation<'_>,
        cancel: &CancellationToken,
    ) -> SupervisedRun {
        let capture: SharedCapture =
            Arc::new(Mutex::new(CapturedOutput::new(self.options.capture_lines)));

        let script = match self.materialize(invocation.file_name, invocation.content) {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to materialize {}: {e}", invocation.file_name);
                return SupervisedRun {
                    output: CapturedOutput::new(self.options.capture_lines),
                    outcome: ExitOutcome::SpawnFailed(SpawnError::ScriptMaterialization(e)),
                };
            }
        };

        let mut child = match self.command(&script, invocation.args).spawn() {
            Ok(child) => child,
            Err(source) => {
                let error = SpawnError::Spawn {
                    program: self.options.interpreter.clone(),
                    source,
                };
                self.sink.write(
                    invocation.label,
                    &format!("error starting script: {error}"),
                    Severity::Error,
                );
                return SupervisedRun {
                    output: CapturedOutput::new(self.options.capture_lines),
                    outcome: ExitOutcome::SpawnFailed(error),
                };
            }
        };
        debug!(label = invocation.label, pid = child.id(), "Script process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(
                stdout,
                invocation.label.to_string(),
                Severity::Info,
                &capture,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(
                stderr,
                format!("{}:stderr", invocation.label),
                Severity::Warning,
                &capture,
            ));
        }

        let outcome = tokio::select! {
            biased;
            status = child.wait() => match status {
                Ok(status) => classify(status),
                Err(e) => {
                    error!(label = invocation.label, "Failed waiting on script process: {e}");
                    if let Err(e) = child.kill().await {
                        warn!(label = invocation.label, "Failed to kill script process: {e}");
                    }
                    ExitOutcome::NonZeroExit(-1)
                }
            },
            _ = cancel.cancelled() => {
                self.terminate(&mut child, invocation.label).await;
                ExitOutcome::Killed
            }
        };

        self.drain(readers, invocation.label).await;
        drop(script);

        let output = capture.lock().map(|c| c.clone()).unwrap_or_default();
        SupervisedRun { output, outcome }
    }

    fn materialize(&self, file_name: &str, content: &str) -> std::io::Result<TempPath> {
        let suffix = Path::new(file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut builder = tempfile::Builder::new();
        builder.prefix("script-").suffix(&suffix);
        let mut file = match &self.options.script_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    fn command(&self, script: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.options.interpreter);
        cmd.args(&self.options.interpreter_args)
            .arg(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so stress workers spawned by the script are
        // signaled together with it.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn_reader<R>(
        &self,
        stream: R,
        tag: String,
        severity: Severity,
        capture: &SharedCapture,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        let capture = Arc::clone(capture);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        sink.write(&tag, line, severity);
                        if let Ok(mut capture) = capture.lock() {
                            capture.push(line.to_string());
                        }
                    }
                    Err(e) => {
                        warn!(source = %tag, "Output stream read failed: {e}");
                        break;
                    }
                }
            }
        })
    }

    async fn terminate(&self, child: &mut Child, label: &str) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            info!(label, pid, "Cancelling script process (SIGTERM)");
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            match tokio::time::timeout(self.options.kill_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(label, pid, "Script process exited after SIGTERM: {status}");
                }
                Ok(Err(e)) => warn!(label, pid, "Failed waiting on script process: {e}"),
                Err(_) => warn!(
                    label,
                    pid,
                    "Script process still alive after {:?}, sending SIGKILL",
                    self.options.kill_grace
                ),
            }
            // The group outlives its leader while workers remain in it.
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        // Kills if still running, then reaps.
        if let Err(e) = child.kill().await {
            warn!(label, "Kill failed, waiting for exit: {e}");
            if let Err(e) = child.wait().await {
                error!(label, "Failed to reap script process: {e}");
            }
        }
        info!(label, "Script process reaped");
    }

    async fn drain(&self, readers: Vec<JoinHandle<()>>, label: &str) {
        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                warn!(label, "Output still open after process exit, abandoning reader");
                abort.abort();
            }
        }
    }
}

fn classify(status: ExitStatus) -> ExitOutcome {
    if status.success() {
        ExitOutcome::Success
    } else {
        ExitOutcome::NonZeroExit(status.code().unwrap_or(-1))
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, "Failed to send {signal} to process group: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_keeps_tail() {
        let mut capture = CapturedOutput::new(2);
        capture.push("one".into());
        capture.push("two".into());
        assert!(!capture.truncated());
        capture.push("three".into());
        assert!(capture.truncated());
        assert_eq!(capture.text(), "two\nthree");
    }

    #[test]
    fn test_capture_zero_lines() {
        let mut capture = CapturedOutput::new(0);
        capture.push("dropped".into());
        assert!(capture.is_empty());
        assert!(capture.truncated());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ExitOutcome::NonZeroExit(3).to_string(), "exited with code 3");
        assert_eq!(ExitOutcome::Killed.to_string(), "killed on cancellation");
    }

    #[test]
    fn test_default_options_use_pwsh_file_mode() {
        let options = SupervisorOptions::default();
        assert_eq!(options.interpreter, "pwsh");
        assert_eq!(options.interpreter_args.last().map(String::as_str), Some("-File"));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use crate::log_sink::RecordingSink;

        fn supervisor(dir: &Path, sink: Arc<RecordingSink>) -> ProcessSupervisor {
            ProcessSupervisor::new(
                SupervisorOptions {
                    interpreter: "sh".into(),
                    interpreter_args: vec![],
                    script_dir: Some(dir.to_path_buf()),
                    kill_grace: Duration::from_secs(5),
                    drain_timeout: Duration::from_secs(2),
                    capture_lines: 50,
                },
                sink,
            )
        }

        fn invocation<'a>(content: &'a str, args: &'a [String]) -> Invocation<'a> {
            Invocation {
                label: "test-script",
                file_name: "test.sh",
                content,
                args,
            }
        }

        fn dir_is_empty(dir: &Path) -> bool {
            std::fs::read_dir(dir).unwrap().next().is_none()
        }

        #[tokio::test]
        async fn test_success_streams_output() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let sup = supervisor(dir.path(), sink.clone());
            let args = vec!["first".to_string()];

            let script = "echo \"hello $1\"\necho oops >&2\n";
            let run = sup
                .run(invocation(script, &args), &CancellationToken::new())
                .await;

            assert!(matches!(run.outcome, ExitOutcome::Success));
            assert!(run.output.lines().any(|l| l == "hello first"));
            assert!(run.output.lines().any(|l| l == "oops"));
            assert_eq!(sink.from_source("test-script")[0].message, "hello first");
            assert_eq!(sink.from_source("test-script:stderr")[0].severity, Severity::Warning);
            assert!(dir_is_empty(dir.path()));
        }

        #[tokio::test]
        async fn test_nonzero_exit() {
            let dir = tempfile::tempdir().unwrap();
            let sup = supervisor(dir.path(), Arc::new(RecordingSink::new()));

            let run = sup
                .run(invocation("echo failing\nexit 3\n", &[]), &CancellationToken::new())
                .await;

            assert!(matches!(run.outcome, ExitOutcome::NonZeroExit(3)));
            assert_eq!(run.output.text(), "failing");
            assert!(dir_is_empty(dir.path()));
        }

        #[tokio::test]
        async fn test_spawn_failure_cleans_up() {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(RecordingSink::new());
            let mut sup = supervisor(dir.path(), sink.clone());
            sup.options.interpreter = "/nonexistent/interpreter".into();

            let run = sup.run(invocation("echo never", &[]), &CancellationToken::new()).await;

            assert!(matches!(run.outcome, ExitOutcome::SpawnFailed(SpawnError::Spawn { .. })));
            assert!(run.output.is_empty());
            assert_eq!(sink.from_source("test-script")[0].severity, Severity::Error);
            assert!(dir_is_empty(dir.path()));
        }

        #[tokio::test]
        async fn test_materialization_failure() {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("missing");
            let mut sup = supervisor(dir.path(), Arc::new(RecordingSink::new()));
            sup.options.script_dir = Some(missing);

            let run = sup.run(invocation("echo never", &[]), &CancellationToken::new()).await;

            assert!(matches!(
                run.outcome,
                ExitOutcome::SpawnFailed(SpawnError::ScriptMaterialization(_))
            ));
        }
    }
}
