//! Startup prerequisite checks

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;

/// A condition that must hold before the service enters `Running`
#[async_trait]
pub trait Prerequisite: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), AgentError>;
}

/// Checks that an external tool can be launched.
///
/// The tool counts as available as soon as it starts; its exit status is
/// only logged. A tool that keeps running past the timeout is killed.
pub struct ToolProbe {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolProbe {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Prerequisite for ToolProbe {
    fn name(&self) -> &str {
        &self.command
    }

    async fn check(&self) -> Result<(), AgentError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::PrerequisiteMissing(format!(
                    "{} is not available on the machine: {e}",
                    self.command
                ))
            })?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(tool = %self.command, "Probe exited: {status}"),
            Ok(Err(e)) => warn!(tool = %self.command, "Failed waiting on probe: {e}"),
            Err(_) => {
                debug!(
                    tool = %self.command,
                    "Probe still running after {:?}, killing it",
                    self.timeout
                );
                if let Err(e) = child.kill().await {
                    warn!(tool = %self.command, "Failed to kill probe: {e}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool() {
        let probe = ToolProbe::new("/nonexistent/Testlimit", vec![], Duration::from_secs(1));
        match probe.check().await {
            Err(AgentError::PrerequisiteMissing(msg)) => {
                assert!(msg.contains("/nonexistent/Testlimit"))
            }
            other => panic!("expected PrerequisiteMissing, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_available_even_with_nonzero_exit() {
        let args = vec!["-c".into(), "exit 1".into()];
        let probe = ToolProbe::new("sh", args, Duration::from_secs(5));
        assert!(probe.check().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_long_running_probe_is_killed() {
        let probe = ToolProbe::new("sleep", vec!["30".into()], Duration::from_millis(100));
        let started = std::time::Instant::now();
        assert!(probe.check().await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
