//! Chaos agent configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::ExperimentParams;
use crate::log_sink::{FileSinkOptions, LogFormat};
use crate::supervisor::SupervisorOptions;

const DEFAULT_CONFIG_PATH: &str = "/etc/chaos-agent/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub prerequisite: PrerequisiteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_paused_interval")]
    pub paused_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub accept_pause: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            tick_interval_seconds: default_tick_interval(),
            paused_interval_seconds: default_paused_interval(),
            accept_pause: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub params: ExperimentParams,
    /// Directory with `<kind>.ps1` files replacing the embedded scripts
    pub script_override_dir: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            params: ExperimentParams::default(),
            script_override_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
    pub script_dir: Option<String>,
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            script_dir: None,
            kill_grace_seconds: default_kill_grace(),
            drain_timeout_seconds: default_drain_timeout(),
            capture_lines: default_capture_lines(),
        }
    }
}

impl RunnerConfig {
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            interpreter: self.interpreter.clone(),
            interpreter_args: self.interpreter_args.clone(),
            script_dir: self.script_dir.as_ref().map(PathBuf::from),
            kill_grace: Duration::from_secs(self.kill_grace_seconds),
            drain_timeout: Duration::from_secs(self.drain_timeout_seconds),
            capture_lines: self.capture_lines,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PrerequisiteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tool_command")]
    pub tool_command: String,
    #[serde(default)]
    pub tool_args: Vec<String>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

impl Default for PrerequisiteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_command: default_tool_command(),
            tool_args: Vec::new(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_log_max_size")]
    pub rotation_max_size_mb: u64,
    #[serde(default = "default_log_keep")]
    pub rotation_keep_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            format: LogFormat::default(),
            queue_capacity: default_queue_capacity(),
            rotation_max_size_mb: default_log_max_size(),
            rotation_keep_files: default_log_keep(),
        }
    }
}

impl LoggingConfig {
    pub fn file_sink_options(&self) -> FileSinkOptions {
        FileSinkOptions {
            path: PathBuf::from(&self.file),
            format: self.format,
            queue_capacity: self.queue_capacity,
            max_bytes: self.rotation_max_size_mb.saturating_mul(1024 * 1024),
            keep_files: self.rotation_keep_files,
        }
    }
}

// Default value functions
fn default_name() -> String { "chaos".into() }
fn default_tick_interval() -> u64 { 10 }
fn default_paused_interval() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_kind() -> String { "memory-stress".into() }
fn default_interpreter() -> String { "pwsh".into() }
fn default_interpreter_args() -> Vec<String> {
    vec!["-NoProfile".into(), "-NonInteractive".into(), "-File".into()]
}
fn default_kill_grace() -> u64 { 5 }
fn default_drain_timeout() -> u64 { 5 }
fn default_capture_lines() -> usize { 200 }
fn default_tool_command() -> String { "Testlimit".into() }
fn default_probe_timeout() -> u64 { 10 }
fn default_log_level() -> String { "info".into() }
fn default_log_file() -> String { "/var/log/chaos-agent/agent.log".into() }
fn default_queue_capacity() -> usize { 100 }
fn default_log_max_size() -> u64 { 10 }
fn default_log_keep() -> u32 { 5 }

/// A loaded configuration and where it came from.
///
/// Loading happens before logging is set up, so the caller reports
/// `from_file` once a subscriber exists.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: AgentConfig,
    pub path: PathBuf,
    pub from_file: bool,
}

/// Load configuration from `CHAOS_AGENT_CONFIG` or /etc/chaos-agent/config.toml
pub fn load_config() -> Result<LoadedConfig> {
    let config_path =
        std::env::var("CHAOS_AGENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&config_path))
}

pub fn load_config_from(path: &Path) -> Result<LoadedConfig> {
    let from_file = path.exists();
    let config = if from_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?
    } else {
        AgentConfig::default()
    };
    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        from_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.service.tick_interval_seconds, 10);
        assert_eq!(config.experiment.kind, "memory-stress");
        assert_eq!(config.experiment.params.memory_percentage, 50);
        assert_eq!(config.experiment.params.duration_secs.get(), 60);
        assert_eq!(config.prerequisite.tool_command, "Testlimit");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[service]
tick_interval_seconds = 30

[experiment]
kind = "cpu-stress"
cpu_percentage = 80
cpu_cores = 4
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.service.tick_interval_seconds, 30);
        assert_eq!(config.service.paused_interval_seconds, 300);
        assert_eq!(config.experiment.kind, "cpu-stress");
        assert_eq!(config.experiment.params.cpu_percentage, 80);
        assert_eq!(config.experiment.params.cpu_cores.get(), 4);
        assert_eq!(config.experiment.params.duration_secs.get(), 60);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[service]
name = "chaos"
tick_interval_seconds = 10
paused_interval_seconds = 600
accept_pause = false

[experiment]
kind = "memory-stress"
memory_percentage = 50
testlimit_path = "C:\\HCE\\Testlimit"
duration_secs = 120
script_override_dir = "/etc/chaos-agent/scripts"

[runner]
interpreter = "powershell"
interpreter_args = ["-ExecutionPolicy", "Bypass", "-File"]
script_dir = "/var/lib/chaos-agent/tmp"
kill_grace_seconds = 2
capture_lines = 50

[prerequisite]
enabled = true
tool_command = "testlimit64"
tool_args = ["-accepteula"]

[logging]
level = "debug"
file = "/tmp/agent.log"
format = "json"
queue_capacity = 500
rotation_max_size_mb = 1
rotation_keep_files = 2
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.service.accept_pause);
        assert_eq!(config.experiment.params.testlimit_path, "C:\\HCE\\Testlimit");
        assert_eq!(config.experiment.params.duration_secs.get(), 120);

        let options = config.runner.supervisor_options();
        assert_eq!(options.interpreter, "powershell");
        assert_eq!(options.kill_grace, Duration::from_secs(2));
        assert_eq!(options.script_dir, Some(PathBuf::from("/var/lib/chaos-agent/tmp")));

        let sink = config.logging.file_sink_options();
        assert_eq!(sink.format, LogFormat::Json);
        assert_eq!(sink.max_bytes, 1024 * 1024);
        assert_eq!(config.prerequisite.tool_args, vec!["-accepteula"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let loaded = load_config_from(&path).unwrap();
        assert!(!loaded.from_file);
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.config.service.name, "chaos");
    }

    #[test]
    fn test_existing_file_is_marked_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[service]\ntick_interval_seconds = 5\n").unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert!(loaded.from_file);
        assert_eq!(loaded.config.service.tick_interval_seconds, 5);
    }

    #[test]
    fn test_rotation_size_saturates() {
        let logging = LoggingConfig {
            rotation_max_size_mb: u64::MAX,
            ..Default::default()
        };
        assert_eq!(logging.file_sink_options().max_bytes, u64::MAX);
    }

    #[test]
    fn test_zero_cores_or_duration_rejected() {
        for field in ["cpu_cores = 0", "duration_secs = 0"] {
            let toml_str = format!("[experiment]\nkind = \"cpu-stress\"\n{field}\n");
            assert!(toml::from_str::<AgentConfig>(&toml_str).is_err(), "{field} accepted");
        }
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[service\ntick = ").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
