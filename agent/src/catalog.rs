//! Script catalog: maps an experiment kind to its script and argument contract
//!
//! Scripts are embedded at compile time. A catalog can carry per-kind
//! overrides read from disk; an override replaces the script body only, the
//! argument contract stays fixed by the kind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::AgentError;

const MEMORY_STRESS_SCRIPT: &str = include_str!("../scripts/memory-stress.ps1");
const CPU_STRESS_SCRIPT: &str = include_str!("../scripts/cpu-stress.ps1");

/// The closed set of experiments this agent knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentKind {
    MemoryStress,
    CpuStress,
}

impl ExperimentKind {
    pub const ALL: [ExperimentKind; 2] = [ExperimentKind::MemoryStress, ExperimentKind::CpuStress];

    pub fn name(self) -> &'static str {
        match self {
            ExperimentKind::MemoryStress => "memory-stress",
            ExperimentKind::CpuStress => "cpu-stress",
        }
    }

    pub fn script_file_name(self) -> &'static str {
        match self {
            ExperimentKind::MemoryStress => "memory-stress.ps1",
            ExperimentKind::CpuStress => "cpu-stress.ps1",
        }
    }

    fn embedded_script(self) -> &'static str {
        match self {
            ExperimentKind::MemoryStress => MEMORY_STRESS_SCRIPT,
            ExperimentKind::CpuStress => CPU_STRESS_SCRIPT,
        }
    }

    /// Build the script arguments for this kind.
    ///
    /// Values are passed through as given. Range checks on percentages are
    /// left to the script itself.
    pub fn build_args(self, params: &ExperimentParams) -> Vec<String> {
        match self {
            ExperimentKind::MemoryStress => vec![
                "-MemoryInPercentage".to_string(),
                params.memory_percentage.to_string(),
                "-PathOfTestlimit".to_string(),
                params.testlimit_path.clone(),
                "-Duration".to_string(),
                params.duration_secs.to_string(),
            ],
            ExperimentKind::CpuStress => vec![
                "-CPUPercentage".to_string(),
                params.cpu_percentage.to_string(),
                "-CPU".to_string(),
                params.cpu_cores.to_string(),
                "-Duration".to_string(),
                params.duration_secs.to_string(),
            ],
        }
    }

    /// Percentages for this kind that fall outside 0-100.
    pub fn out_of_range(self, params: &ExperimentParams) -> Vec<(&'static str, u32)> {
        let checked: &[(&'static str, u32)] = match self {
            ExperimentKind::MemoryStress => &[("MemoryInPercentage", params.memory_percentage)],
            ExperimentKind::CpuStress => &[("CPUPercentage", params.cpu_percentage)],
        };
        checked.iter().copied().filter(|(_, v)| *v > 100).collect()
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExperimentKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExperimentKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| AgentError::UnknownKind(s.to_string()))
    }
}

/// Parameters for one experiment. Fields a kind does not use are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentParams {
    #[serde(default = "default_memory_percentage")]
    pub memory_percentage: u32,
    #[serde(default = "default_cpu_percentage")]
    pub cpu_percentage: u32,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: NonZeroU32,
    #[serde(default = "default_testlimit_path")]
    pub testlimit_path: String,
    #[serde(default = "default_duration")]
    pub duration_secs: NonZeroU64,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            memory_percentage: default_memory_percentage(),
            cpu_percentage: default_cpu_percentage(),
            cpu_cores: default_cpu_cores(),
            testlimit_path: default_testlimit_path(),
            duration_secs: default_duration(),
        }
    }
}

fn default_memory_percentage() -> u32 { 50 }
fn default_cpu_percentage() -> u32 { 50 }
fn default_cpu_cores() -> NonZeroU32 { NonZeroU32::MIN }
fn default_testlimit_path() -> String { "C:\\HCE\\Testlimit".into() }
fn default_duration() -> NonZeroU64 { DEFAULT_DURATION }

const DEFAULT_DURATION: NonZeroU64 = match NonZeroU64::new(60) {
    Some(secs) => secs,
    None => unreachable!(),
};

/// A resolved catalog entry: what to write to disk and how to call it
#[derive(Debug, Clone)]
pub struct ScriptEntry<'a> {
    pub kind: ExperimentKind,
    pub file_name: &'static str,
    pub content: &'a str,
}

impl ScriptEntry<'_> {
    pub fn build_args(&self, params: &ExperimentParams) -> Vec<String> {
        self.kind.build_args(params)
    }
}

/// Catalog of experiment scripts
#[derive(Debug, Clone, Default)]
pub struct ScriptCatalog {
    overrides: HashMap<ExperimentKind, String>,
}

impl ScriptCatalog {
    /// Catalog backed only by the embedded scripts
    pub fn embedded() -> Self {
        Self::default()
    }

    /// Replace the script body for one kind
    pub fn with_override(mut self, kind: ExperimentKind, content: impl Into<String>) -> Self {
        self.overrides.insert(kind, content.into());
        self
    }

    /// Load `<dir>/<script file name>` for every kind that has one on disk.
    pub fn load_overrides(mut self, dir: &Path) -> Result<Self, AgentError> {
        for kind in ExperimentKind::ALL {
            let path = dir.join(kind.script_file_name());
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|source| AgentError::ScriptOverride { path: path.clone(), source })?;
            info!("Using script override for {kind}: {}", path.display());
            self.overrides.insert(kind, content);
        }
        Ok(self)
    }

    pub fn entry(&self, kind: ExperimentKind) -> ScriptEntry<'_> {
        let content = self
            .overrides
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.embedded_script());
        ScriptEntry {
            kind,
            file_name: kind.script_file_name(),
            content,
        }
    }

    /// Resolve a logical experiment name, failing with `UnknownKind`
    pub fn resolve(&self, name: &str) -> Result<ScriptEntry<'_>, AgentError> {
        let kind = name.parse::<ExperimentKind>()?;
        Ok(self.entry(kind))
    }
}
