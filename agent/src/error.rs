//! Error taxonomy for the chaos agent
//!
//! Only [`AgentError::PrerequisiteMissing`] is fatal to the service. Every
//! other condition is absorbed at the runner boundary and turned into a
//! failed or cancelled experiment run.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("unknown experiment kind: {0}")]
    UnknownKind(String),

    #[error("failed to load script override {path}: {source}")]
    ScriptOverride {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a child process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to materialize script: {0}")]
    ScriptMaterialization(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}
