//! Chaos agent: a background service that periodically runs fault-injection
//! experiments (memory and CPU stress) on the local machine.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod log_sink;
pub mod probe;
pub mod runner;
pub mod supervisor;

pub use catalog::{ExperimentKind, ExperimentParams, ScriptCatalog};
pub use controller::{
    ControlRequest, ControllerOptions, ServiceController, ServiceHandle, ServiceState,
    ServiceStatus,
};
pub use error::{AgentError, SpawnError};
pub use log_sink::{FanoutSink, FileSink, LogSink, RecordingSink, Severity, SharedSink, TracingSink};
pub use runner::{ExperimentRun, ExperimentRunner, ExperimentTrigger, RunStatus};
pub use supervisor::{ExitOutcome, ProcessSupervisor, SupervisorOptions};
