//! Service controller: lifecycle state machine and experiment scheduling
//!
//! A single task owns the loop. It waits on the next control request, the
//! next timer tick, or completion of the experiment in flight. The in-flight
//! run is a future polled by this same loop, so control requests stay
//! responsive during a run while a single slot keeps at most one run alive.
//!
//! State flow: `StartPending → Running ⇄ Paused → StopPending → Stopped`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::ExperimentParams;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::log_sink::{Severity, SharedSink};
use crate::probe::Prerequisite;
use crate::runner::{ExperimentRun, ExperimentTrigger};

/// Source tag for lifecycle entries
pub const SERVICE_SOURCE: &str = "Service";
/// Source tag for startup validation entries
pub const VALIDATION_SOURCE: &str = "PreHookValidation";

const CONTROL_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    Paused,
    StopPending,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::StartPending => "StartPending",
            ServiceState::Running => "Running",
            ServiceState::Paused => "Paused",
            ServiceState::StopPending => "StopPending",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Acknowledgment reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub accepts_stop: bool,
    pub accepts_pause: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Interrogate,
    Stop,
    Shutdown,
    Pause,
    Continue,
    /// Any request code the controller does not understand
    Unknown(u32),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub tick_interval: Duration,
    pub paused_interval: Duration,
    pub accept_pause: bool,
    pub kind: String,
    pub params: ExperimentParams,
}

impl ControllerOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.service.tick_interval_seconds.max(1)),
            paused_interval: Duration::from_secs(config.service.paused_interval_seconds.max(1)),
            accept_pause: config.service.accept_pause,
            kind: config.experiment.kind.clone(),
            params: config.experiment.params.clone(),
        }
    }
}

/// Host-facing side of the controller
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ControlRequest>,
}

pub type SendResult = Result<(), mpsc::error::SendError<ControlRequest>>;

impl ServiceHandle {
    pub async fn send(&self, request: ControlRequest) -> SendResult {
        self.tx.send(request).await
    }

    pub async fn interrogate(&self) -> SendResult {
        self.send(ControlRequest::Interrogate).await
    }

    pub async fn stop(&self) -> SendResult {
        self.send(ControlRequest::Stop).await
    }

    pub async fn shutdown(&self) -> SendResult {
        self.send(ControlRequest::Shutdown).await
    }

    pub async fn pause(&self) -> SendResult {
        self.send(ControlRequest::Pause).await
    }

    pub async fn resume(&self) -> SendResult {
        self.send(ControlRequest::Continue).await
    }
}

type InFlight = Pin<Box<dyn Future<Output = Result<ExperimentRun, AgentError>> + Send>>;

pub struct ServiceController {
    options: ControllerOptions,
    trigger: Arc<dyn ExperimentTrigger>,
    prerequisites: Vec<Box<dyn Prerequisite>>,
    sink: SharedSink,
    requests: mpsc::Receiver<ControlRequest>,
    status_tx: mpsc::UnboundedSender<ServiceStatus>,
    state: ServiceState,
    cancel: CancellationToken,
    runs_started: u64,
    ticks_skipped: u64,
}

impl ServiceController {
    pub fn new(
        options: ControllerOptions,
        trigger: Arc<dyn ExperimentTrigger>,
        sink: SharedSink,
    ) -> (Self, ServiceHandle, mpsc::UnboundedReceiver<ServiceStatus>) {
        let (tx, requests) = mpsc::channel(CONTROL_QUEUE);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let controller = Self {
            options,
            trigger,
            prerequisites: Vec::new(),
            sink,
            requests,
            status_tx,
            state: ServiceState::StartPending,
            cancel: CancellationToken::new(),
            runs_started: 0,
            ticks_skipped: 0,
        };
        (controller, ServiceHandle { tx }, status_rx)
    }

    pub fn with_prerequisite(mut self, prerequisite: Box<dyn Prerequisite>) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Run the service until a stop request, returning the final state.
    ///
    /// Fails only when a prerequisite is missing, in which case the service
    /// never enters `Running`.
    pub async fn run(mut self) -> Result<ServiceState, AgentError> {
        self.set_state(ServiceState::StartPending);
        self.sink.write(SERVICE_SOURCE, "Service is starting", Severity::Info);

        for prerequisite in &self.prerequisites {
            debug!("Checking prerequisite: {}", prerequisite.name());
            if let Err(e) = prerequisite.check().await {
                self.sink.write(
                    VALIDATION_SOURCE,
                    &format!("All the prerequisites are not met: {e}"),
                    Severity::Error,
                );
                self.state = ServiceState::Stopped;
                self.report();
                return Err(e);
            }
        }

        self.set_state(ServiceState::Running);
        let mut ticker = tick_timer(self.options.tick_interval);
        let mut in_flight: Option<InFlight> = None;

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let request = request.unwrap_or(ControlRequest::Shutdown);
                    match request {
                        ControlRequest::Stop | ControlRequest::Shutdown => {
                            self.stop(request, in_flight.take()).await;
                            return Ok(self.state);
                        }
                        other => {
                            if let Some(period) = self.handle_request(other) {
                                ticker = tick_timer(period);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        self.ticks_skipped += 1;
                        self.sink.write(
                            SERVICE_SOURCE,
                            "Timer tick skipped: an experiment is still running",
                            Severity::Info,
                        );
                    } else {
                        in_flight = Some(self.start_run());
                    }
                }
                result = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.finish_run(result);
                }
            }
        }
    }

    /// Handle a non-stop request; returns the new tick period when the
    /// cadence changes.
    fn handle_request(&mut self, request: ControlRequest) -> Option<Duration> {
        match request {
            ControlRequest::Interrogate => {
                self.report();
                None
            }
            ControlRequest::Pause if self.options.accept_pause => {
                if self.state == ServiceState::Paused {
                    self.report();
                    return None;
                }
                self.sink.write(SERVICE_SOURCE, "Service is pausing", Severity::Info);
                self.set_state(ServiceState::Paused);
                Some(self.options.paused_interval)
            }
            ControlRequest::Continue if self.options.accept_pause => {
                if self.state == ServiceState::Running {
                    self.report();
                    return None;
                }
                self.sink.write(SERVICE_SOURCE, "Service is continuing", Severity::Info);
                self.set_state(ServiceState::Running);
                Some(self.options.tick_interval)
            }
            other => {
                self.sink.write(
                    SERVICE_SOURCE,
                    &format!("unexpected control request {other:?}"),
                    Severity::Error,
                );
                None
            }
        }
    }

    fn start_run(&mut self) -> InFlight {
        self.runs_started += 1;
        debug!(kind = %self.options.kind, "Triggering experiment #{}", self.runs_started);
        let trigger = Arc::clone(&self.trigger);
        let kind = self.options.kind.clone();
        let params = self.options.params.clone();
        let cancel = self.cancel.clone();
        Box::pin(async move { trigger.trigger(&kind, &params, &cancel).await })
    }

    fn finish_run(&self, result: Result<ExperimentRun, AgentError>) {
        match result {
            Ok(run) => {
                debug!(id = %run.id, kind = %run.kind, "Experiment finished: {}", run.status)
            }
            Err(e) => self.sink.write(
                SERVICE_SOURCE,
                &format!("error executing experiment: {e}"),
                Severity::Error,
            ),
        }
    }

    async fn stop(&mut self, request: ControlRequest, in_flight: Option<InFlight>) {
        info!("Received {request:?}");
        self.sink.write(SERVICE_SOURCE, "Service is stopping", Severity::Info);
        self.set_state(ServiceState::StopPending);
        self.cancel.cancel();

        if let Some(run) = in_flight {
            info!("Waiting for the running experiment to unwind");
            let result = run.await;
            self.finish_run(result);
        }

        self.set_state(ServiceState::Stopped);
        self.sink.write(
            SERVICE_SOURCE,
            &format!(
                "Service stopped ({} experiments started, {} ticks skipped)",
                self.runs_started, self.ticks_skipped
            ),
            Severity::Info,
        );
    }

    fn set_state(&mut self, state: ServiceState) {
        if self.state != state {
            info!("Service state: {} -> {}", self.state, state);
        }
        self.state = state;
        self.report();
    }

    fn report(&self) {
        let active = matches!(self.state, ServiceState::Running | ServiceState::Paused);
        let status = ServiceStatus {
            state: self.state,
            accepts_stop: active,
            accepts_pause: active && self.options.accept_pause,
        };
        // The host may have stopped listening; the loop does not depend on it.
        let _ = self.status_tx.send(status);
    }
}

fn tick_timer(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn wait_in_flight(slot: &mut Option<InFlight>) -> Result<ExperimentRun, AgentError> {
    match slot {
        Some(run) => run.await,
        None => std::future::pending().await,
    }
}
