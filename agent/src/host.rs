//! Host binding: turns process signals into control requests and reports
//! controller status back
//!
//! | signal  | request     |
//! |---------|-------------|
//! | SIGTERM | Stop        |
//! | SIGINT  | Shutdown    |
//! | SIGUSR1 | Pause       |
//! | SIGUSR2 | Continue    |
//! | SIGHUP  | Interrogate |

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::controller::{ControlRequest, ServiceHandle, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Terminate,
    Interrupt,
    User1,
    User2,
    Hangup,
}

impl HostSignal {
    pub fn request(self) -> ControlRequest {
        match self {
            HostSignal::Terminate => ControlRequest::Stop,
            HostSignal::Interrupt => ControlRequest::Shutdown,
            HostSignal::User1 => ControlRequest::Pause,
            HostSignal::User2 => ControlRequest::Continue,
            HostSignal::Hangup => ControlRequest::Interrogate,
        }
    }
}

/// Forward host signals to the controller until it stops listening
#[cfg(unix)]
pub async fn forward_signals(handle: ServiceHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        let received = tokio::select! {
            _ = sigterm.recv() => HostSignal::Terminate,
            _ = sigint.recv() => HostSignal::Interrupt,
            _ = sigusr1.recv() => HostSignal::User1,
            _ = sigusr2.recv() => HostSignal::User2,
            _ = sighup.recv() => HostSignal::Hangup,
        };
        info!("Received {received:?}, requesting {:?}", received.request());
        if handle.send(received.request()).await.is_err() {
            debug!("Controller no longer accepts requests");
            return Ok(());
        }
    }
}

/// Ctrl-C is the only control available off unix; it stops the service.
#[cfg(not(unix))]
pub async fn forward_signals(handle: ServiceHandle) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, requesting Stop");
    let _ = handle.stop().await;
    Ok(())
}

/// Log every status the controller reports, until it finishes
pub async fn report_statuses(
    mut statuses: mpsc::UnboundedReceiver<ServiceStatus>,
    service: String,
) {
    while let Some(status) = statuses.recv().await {
        info!(
            service = %service,
            accepts_stop = status.accepts_stop,
            accepts_pause = status.accepts_pause,
            "Service status: {}",
            status.state
        );
    }
}
