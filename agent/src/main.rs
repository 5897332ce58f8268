//! Chaos agent daemon
//!
//! Responsibilities:
//! - Load configuration from /etc/chaos-agent/config.toml
//! - Check that the stress tool is installed
//! - Run the configured experiment on every timer tick
//! - Translate host signals into service control requests

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chaos_agent::config::{self, AgentConfig};
use chaos_agent::host;
use chaos_agent::log_sink::{FanoutSink, FileSink, LogFormat, SharedSink, TracingSink};
use chaos_agent::probe::ToolProbe;
use chaos_agent::{
    AgentError, ControllerOptions, ExperimentRunner, ProcessSupervisor, ScriptCatalog,
    ServiceController,
};

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("FATAL: chaos-agent failed: {e:#}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let loaded = config::load_config()?;
    let config = loaded.config;
    init_logging(&config.logging.level, config.logging.format)?;

    info!("========================================");
    info!("  Chaos Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    if loaded.from_file {
        info!("Configuration read from {}", loaded.path.display());
    } else {
        warn!("Config file not found at {}, using defaults", loaded.path.display());
    }
    info!(
        "Configuration loaded: service={}, experiment={}, tick={}s",
        config.service.name, config.experiment.kind, config.service.tick_interval_seconds
    );

    let (file_sink, writer) = FileSink::open(config.logging.file_sink_options());
    let sink: SharedSink = Arc::new(FanoutSink::new(vec![
        Arc::new(file_sink.clone()) as SharedSink,
        Arc::new(TracingSink) as SharedSink,
    ]));

    let result = serve(&config, Arc::clone(&sink)).await;

    file_sink.close();
    if writer.await.is_err() {
        warn!("Log writer task ended abnormally");
    }
    if file_sink.dropped() > 0 {
        warn!("{} log entries were dropped under load", file_sink.dropped());
    }
    result
}

async fn serve(config: &AgentConfig, sink: SharedSink) -> Result<()> {
    let mut catalog = ScriptCatalog::embedded();
    if let Some(dir) = &config.experiment.script_override_dir {
        catalog = catalog
            .load_overrides(Path::new(dir))
            .context("Failed to load script overrides")?;
    }

    let supervisor = ProcessSupervisor::new(config.runner.supervisor_options(), Arc::clone(&sink));
    let runner = ExperimentRunner::new(catalog, supervisor, Arc::clone(&sink));

    let (mut controller, handle, statuses) = ServiceController::new(
        ControllerOptions::from_config(config),
        Arc::new(runner),
        Arc::clone(&sink),
    );
    if config.prerequisite.enabled {
        controller = controller.with_prerequisite(Box::new(ToolProbe::new(
            config.prerequisite.tool_command.clone(),
            config.prerequisite.tool_args.clone(),
            Duration::from_secs(config.prerequisite.probe_timeout_seconds),
        )));
    }

    let reporter = tokio::spawn(host::report_statuses(statuses, config.service.name.clone()));
    let signals = tokio::spawn(async move {
        if let Err(e) = host::forward_signals(handle).await {
            error!("Failed to install signal handlers, shutting down: {e}");
        }
    });

    let outcome = controller.run().await;
    signals.abort();
    let _ = reporter.await;

    match outcome {
        Ok(state) => {
            info!("Chaos agent finished in state {state}");
            Ok(())
        }
        Err(e @ AgentError::PrerequisiteMissing(_)) => Err(e).context("Startup validation failed"),
        Err(e) => Err(e.into()),
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            builder
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .compact()
                .finish(),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
    .context("Failed to set tracing subscriber")?;
    Ok(())
}
