use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use infra_harness::Harness;
use infra_harness::panel::{PanelState, create_router};
use infra_harness::process::StopAction;
use infra_harness::telemetry::{self, ServiceTelemetry};
use tokio::net::TcpListener;
use tokio::task;
use tracing::{info, warn};

const SERVICE: &str = "harness-panel";

#[derive(Parser, Debug)]
#[command(name = "harness-panel", version, about = "HTTP control panel for infrastructure benchmark runs", long_about = None)]
struct Args {
    /// Override path to the harness config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override listen address (host:port)
    #[arg(long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received; stopping harness panel");
}

async fn serve(harness: &Harness, telemetry: ServiceTelemetry, listen: &str) -> Result<()> {
    let listen_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let state = PanelState::from_harness(harness, telemetry)?;
    let router = create_router(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind panel listener at {listen_addr}"))?;
    info!(addr = %listen_addr, "starting harness panel");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("harness panel terminated unexpectedly")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let harness = Harness::bootstrap(args.config.clone())?;
    let settings = harness.settings();

    if let Err(err) = telemetry::init_tracing(SERVICE, args.verbose, &settings.telemetry) {
        eprintln!("warning: failed to initialise {SERVICE} tracing: {err}");
    }

    let service_telemetry = ServiceTelemetry::new(SERVICE, &settings.telemetry);
    service_telemetry.record_startup();

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| settings.panel.listen_addr.clone());
    let result = serve(&harness, service_telemetry.clone(), &listen).await;

    let processes = harness.processes();
    match task::spawn_blocking(move || processes.stop_all()).await {
        Ok(outcomes) => {
            let stopped = outcomes
                .iter()
                .filter(|outcome| outcome.action == StopAction::Stopped)
                .count();
            info!(stopped, "stopped running jobs");
        }
        Err(err) => warn!(error = %err, "failed to stop running jobs"),
    }

    match &result {
        Ok(()) => service_telemetry.record_shutdown(),
        Err(err) => service_telemetry.record_error(err),
    }
    result
}
