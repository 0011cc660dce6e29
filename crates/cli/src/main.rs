//! cloudcore – runs the hub, the edge controller and the device controller in one process.

#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kedge_bus::MessageBus;
use kedge_controller::EdgeController;
use kedge_devicetwin::DeviceController;
use kedge_hub::{Hub, HubEventKind};
use kedge_ops::KubeStore;
use kedge_registry::{ModuleExit, Registry};
use kedge_store::LocationCache;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod args;

use args::Cli;

fn init_tracing() {
    let env = std::env::var("CLOUDCORE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CLOUDCORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CLOUDCORE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "cloudcore failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    cli.validate()?;
    let hub_config = cli.hub.config();
    hub_config.validate().context("invalid hub configuration")?;
    let tls = kedge_hub::load_server_config(&cli.hub.tls_files()).context("loading hub TLS material")?;

    let client = kedge_kubehub::client(&cli.kube.settings()).await?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let bus = MessageBus::new(cli.channels.module_inbox);
    for name in cli.bus_modules() {
        bus.register_with_capacity(&name, cli.channels.module_inbox)
            .with_context(|| format!("registering bus module {name}"))?;
    }

    let hub = Arc::new(Hub::new(hub_config, tls, bus.clone()));
    tokio::spawn(log_hub_events(hub.subscribe()));
    let location = Arc::new(LocationCache::new());
    let edge = EdgeController::new(client.clone(), store.clone(), bus.clone(), location, cli.controller_config());
    let devices = DeviceController::new(client, store, bus, cli.device_config());

    let mut registry = Registry::new(CancellationToken::new());
    registry.register(hub)?;
    registry.register(Arc::new(edge))?;
    registry.register(Arc::new(devices))?;
    let running = registry.start();

    shutdown_signal().await;
    info!("shutdown requested");
    for (module, exit) in running.shutdown().await {
        match exit {
            ModuleExit::Completed => {}
            other => warn!(module = %module, exit = ?other, "module did not stop cleanly"),
        }
    }
    info!("cloudcore stopped");
    Ok(())
}

async fn log_hub_events(mut events: broadcast::Receiver<kedge_hub::HubEvent>) {
    loop {
        match events.recv().await {
            Ok(ev) => match ev.kind {
                HubEventKind::Connected => info!(node = %ev.node_id, project = %ev.project_id, "edge node connected"),
                HubEventKind::Disconnected => {
                    info!(node = %ev.node_id, project = %ev.project_id, reason = ev.reason.unwrap_or("unknown"), "edge node disconnected")
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "hub event log lagging"),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
