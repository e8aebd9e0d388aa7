//! Parking gate node - plate authorization handshake and gate supervisor
//!
//! Takes recognized plates, asks the embedded controller for a decision and
//! drives the barrier and status lamps. Fails closed on every error path.
//!
//! Module structure:
//! - `domain/` - Core types (plates, gate states, outcomes, decision records)
//! - `io/` - External interfaces (controller, actuator, decision egress, Prometheus)
//! - `services/` - Gate supervisor
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use parking_gate::infra::{Config, Metrics};
use parking_gate::io::{build_actuator, create_decision_log, ProcessAuthorizer};
use parking_gate::services::{GateSupervisor, SupervisorHandle};
use rand::Rng;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parking gate node - authorizes recognized plates and drives the barrier
#[derive(Parser, Debug)]
#[command(name = "parking-gate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

/// Decision egress queue depth
const DECISION_BUFFER: usize = 256;

/// How long to wait for queued decisions to reach disk on exit
const DECISION_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for controller diagnostics
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Plate in the local format, used when an operator presses enter
fn demo_plate() -> String {
    let mut rng = rand::thread_rng();
    format!("KL-{}-AB-{}", rng.gen_range(10..100), rng.gen_range(1000..10000))
}

/// Read stdin on a detached thread so a pending read never holds up exit
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Feed stdin lines to the supervisor until `quit` or EOF
///
/// Each line stands in for one recognition from the camera pipeline.
async fn run_plate_source(handle: &SupervisorHandle, mut lines: mpsc::Receiver<String>) {
    info!("plate_source_ready");

    while let Some(line) = lines.recv().await {
        match line.trim() {
            "quit" => break,
            "close" => handle.close().await,
            "" => {
                let plate = demo_plate();
                info!(plate = %plate, "demo_plate_generated");
                handle.submit_plate(plate);
            }
            // Passed through untrimmed; validation belongs to the supervisor
            _ => {
                handle.submit_plate(line);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load_from_path(&args.config);
    init_logging(config.log_json());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "parking-gate starting"
    );

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        controller = %config.controller_binary().display(),
        park_flag = %config.controller_park_flag(),
        deadline_ms = %config.controller_deadline().as_millis(),
        driver = %config.driver().as_str(),
        auto_close_ms = %config.auto_close().as_millis(),
        travel_ms = %config.travel_time().as_millis(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Hardware must be up before any event is accepted
    let actuator = match build_actuator(&config) {
        Ok(actuator) => actuator,
        Err(e) => {
            error!(error = %e, "actuator_init_failed");
            return Err(e).context("actuator initialization failed");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = parking_gate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Start metrics reporter
    let reporter_metrics = metrics.clone();
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs().max(1));
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    // Decision egress writer (if enabled)
    let (decisions, decision_writer) = if config.decisions_enabled() {
        let (sender, log) =
            create_decision_log(config.decisions_file(), DECISION_BUFFER, metrics.clone());
        (Some(sender), Some(tokio::spawn(log.run())))
    } else {
        (None, None)
    };

    let authorizer = Arc::new(ProcessAuthorizer::from_config(&config));
    let handle = GateSupervisor::spawn(&config, authorizer, actuator, metrics, decisions);

    tokio::select! {
        _ = run_plate_source(&handle, spawn_stdin_reader()) => {
            info!("plate_source_closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
        }
    }

    handle.shutdown().await;
    let _ = shutdown_tx.send(true);
    drop(handle);

    if let Some(writer) = decision_writer {
        if tokio::time::timeout(DECISION_FLUSH_TIMEOUT, writer).await.is_err() {
            warn!("decision_egress_flush_timeout");
        }
    }

    info!("parking-gate shutdown complete");
    Ok(())
}
