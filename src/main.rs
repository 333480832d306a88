//! Geofence engine daemon
//!
//! Consumes location reports from MQTT, evaluates them against each user's
//! active geofences and emits entry, exit, dwell and emergency events.
//!
//! Module structure:
//! - `domain/` - Core types (Geofence, status, evaluation events, errors)
//! - `io/` - External interfaces (MQTT ingest, event bus, webhook, repository)
//! - `services/` - Business logic (GeofenceEngine and its components)
//! - `infra/` - Infrastructure (Config, Clock, Metrics, sharded state)

use anyhow::Context;
use clap::Parser;
use geofence_engine::infra::{Config, Metrics};
use geofence_engine::io::notifier::NotificationService;
use geofence_engine::io::{
    create_event_bus, create_webhook_notifier, EventBus, InMemoryRepository, LogNotifier,
    MqttPublisher, NoopEventBus,
};
use geofence_engine::services::{EngineSettings, GeofenceEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Upper bound on reports evaluated in one batch round
const MAX_ROUND_SIZE: usize = 256;

/// Geofence engine - location evaluation daemon
#[derive(Parser, Debug)]
#[command(name = "geofence-engine", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-sample visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "geofence_engine_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        accuracy_threshold_m = %config.engine().accuracy_threshold_m,
        exit_confirmation_delay_ms = %config.engine().exit_confirmation_delay_ms,
        event_bus_enabled = %config.event_bus_enabled(),
        webhook = %config.webhook_url().is_some(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let repository = match config.geofences_file() {
        Some(path) => InMemoryRepository::from_file(path)
            .with_context(|| format!("loading geofences from {path}"))?,
        None => InMemoryRepository::new(),
    };
    let repository = Arc::new(repository);

    // Notifications: webhook worker when configured, otherwise log only
    let notifier: Arc<dyn NotificationService> = match config.webhook_url() {
        Some(url) => {
            let (notifier, worker) = create_webhook_notifier(
                url,
                config.webhook_timeout_ms(),
                config.notification_queue_size(),
                config.site_id(),
                metrics.clone(),
            );
            tokio::spawn(worker.run());
            Arc::new(notifier)
        }
        None => Arc::new(LogNotifier),
    };

    let event_bus: Arc<dyn EventBus> = if config.event_bus_enabled() {
        let (bus, bus_rx) =
            create_event_bus(config.event_bus_queue_size(), config.site_id().to_string());
        let publisher = MqttPublisher::new(&config, bus_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Arc::new(bus)
    } else {
        Arc::new(NoopEventBus)
    };

    let engine = GeofenceEngine::builder(repository)
        .notifier(notifier)
        .event_bus(event_bus)
        .metrics(metrics.clone())
        .settings(EngineSettings::from_config(&config))
        .build();

    // Location ingest (bounded for backpressure)
    let (report_tx, mut report_rx) = mpsc::channel(1000);
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = geofence_engine::io::mqtt::start_mqtt_client(
            &mqtt_config,
            report_tx,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            tracing::error!(error = %e, "mqtt_client_error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = geofence_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics log and lock housekeeping
    let reporter_engine = engine.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            reporter_engine.metrics().set_pending_exits(reporter_engine.pending_exit_count() as u64);
            reporter_engine.metrics().report().log();
            reporter_engine.prune_idle_locks();
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    info!("engine_started");

    // Drain the ingest channel in rounds; each round is one batch
    let mut shutdown = shutdown_rx;
    let mut round = Vec::with_capacity(MAX_ROUND_SIZE);
    loop {
        tokio::select! {
            received = report_rx.recv_many(&mut round, MAX_ROUND_SIZE) => {
                if received == 0 {
                    warn!("ingest_channel_closed");
                    break;
                }
                let reports = std::mem::take(&mut round);
                for entry in engine.check_status_batch(reports).await {
                    if let Err(e) = entry.outcome {
                        debug!(user_id = %entry.user_id, error = %e, "batch_entry_failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(pending_exits = %engine.pending_exit_count(), "geofence_engine_shutdown_complete");
    Ok(())
}
