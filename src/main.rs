//! Geofeed bridge - BLE positioning feed to geo ingestion API
//!
//! Keeps a WebSocket subscription to the location feed, converts each BLE
//! device sighting from floor coordinates to latitude/longitude, and posts the
//! record to the ingestion API.
//!
//! Module structure:
//! - `domain/` - Events, records, floor calibration table
//! - `io/` - Feed connection, sink delivery, status HTTP server
//! - `services/` - Transform engine and event pipeline
//! - `infra/` - Config, Metrics, shutdown signals

use clap::Parser;
use geofeed_bridge::infra::{shutdown_signal, Config, LogFormat, Metrics};
use geofeed_bridge::io::{
    start_status_server, DeliveryClient, FeedManager, HttpIngestTransport, ReconnectPolicy,
    RetryPolicy, StatusContext, WsFeedConnector,
};
use geofeed_bridge::services::EventPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofeed bridge - location feed to ingestion API
#[derive(Parser, Debug)]
#[command(name = "geofeed-bridge", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

fn init_tracing(format: LogFormat) {
    // Default: INFO, use RUST_LOG=debug to see ignored frames and per-record transforms
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::resolve_config_path);
    let config = Config::load_from_path(&config_path).with_env_overrides();

    init_tracing(config.log_format());
    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "geofeed-bridge starting");

    info!(
        config_file = %config.config_file(),
        event_type = %config.feed_event_type(),
        sink_url = %config.sink_base_url(),
        max_reconnect_attempts = %config.reconnect_max_attempts(),
        max_retries = %config.sink_max_retries(),
        max_in_flight = %config.max_in_flight(),
        http_port = %config.http_port(),
        floors = %config.floors().len(),
        "config_loaded"
    );

    let credentials = config.require_credentials().inspect_err(|e| {
        error!(error = %e, "config_invalid");
    })?;

    let table = Arc::new(config.calibration_table()?);
    let metrics = Arc::new(Metrics::new());

    // Sink delivery
    let transport =
        HttpIngestTransport::new(config.sink_base_url(), &credentials.sink_api_key, config.sink_timeout())?;
    let retry_policy = RetryPolicy {
        max_retries: config.sink_max_retries(),
        base_delay: config.sink_retry_delay(),
    };
    let delivery = Arc::new(
        DeliveryClient::new(transport, config.sink_base_url(), true, retry_policy)
            .with_batch_pause(config.sink_batch_pause()),
    );
    let sink_status = delivery.status();

    // Feed connection; a failed credential exchange here is fatal
    let connector = WsFeedConnector::new(
        &credentials.feed_discovery_url,
        &credentials.feed_access_token,
        config.feed_connect_timeout(),
    )?;
    let reconnect_policy = ReconnectPolicy {
        max_attempts: config.reconnect_max_attempts(),
        base_delay: config.reconnect_base_delay(),
        connect_timeout: config.feed_connect_timeout(),
    };
    let feed = Arc::new(FeedManager::new(
        connector,
        reconnect_policy,
        config.feed_event_type(),
        metrics.clone(),
    ));
    let feed_handle = feed.handle();
    let initial = feed.initialize().instrument(info_span!("feed")).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bounded channel plus capped in-flight deliveries: a stalled sink fills
    // the channel and the feed drops new events
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity());

    let feed_task = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.run(initial, event_tx).await }.instrument(info_span!("feed")))
    };

    let pipeline =
        EventPipeline::new(table.clone(), delivery, metrics.clone()).with_max_in_flight(config.max_in_flight());
    let pipeline_task =
        tokio::spawn(async move { pipeline.run(event_rx).await }.instrument(info_span!("pipeline")));

    // Status server (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let ctx = Arc::new(StatusContext::new(feed_handle.clone(), sink_status, table, metrics.clone()));
        let status_shutdown = shutdown_rx.clone();
        tokio::spawn(
            async move {
                if let Err(e) = start_status_server(http_port, ctx, status_shutdown).await {
                    error!(error = %format!("{e:#}"), "status_server_error");
                }
            }
            .instrument(info_span!("status")),
        );
    }

    // Periodic metrics summary
    let metrics_reporter = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut reporter_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_reporter.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    let signal = match shutdown_signal() {
        Ok(signal) => signal.await,
        Err(e) => {
            warn!(error = %e, "signal_handler_failed");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl_c_listener_failed");
            }
            "ctrl_c"
        }
    };
    info!(signal = signal, "shutdown_signal_received");

    feed_handle.disconnect();
    let _ = shutdown_tx.send(true);

    // Feed drops its sender on exit, which lets the pipeline drain and stop
    if let Err(e) = feed_task.await {
        error!(error = %e, "feed_task_failed");
    }
    if let Err(e) = pipeline_task.await {
        error!(error = %e, "pipeline_task_failed");
    }

    metrics.report().log();
    info!("geofeed-bridge shutdown complete");
    Ok(())
}
