//! Status HTTP endpoint
//!
//! Routes:
//! - `GET /` service info
//! - `GET /health` liveness plus feed and sink status
//! - `GET /status` feed, sink and calibration table
//! - `GET /metrics` Prometheus text exposition
//! - `POST /floors` add or replace a floor calibration at runtime

use crate::domain::calibration::CalibrationTable;
use crate::domain::types::SinkStatus;
use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::feed::FeedHandle;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Everything the handlers read from
pub struct StatusContext {
    feed: FeedHandle,
    sink: SinkStatus,
    table: Arc<CalibrationTable>,
    metrics: Arc<Metrics>,
    started: Instant,
}

impl StatusContext {
    pub fn new(
        feed: FeedHandle,
        sink: SinkStatus,
        table: Arc<CalibrationTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { feed, sink, table, metrics, started: Instant::now() }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FloorRequest {
    location_hierarchy: String,
    origin_lat: f64,
    origin_lng: f64,
    #[serde(default)]
    scale_factor: Option<f64>,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    respond(status, "application/json", value.to_string())
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {typ}");
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(output: &mut String, name: &str, help: &str, buckets: &[u64; METRICS_NUM_BUCKETS], sum: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Prometheus text format; reads cumulative values only
pub fn format_prometheus_metrics(ctx: &StatusContext) -> String {
    let m = &ctx.metrics;
    let feed = ctx.feed.status();
    let mut output = String::with_capacity(4096);

    let counters: [(&str, &str, u64); 11] = [
        ("geofeed_frames_received_total", "Feed frames received", m.frames_received()),
        ("geofeed_frames_malformed_total", "Feed frames that were not valid JSON events", m.frames_malformed()),
        ("geofeed_frames_ignored_total", "Feed frames with a non-monitored event type", m.frames_ignored()),
        ("geofeed_events_forwarded_total", "Events handed to the pipeline", m.events_forwarded()),
        ("geofeed_events_dropped_total", "Events dropped because the pipeline channel was full", m.events_dropped()),
        ("geofeed_transform_failed_total", "Events rejected by the transform", m.transform_failed()),
        ("geofeed_validation_failed_total", "Records rejected by validation", m.validation_failed()),
        ("geofeed_delivered_total", "Records accepted by the sink", m.delivered()),
        ("geofeed_delivery_failed_total", "Records dropped after delivery failure", m.delivery_failed()),
        ("geofeed_delivery_retries_total", "Delivery retry attempts", m.delivery_retries()),
        ("geofeed_reconnects_total", "Feed reconnect attempts", m.reconnects()),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, "counter", val);
    }

    let (buckets, sum) = m.latency_totals();
    write_histogram(
        &mut output,
        "geofeed_delivery_latency_ms",
        "Delivery latency including retries, in milliseconds",
        &buckets,
        sum,
    );

    write_metric(&mut output, "geofeed_feed_connected", "1 if the feed is connected", "gauge", u64::from(feed.is_connected));
    write_metric(
        &mut output,
        "geofeed_feed_reconnect_attempts",
        "Reconnect attempts since the last successful connect",
        "gauge",
        u64::from(feed.reconnect_attempts),
    );
    write_metric(&mut output, "geofeed_floor_mappings", "Calibrated floors", "gauge", ctx.table.len() as u64);

    output
}

fn add_floor(ctx: &StatusContext, body: &[u8]) -> Response<Full<Bytes>> {
    let request: FloorRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "floor_request_invalid");
            return json_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }));
        }
    };

    match ctx.table.add(&request.location_hierarchy, request.origin_lat, request.origin_lng, request.scale_factor) {
        Ok(calibration) => json_response(
            StatusCode::OK,
            json!({
                "locationHierarchy": request.location_hierarchy,
                "calibration": calibration,
                "floorMappings": ctx.table.len(),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "floor_request_rejected");
            json_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
        }
    }
}

/// Dispatch a request whose body has already been read
pub fn route(ctx: &StatusContext, method: &Method, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/") => json_response(
            StatusCode::OK,
            json!({
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "git": env!("GIT_HASH"),
                "endpoints": ["/health", "/status", "/metrics", "/floors"],
            }),
        ),
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            json!({
                "status": "OK",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "uptimeSecs": ctx.started.elapsed().as_secs(),
                "services": {
                    "feed": ctx.feed.status(),
                    "sink": ctx.sink,
                },
            }),
        ),
        (&Method::GET, "/status") => json_response(
            StatusCode::OK,
            json!({
                "feed": ctx.feed.status(),
                "sink": ctx.sink,
                "floorMappings": ctx.table.snapshot(),
            }),
        ),
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(ctx),
        ),
        (&Method::POST, "/floors") => add_floor(ctx, body),
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<StatusContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "status_request_body_error");
            return Ok(json_response(StatusCode::BAD_REQUEST, json!({ "error": "unreadable body" })));
        }
    };
    Ok(route(&ctx, &parts.method, parts.uri.path(), &body))
}

/// Serve on an already bound listener until shutdown is signalled
pub async fn serve(listener: TcpListener, ctx: Arc<StatusContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "status_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "status_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("status_server_shutdown");
                    return;
                }
            }
        }
    }
}

/// Bind `0.0.0.0:port` and serve
pub async fn start_status_server(
    port: u16,
    ctx: Arc<StatusContext>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "status_server_started");
    serve(listener, ctx, shutdown).await;
    Ok(())
}
