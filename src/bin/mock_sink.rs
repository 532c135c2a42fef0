//! Mock ingestion API
//!
//! Accepts `POST` requests carrying transformed records and logs them. Used to
//! exercise the bridge's delivery and retry path locally.
//!
//! Behavior:
//! 1. Listens on a configurable port (default 3001)
//! 2. Rejects requests without an `X-API-Key` header with 401 when `--api-key` is set
//! 3. Answers the first `--fail-first` requests with `--fail-status`, then `--status`
//!
//! Usage:
//!   cargo run --bin mock-sink -- --port 3001 --fail-first 2 --fail-status 503
//!   SINK_INGESTION_URL=http://localhost:3001/ingest cargo run

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-sink")]
#[command(about = "Mock ingestion API for local delivery testing")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Status returned once the failure budget is spent
    #[arg(long, default_value = "200")]
    status: u16,

    /// Number of requests to fail before answering with --status
    #[arg(long, default_value = "0")]
    fail_first: u64,

    /// Status used for the failing requests
    #[arg(long, default_value = "503")]
    fail_status: u16,

    /// Require this X-API-Key value
    #[arg(long)]
    api_key: Option<String>,
}

struct SinkState {
    args: Args,
    requests: AtomicU64,
}

fn status_for(state: &SinkState, request_number: u64) -> StatusCode {
    let code = if request_number <= state.args.fail_first { state.args.fail_status } else { state.args.status };
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<SinkState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Full::new(Bytes::from_static(b"method not allowed")));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let api_key = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string);
    let request_id = req.headers().get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let path = req.uri().path().to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "body_read_failed");
            Bytes::new()
        }
    };

    let request_number = state.requests.fetch_add(1, Ordering::Relaxed) + 1;

    if let Some(expected) = &state.args.api_key {
        if api_key.as_deref() != Some(expected.as_str()) {
            warn!(request = request_number, "api_key_rejected");
            let mut response = Response::new(Full::new(Bytes::from_static(br#"{"error":"unauthorized"}"#)));
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            return Ok(response);
        }
    }

    let status = status_for(&state, request_number);
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(record) => info!(
            request = request_number,
            path = %path,
            request_id = ?request_id,
            status = status.as_u16(),
            identifier = %record["identifier"],
            latitude = %record["latitude"],
            longitude = %record["longitude"],
            "record_received"
        ),
        Err(e) => warn!(request = request_number, error = %e, "record_not_json"),
    }

    let mut response = Response::new(Full::new(Bytes::from(format!(
        r#"{{"request":{request_number},"status":{}}}"#,
        status.as_u16()
    ))));
    *response.status_mut() = status;
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    info!(
        port = args.port,
        status = args.status,
        fail_first = args.fail_first,
        fail_status = args.fail_status,
        "mock_sink_listening"
    );

    let state = Arc::new(SinkState { args, requests: AtomicU64::new(0) });

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                error!(peer = %peer, error = %e, "connection_error");
            }
        });
    }
}
