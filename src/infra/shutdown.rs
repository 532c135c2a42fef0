//! Process shutdown signals
//!
//! Service managers stop the bridge with SIGTERM; an operator at a terminal
//! uses Ctrl+C. Either one starts the same graceful shutdown.

use std::future::Future;

/// Register signal handlers and return a future resolving to the name of the
/// first signal received. Registration happens before this returns, so a
/// signal delivered after the call is never missed.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl_c"
    })
}
