//! SIGTERM triggers the graceful shutdown path.
//! Kept alone in its own test binary: the signal goes to the whole process.

#![cfg(unix)]

use geofeed_bridge::infra::shutdown_signal;
use std::process::Command;
use std::time::Duration;

#[tokio::test]
async fn test_sigterm_resolves_shutdown_signal() {
    let signal = shutdown_signal().unwrap();

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let name = tokio::time::timeout(Duration::from_secs(5), signal).await.unwrap();
    assert_eq!(name, "SIGTERM");
}
