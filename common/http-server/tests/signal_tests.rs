//! Signals are process-wide, so this lives in its own test binary.
#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use http_server::LifecycleState;

mod common;
use common::{test_config, ServerHandle};

#[tokio::test]
async fn sigterm_drains_the_server() {
    // Keep the default disposition from killing the test process
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    let handle = ServerHandle::start(test_config().with_trap_signals(true)).await;
    let server = handle.server.clone();

    let resp = reqwest::get(handle.url("/healthz")).await.unwrap();
    assert!(resp.status().is_success());

    // Give the watcher time to register its own handler
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success());
    sigterm.recv().await;

    assert!(handle.join().await.is_ok());
    assert_eq!(server.state(), LifecycleState::Stopped);

    // An explicit shutdown afterwards is a no-op
    tokio::time::timeout(Duration::from_secs(1), server.shutdown())
        .await
        .unwrap();
}
