//! Launch-path tests using a real child process. The "plugin binary" is a
//! shell that prints the port of an in-process provider server and then
//! sleeps, so the full spawn → port handshake → dial → handshake → close
//! sequence runs against genuine pipes and a genuine process group.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::{serve, TestProvider, TestProviderConfig};
use pulumi_host::diag::MemorySink;
use pulumi_host::error::Error;
use pulumi_host::plugin::{HostLogging, LaunchOptions, PluginProcess};
use pulumi_host::provider::ProviderClient;
use pulumi_host::workspace::PluginKind;

fn launch_options<'a>(
    diag: &Arc<MemorySink>,
    logging: &'a HostLogging,
    dir: &'a std::path::Path,
    args: Vec<String>,
) -> LaunchOptions<'a> {
    LaunchOptions {
        kind: PluginKind::Resource,
        name: "mock",
        dir,
        path: std::path::Path::new("/bin/sh"),
        args,
        env: Vec::new(),
        logging,
        diag: diag.clone(),
        track_output: false,
    }
}

#[tokio::test]
async fn spawns_reads_port_dials_and_closes() {
    let port = serve(TestProvider::new(TestProviderConfig::default())).await;

    let diag = Arc::new(MemorySink::new());
    let logging = HostLogging::default();
    let dir = std::env::temp_dir();
    let plugin = PluginProcess::launch(launch_options(
        &diag,
        &logging,
        &dir,
        vec!["-c".to_string(), format!("echo {port}; sleep 60")],
    ))
    .await
    .expect("launch should succeed");

    assert_eq!(plugin.addr(), format!("127.0.0.1:{port}"));

    let client = ProviderClient::new(plugin, "mock", None, "127.0.0.1:1", None, None)
        .await
        .expect("handshake should succeed");
    client.configure(Default::default()).await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn garbage_port_line_fails_the_launch() {
    let diag = Arc::new(MemorySink::new());
    let logging = HostLogging::default();
    let dir = std::env::temp_dir();
    let result = PluginProcess::launch(launch_options(
        &diag,
        &logging,
        &dir,
        vec!["-c".to_string(), "echo this is not a port".to_string()],
    ))
    .await;
    assert!(matches!(result, Err(Error::Launch { .. })));
}

#[tokio::test]
async fn exiting_without_output_fails_the_launch() {
    let diag = Arc::new(MemorySink::new());
    let logging = HostLogging::default();
    let dir = std::env::temp_dir();
    let result = PluginProcess::launch(launch_options(
        &diag,
        &logging,
        &dir,
        vec!["-c".to_string(), "exit 3".to_string()],
    ))
    .await;
    assert!(matches!(result, Err(Error::Launch { .. })));
}

#[tokio::test]
async fn missing_binaries_map_to_plugin_not_found() {
    let diag = Arc::new(MemorySink::new());
    let logging = HostLogging::default();
    let dir = std::env::temp_dir();
    let result = PluginProcess::launch(LaunchOptions {
        kind: PluginKind::Resource,
        name: "aws",
        dir: &dir,
        path: std::path::Path::new("/definitely/not/a/binary"),
        args: Vec::new(),
        env: Vec::new(),
        logging: &logging,
        diag: diag.clone(),
        track_output: false,
    })
    .await;
    assert!(matches!(result, Err(Error::PluginNotFound { .. })));
}

#[tokio::test]
async fn stderr_lines_reach_the_diagnostic_sink() {
    let port = serve(TestProvider::new(TestProviderConfig::default())).await;

    let diag = Arc::new(MemorySink::new());
    let logging = HostLogging::default();
    let dir = std::env::temp_dir();
    let plugin = PluginProcess::launch(launch_options(
        &diag,
        &logging,
        &dir,
        vec![
            "-c".to_string(),
            format!("echo {port}; echo warming up >&2; sleep 60"),
        ],
    ))
    .await
    .unwrap();

    // Drains are asynchronous; give the line a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let messages: Vec<String> = diag.entries().into_iter().map(|e| e.message).collect();
    assert!(
        messages.iter().any(|m| m == "warming up"),
        "stderr line missing from {messages:?}"
    );

    plugin.close().await;
}
