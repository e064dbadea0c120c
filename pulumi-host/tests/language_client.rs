//! End-to-end tests of the language runtime client against an in-process
//! runtime served over a real gRPC channel, focused on the `RunPlugin`
//! stream-to-pipes bridge.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use common::{serve_language, RunPluginScript, TestLanguageRuntime};
use pulumi_host::diag::MemorySink;
use pulumi_host::language::{LanguageRuntimeClient, ProgramInfo, RunPluginInfo};
use pulumi_host::plugin::PluginProcess;
use pulumi_host::workspace::PluginKind;
use pulumi_proto::pulumirpc::run_plugin_response::Output;

async fn connect(script: RunPluginScript) -> LanguageRuntimeClient {
    let port = serve_language(TestLanguageRuntime { run_plugin: script }).await;
    let plugin = PluginProcess::attach("mock-lang", Arc::new(MemorySink::new()), port)
        .await
        .expect("attach should succeed");
    LanguageRuntimeClient::new(plugin, "mock-lang", "127.0.0.1:1", None, None)
        .await
        .expect("handshake should succeed")
}

fn run_plugin_info() -> RunPluginInfo {
    RunPluginInfo {
        kind: Some(PluginKind::Resource),
        name: "mock".to_string(),
        pwd: std::env::temp_dir(),
        args: vec!["127.0.0.1:1".to_string()],
        env: Vec::new(),
        info: ProgramInfo::new(std::env::temp_dir(), std::env::temp_dir()),
    }
}

#[tokio::test]
async fn run_plugin_pumps_frames_into_the_right_pipes() {
    let client = connect(RunPluginScript::Frames(vec![
        Output::Stdout(b"50051\n".to_vec()),
        Output::Stderr(b"warming up\n".to_vec()),
        Output::Stdout(b"ready\n".to_vec()),
        Output::Exitcode(0),
    ]))
    .await;

    let (mut stdout, mut stderr, _kill) = client.run_plugin(&run_plugin_info()).await.unwrap();

    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "50051\nready\n");

    let mut err = String::new();
    stderr.read_to_string(&mut err).await.unwrap();
    assert_eq!(err, "warming up\n");
}

#[tokio::test]
async fn exit_code_ends_both_pipes() {
    let client = connect(RunPluginScript::Frames(vec![
        Output::Stdout(b"before".to_vec()),
        Output::Exitcode(0),
        Output::Stdout(b"after".to_vec()),
    ]))
    .await;

    let (mut stdout, mut stderr, _kill) = client.run_plugin(&run_plugin_info()).await.unwrap();

    // The exit code terminates the stream; nothing after it is delivered.
    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "before");

    let mut err = String::new();
    stderr.read_to_string(&mut err).await.unwrap();
    assert!(err.is_empty());
}

#[tokio::test]
async fn empty_stream_is_immediate_eof() {
    let client = connect(RunPluginScript::Empty).await;
    let (mut stdout, mut stderr, _kill) = client.run_plugin(&run_plugin_info()).await.unwrap();
    let mut buf = Vec::new();
    stdout.read_to_end(&mut buf).await.unwrap();
    stderr.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn kill_aborts_the_pump_and_delivers_eof() {
    let client = connect(RunPluginScript::Endless).await;
    let (mut stdout, _stderr, kill) = client.run_plugin(&run_plugin_info()).await.unwrap();

    // Prove the runtime really is streaming before the kill.
    let mut first = [0u8; 5];
    stdout.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"tick\n");

    kill();

    // The pump drops its writers once aborted, so the reader drains any
    // buffered chunks and then sees EOF instead of hanging forever.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut rest))
        .await
        .expect("killed plugin's stdout should reach EOF")
        .unwrap();
}

#[tokio::test]
async fn unimplemented_surfaces_are_tolerated() {
    let client = connect(RunPluginScript::Empty).await;
    let info = ProgramInfo::new(std::env::temp_dir(), std::env::temp_dir());

    // Runtimes that cannot answer report no plugins rather than failing.
    assert!(client.get_required_plugins(&info).await.unwrap().is_empty());
    // An installer-less runtime installs nothing, successfully.
    client.install_dependencies(&info, false).await.unwrap();
    // No prompts from runtimes that predate them.
    assert!(client.runtime_options_prompts(&info).await.unwrap().is_empty());
}

#[tokio::test]
async fn about_reports_runtime_metadata() {
    let client = connect(RunPluginScript::Empty).await;
    let info = ProgramInfo::new(std::env::temp_dir(), std::env::temp_dir());
    let about = client.about(&info).await.unwrap();
    assert_eq!(about.executable, "mock-lang");
    assert_eq!(about.version, "1.0.0");
    client.close().await;
}
