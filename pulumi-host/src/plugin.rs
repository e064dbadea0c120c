//! The process supervisor.
//!
//! A [`PluginProcess`] is a live plugin: a spawned (or attached) child, its
//! stdout/stderr drain tasks, and an established gRPC channel. The child
//! contract is simple — print a port, then serve plaintext gRPC on
//! `127.0.0.1:<port>` — but the edges are not: ports arrive wrapped in
//! terminal control sequences, plugins crash before printing anything, and
//! runtimes write diagnostics to either stream at any time.

use std::collections::VecDeque;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};

use pulumi_proto::health::health_check_response::ServingStatus;
use pulumi_proto::health::health_client::HealthClient;
use pulumi_proto::health::HealthCheckRequest;

use crate::diag::{next_stream_id, DiagSink, Severity};
use crate::error::Error;
use crate::workspace::PluginKind;

/// Total time allowed for a plugin's endpoint to become ready.
pub const RPC_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the pre-close health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Nap between dial or handshake retries.
const RETRY_NAP: Duration = Duration::from_millis(10);

/// Lines of unstructured output retained for the crash post-mortem.
const OUTPUT_RING_CAPACITY: usize = 100;

/// The stderr marker emitted by policy shims whose language SDK is not
/// installed.
const POLICY_SDK_MISSING_MARKER: &str = "Cannot find module '@pulumi/policy'";

/// A boxed reader for a plugin output stream; either a child's pipe or the
/// read half of a language-runtime-delegated stream.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Tears down the plugin's process (and, for directly spawned plugins, its
/// whole process group).
pub type KillFn = Box<dyn FnOnce() + Send>;

/// Host logging configuration, translated into universal plugin arguments.
#[derive(Debug, Clone, Default)]
pub struct HostLogging {
    pub log_to_stderr: bool,
    pub verbose: u8,
    pub tracing_endpoint: Option<String>,
}

impl HostLogging {
    /// The arguments prepended to every plugin invocation.
    pub fn plugin_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.log_to_stderr {
            args.push("--logtostderr".to_string());
        }
        if self.verbose > 0 {
            args.push(format!("-v={}", self.verbose));
        }
        if let Some(endpoint) = &self.tracing_endpoint {
            args.push("--tracing".to_string());
            args.push(endpoint.clone());
        }
        args
    }
}

/// Parameters for launching a plugin binary directly.
pub struct LaunchOptions<'a> {
    pub kind: PluginKind,
    /// The plugin's short name, used in diagnostics and not-found errors.
    pub name: &'a str,
    /// The working directory for the child.
    pub dir: &'a Path,
    /// The binary to execute.
    pub path: &'a Path,
    pub args: Vec<String>,
    /// When non-empty, used as the child's full environment.
    pub env: Vec<(String, String)>,
    pub logging: &'a HostLogging,
    pub diag: Arc<dyn DiagSink>,
    /// Capture unstructured output for a crash post-mortem.
    pub track_output: bool,
}

struct OutputRing {
    lines: VecDeque<String>,
    dropped: usize,
}

impl OutputRing {
    fn new() -> Self {
        OutputRing {
            lines: VecDeque::with_capacity(OUTPUT_RING_CAPACITY),
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_RING_CAPACITY {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }
}

/// Handle to a live plugin process and its gRPC channel.
pub struct PluginProcess {
    name: String,
    path: PathBuf,
    addr: String,
    channel: Channel,
    diag: Arc<dyn DiagSink>,
    kill: parking_lot::Mutex<Option<KillFn>>,
    drains: parking_lot::Mutex<Vec<oneshot::Receiver<()>>>,
    ring: Option<Arc<parking_lot::Mutex<OutputRing>>>,
}

impl PluginProcess {
    /// Spawn a plugin binary and bring it to a dialed, ready state.
    pub async fn launch(opts: LaunchOptions<'_>) -> Result<Self, Error> {
        let mut args = opts.logging.plugin_args();
        args.extend(opts.args.iter().cloned());

        let mut cmd = Command::new(opts.path);
        cmd.args(&args)
            .current_dir(opts.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !opts.env.is_empty() {
            cmd.env_clear();
            cmd.envs(opts.env.iter().cloned());
        }
        // Children get their own process group so descendants can be reaped
        // together at close.
        #[cfg(unix)]
        cmd.as_std_mut().process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PluginNotFound {
                    kind: opts.kind,
                    name: opts.name.to_string(),
                    version: None,
                });
            }
            Err(e) => {
                return Err(Error::Launch {
                    plugin: opts.name.to_string(),
                    reason: format!("could not start {}: {e}", opts.path.display()),
                });
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| Error::Launch {
            plugin: opts.name.to_string(),
            reason: "stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::Launch {
            plugin: opts.name.to_string(),
            reason: "stderr unavailable".to_string(),
        })?;

        let kill: KillFn = Box::new(move || {
            #[cfg(unix)]
            if let Some(pid) = pid {
                // Negative pid addresses the whole process group.
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let mut child = child;
            let _ = child.start_kill();
        });

        Self::from_streams(
            opts.name,
            opts.path.to_path_buf(),
            Box::new(stdout),
            Box::new(stderr),
            kill,
            opts.diag,
            opts.track_output,
        )
        .await
    }

    /// Bring up a plugin whose spawn was delegated elsewhere (a language
    /// runtime's `RunPlugin`), given its output streams and a kill function.
    pub async fn from_streams(
        name: &str,
        path: PathBuf,
        mut stdout: Reader,
        stderr: Reader,
        kill: KillFn,
        diag: Arc<dyn DiagSink>,
        track_output: bool,
    ) -> Result<Self, Error> {
        let ring = track_output.then(|| Arc::new(parking_lot::Mutex::new(OutputRing::new())));
        let sdk_missing = Arc::new(AtomicBool::new(false));

        // Drain stderr from the very start: boot failures often explain
        // themselves there before stdout produces anything.
        let stderr_done = spawn_drain(
            stderr,
            diag.clone(),
            Severity::Infoerr,
            ring.clone(),
            Some(sdk_missing.clone()),
        );

        let port = match read_port(&mut stdout).await {
            Ok(port) => port,
            Err(e) => {
                kill();
                // Give the stderr drain a moment to surface a more precise
                // cause before reporting the generic one.
                tokio::time::sleep(Duration::from_millis(100)).await;
                if sdk_missing.load(Ordering::SeqCst) {
                    return Err(Error::PolicyPackSdkMissing {
                        dir: path.display().to_string(),
                    });
                }
                return Err(match e {
                    Error::Launch { reason, .. } => Error::Launch {
                        plugin: name.to_string(),
                        reason,
                    },
                    other => other,
                });
            }
        };

        let stdout_done = spawn_drain(stdout, diag.clone(), Severity::Info, ring.clone(), None);

        let addr = format!("127.0.0.1:{port}");
        let channel = dial(name, &addr).await?;

        log::debug!("plugin {name} up at {addr}");

        Ok(PluginProcess {
            name: name.to_string(),
            path,
            addr,
            channel,
            diag,
            kill: parking_lot::Mutex::new(Some(kill)),
            drains: parking_lot::Mutex::new(vec![stderr_done, stdout_done]),
            ring,
        })
    }

    /// Dial an already-running plugin instead of spawning one.
    pub async fn attach(name: &str, diag: Arc<dyn DiagSink>, port: u16) -> Result<Self, Error> {
        let addr = format!("127.0.0.1:{port}");
        let channel = dial(name, &addr).await?;
        Ok(PluginProcess {
            name: name.to_string(),
            path: PathBuf::new(),
            addr,
            channel,
            diag,
            kill: parking_lot::Mutex::new(None),
            drains: parking_lot::Mutex::new(Vec::new()),
            ring: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The binary backing the plugin; empty for attached plugins.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// A clone of the plugin's gRPC channel.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Probe the standard health service. `Unimplemented` counts as healthy;
    /// most plugins do not serve it.
    async fn healthy(&self) -> bool {
        let mut client = HealthClient::new(self.channel.clone());
        let mut request = tonic::Request::new(HealthCheckRequest {
            service: String::new(),
        });
        request.set_timeout(HEALTH_CHECK_TIMEOUT);
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, client.check(request)).await {
            Ok(Ok(response)) => response.into_inner().status() == ServingStatus::Serving,
            Ok(Err(status)) => status.code() == tonic::Code::Unimplemented,
            Err(_) => false,
        }
    }

    /// Tear the plugin down: health-probe it, kill the process group, and
    /// wait for both output streams to drain. If the plugin died unhealthy,
    /// flush the captured output post-mortem.
    pub async fn close(&self) {
        let owns_process = self.kill.lock().is_some();
        let crashed = owns_process && !self.healthy().await;

        if let Some(kill) = self.kill.lock().take() {
            kill();
        }

        let drains: Vec<_> = self.drains.lock().drain(..).collect();
        for done in drains {
            let _ = done.await;
        }

        if crashed {
            self.dump_captured_output();
        }
    }

    fn dump_captured_output(&self) {
        let Some(ring) = &self.ring else { return };
        let ring = ring.lock();
        if ring.lines.is_empty() {
            return;
        }
        let stream_id = next_stream_id();
        self.diag.log(
            Severity::Error,
            None,
            &format!("provider plugin {} exited prematurely", self.name),
            stream_id,
        );
        if ring.dropped > 0 {
            self.diag.log(
                Severity::Infoerr,
                None,
                &format!("... {} earlier line(s) dropped ...", ring.dropped),
                stream_id,
            );
        }
        for line in &ring.lines {
            self.diag.log(Severity::Infoerr, None, line, stream_id);
        }
    }
}

fn spawn_drain(
    reader: Reader,
    diag: Arc<dyn DiagSink>,
    severity: Severity,
    ring: Option<Arc<parking_lot::Mutex<OutputRing>>>,
    sdk_missing: Option<Arc<AtomicBool>>,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let stream_id = next_stream_id();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if let Some(flag) = &sdk_missing {
                if line.contains(POLICY_SDK_MISSING_MARKER) {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            if let Some(ring) = &ring {
                ring.lock().push(line.clone());
            }
            diag.log(severity, None, &line, stream_id);
        }
        let _ = done_tx.send(());
    });
    done_rx
}

/// Read the port line a freshly spawned plugin prints: one byte at a time
/// until the first newline, tolerating stray whitespace and the OSC progress
/// sequences some runtimes emit.
pub(crate) async fn read_port(reader: &mut Reader) -> Result<u16, Error> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await.map_err(|e| Error::Launch {
            plugin: String::new(),
            reason: format!("could not read plugin stdout: {e}"),
        })?;
        if n == 0 {
            let partial = String::from_utf8_lossy(&line);
            return Err(Error::Launch {
                plugin: String::new(),
                reason: if partial.trim().is_empty() {
                    "plugin exited before printing its port".to_string()
                } else {
                    format!("plugin exited before printing its port (stdout so far: {partial:?})")
                },
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&line);
    let cleaned = strip_osc_sequences(&text);
    let trimmed = cleaned.trim();
    match trimmed.parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(Error::Launch {
            plugin: String::new(),
            reason: format!("plugin printed {trimmed:?} instead of a port number"),
        }),
    }
}

/// Remove OSC control sequences (`ESC ] ... ESC \`) from a port line. Some
/// language runtimes emit progress sequences like `\x1b]9;4;...\x1b\\`
/// around their first output.
fn strip_osc_sequences(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b']') {
            i += 2;
            while i < bytes.len() {
                if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

/// Dial a plugin endpoint, retrying until the 10 s budget is spent.
pub(crate) async fn dial(plugin: &str, addr: &str) -> Result<Channel, Error> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
        .connect_timeout(RPC_DIAL_TIMEOUT)
        .tcp_nodelay(true);
    let deadline = Instant::now() + RPC_DIAL_TIMEOUT;
    loop {
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(_) if Instant::now() < deadline => tokio::time::sleep(RETRY_NAP).await,
            Err(_) => {
                return Err(Error::DialTimeout {
                    plugin: plugin.to_string(),
                    timeout: RPC_DIAL_TIMEOUT,
                });
            }
        }
    }
}

/// Run a handshake-style probe, retrying on `Unavailable` within the dial
/// budget. Freshly connected channels can report `Unavailable` for a beat
/// even after the transport is up.
pub(crate) async fn handshake_retry<T, Fut, F>(mut call: F) -> Result<T, tonic::Status>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, tonic::Status>>,
{
    let deadline = Instant::now() + RPC_DIAL_TIMEOUT;
    loop {
        match call().await {
            Err(status)
                if status.code() == tonic::Code::Unavailable && Instant::now() < deadline =>
            {
                tokio::time::sleep(RETRY_NAP).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn port_from(bytes: &'static [u8]) -> Result<u16, Error> {
        let mut reader: Reader = Box::new(bytes);
        read_port(&mut reader).await
    }

    #[tokio::test]
    async fn reads_a_plain_port_line() {
        assert_eq!(port_from(b"50051\n").await.unwrap(), 50051);
    }

    #[tokio::test]
    async fn tolerates_whitespace_and_osc_sequences() {
        assert_eq!(port_from(b"\x1b]9;4;3;\x1b\\1234 \r\n").await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn rejects_non_numeric_port_lines() {
        assert!(port_from(b"error: cannot listen\n").await.is_err());
        assert!(port_from(b"70000\n").await.is_err());
        assert!(port_from(b"0\n").await.is_err());
    }

    #[tokio::test]
    async fn rejects_eof_before_newline() {
        assert!(port_from(b"50051").await.is_err());
    }

    #[test]
    fn logging_args_are_prepended_in_order() {
        let logging = HostLogging {
            log_to_stderr: true,
            verbose: 9,
            tracing_endpoint: Some("http://127.0.0.1:9411".into()),
        };
        assert_eq!(
            logging.plugin_args(),
            vec![
                "--logtostderr".to_string(),
                "-v=9".to_string(),
                "--tracing".to_string(),
                "http://127.0.0.1:9411".to_string(),
            ]
        );
    }
}
