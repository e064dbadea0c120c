//! Diagnostic sinks.
//!
//! The host never prints to the terminal itself; everything a plugin says and
//! everything the host wants the user to see is routed through an injected
//! [`DiagSink`]. Stream IDs let the engine correlate interleaved output: each
//! plugin stdout/stderr stream is assigned its own ID from a process-wide
//! monotonic counter.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::urn::Urn;

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Debug output, hidden unless verbose logging is on.
    Debug,
    /// Informational output destined for the info stream.
    Info,
    /// Informational output destined for the error stream (e.g. plugin
    /// stderr that is not itself an error).
    Infoerr,
    /// A warning.
    Warning,
    /// An error.
    Error,
}

/// A sink for diagnostics emitted by the host and its plugins.
///
/// Implementations are provided by the embedding engine; the host treats the
/// sink as opaque.
pub trait DiagSink: Send + Sync {
    /// Record a persistent diagnostic message.
    fn log(&self, severity: Severity, urn: Option<&Urn>, message: &str, stream_id: i32);

    /// Record a transient status message, shown only in progress-style UIs.
    fn log_status(&self, severity: Severity, urn: Option<&Urn>, message: &str, stream_id: i32);
}

static NEXT_STREAM_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate the next diagnostic stream ID. IDs are strictly increasing across
/// all plugins in the process, giving a total order over interleaved streams.
pub fn next_stream_id() -> i32 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst)
}

/// A sink that forwards everything to the `log` crate. Useful for embedders
/// that have no richer diagnostics pipeline.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagSink for LogSink {
    fn log(&self, severity: Severity, urn: Option<&Urn>, message: &str, _stream_id: i32) {
        let target = urn.map(|u| u.to_string()).unwrap_or_default();
        match severity {
            Severity::Debug => log::debug!("{target}{message}"),
            Severity::Info | Severity::Infoerr => log::info!("{target}{message}"),
            Severity::Warning => log::warn!("{target}{message}"),
            Severity::Error => log::error!("{target}{message}"),
        }
    }

    fn log_status(&self, severity: Severity, urn: Option<&Urn>, message: &str, stream_id: i32) {
        self.log(severity, urn, message, stream_id);
    }
}

/// A sink that records every message in memory. Intended for tests and for
/// embedders that post-process diagnostics themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: parking_lot::Mutex<Vec<DiagEntry>>,
}

/// One recorded diagnostic.
#[derive(Debug, Clone)]
pub struct DiagEntry {
    pub severity: Severity,
    pub urn: Option<Urn>,
    pub message: String,
    pub stream_id: i32,
    pub ephemeral: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the recorded entries.
    pub fn entries(&self) -> Vec<DiagEntry> {
        self.entries.lock().clone()
    }
}

impl DiagSink for MemorySink {
    fn log(&self, severity: Severity, urn: Option<&Urn>, message: &str, stream_id: i32) {
        self.entries.lock().push(DiagEntry {
            severity,
            urn: urn.cloned(),
            message: message.to_string(),
            stream_id,
            ephemeral: false,
        });
    }

    fn log_status(&self, severity: Severity, urn: Option<&Urn>, message: &str, stream_id: i32) {
        self.entries.lock().push(DiagEntry {
            severity,
            urn: urn.cloned(),
            message: message.to_string(),
            stream_id,
            ephemeral: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_strictly_increasing() {
        let a = next_stream_id();
        let b = next_stream_id();
        let c = next_stream_id();
        assert!(a < b && b < c);
    }
}
