//! Structured logging.
//!
//! Logs are newline-delimited JSON, one object per event:
//!
//! ```text
//! {"timestamp":"2026-03-01T10:00:00.000000Z","level":"INFO","message":"provider attempt","trace_id":"…","event":"provider_attempt","provider":"p1","attempt":1}
//! ```
//!
//! Every line passes through [`redact`] before it reaches the sink, so a
//! secret that slips into a field value (an echoed backend body, a header)
//! is masked at the last possible point.
//!
//! There is no process-wide logging state inside the crate beyond the
//! subscriber itself: per-request identity travels as `trace_id` on each
//! event, supplied by the caller's context.

pub mod redact;

pub use redact::{redact, REDACTION_TOKEN};

use crate::{Error, ErrorContext, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the log filter.
pub const LOG_FILTER_ENV: &str = "LLM_ROUTER_LOG";

/// Where NDJSON lines go.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
    /// Append to a file, created if missing.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub target: LogTarget,
    /// Filter directive used when `LLM_ROUTER_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            target: LogTarget::Stderr,
            default_filter: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Fresh per-request correlation id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Build the NDJSON subscriber over any writer factory.
pub fn json_subscriber<W>(
    filter: EnvFilter,
    make_writer: W,
) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(RedactingMakeWriter::new(make_writer))
        .finish()
}

/// Install the global NDJSON subscriber. Call once at startup.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| {
            Error::configuration_with_context(
                format!("invalid log filter: {}", e),
                ErrorContext::new().with_field_path(LOG_FILTER_ENV),
            )
        })?;

    let writer = match config.target {
        LogTarget::Stderr => BoxMakeWriter::new(io::stderr),
        LogTarget::Stdout => BoxMakeWriter::new(io::stdout),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    tracing::subscriber::set_global_default(json_subscriber(filter, writer)).map_err(|e| {
        Error::configuration_with_context(
            format!("logging already initialized: {}", e),
            ErrorContext::new().with_source("telemetry"),
        )
    })
}

/// Writer factory that masks secrets in each formatted event.
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Buffers one event and writes its masked form when flushed or dropped.
pub struct RedactingWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    fn drain(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf);
        let masked = redact(&text);
        self.inner.write_all(masked.as_bytes())?;
        self.buf.clear();
        self.inner.flush()
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain();
    }
}

/// In-memory log sink, handy for asserting on emitted events.
#[derive(Clone, Default)]
pub struct MemoryLogWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured output as text.
    pub fn contents(&self) -> String {
        let guard = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    }

    /// Captured output parsed line by line; non-JSON lines are skipped.
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.contents()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

pub struct MemoryLogGuard {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemoryLogGuard {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut guard = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MemoryLogWriter {
    type Writer = MemoryLogGuard;

    fn make_writer(&'a self) -> Self::Writer {
        MemoryLogGuard {
            buf: self.buf.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_ndjson_with_masked_secrets() {
        let sink = MemoryLogWriter::new();
        let subscriber = json_subscriber(EnvFilter::new("info"), sink.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                trace_id = "t-1",
                event = "provider_attempt",
                header = "Bearer abcdef123456",
                "attempt started"
            );
            tracing::debug!(trace_id = "t-1", "filtered out");
        });

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev["trace_id"], "t-1");
        assert_eq!(ev["event"], "provider_attempt");
        assert_eq!(ev["level"], "INFO");
        assert!(ev["timestamp"].as_str().is_some());
        assert!(!sink.contents().contains("abcdef123456"));
    }

    #[test]
    fn test_trace_ids_are_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
    }
}
