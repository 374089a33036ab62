//! Caller-facing handle for a streamed route.

use crate::error_kind::ClassifiedError;
use crate::types::Usage;
use crate::{Error, PipeResult, Result};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// How a streamed route ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    /// Cancelled by the caller, or the caller dropped the stream.
    Cancelled,
    Failed(ClassifiedError),
}

/// Final accounting for a streamed route, available after the driver stops.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub trace_id: String,
    pub model_id: String,
    pub provider: Option<String>,
    /// Every delta received from the provider, concatenated.
    pub text: String,
    /// Usage the backend reported in-band; empty when it reported none.
    pub usage: Usage,
    pub attempts: u32,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub outcome: StreamOutcome,
}

/// Lazy, finite, single-pass sequence of text deltas.
///
/// Dropping the stream, or calling [`RouteStream::cancel`], aborts the
/// provider call and frees its slot. A provider failure ends the stream with
/// one `Err` item.
pub struct RouteStream {
    rx: ReceiverStream<PipeResult<String>>,
    cancel: CancellationToken,
    driver: JoinHandle<StreamSummary>,
    trace_id: String,
}

impl RouteStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<PipeResult<String>>,
        cancel: CancellationToken,
        driver: JoinHandle<StreamSummary>,
        trace_id: String,
    ) -> Self {
        Self {
            rx: ReceiverStream::new(rx),
            cancel,
            driver,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Abort the underlying call. Deltas already buffered stay readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop reading and wait for the driver to finish journaling.
    ///
    /// Undrained deltas are discarded; if the provider was still producing,
    /// the route ends as cancelled.
    pub async fn join(self) -> Result<StreamSummary> {
        let Self { rx, driver, .. } = self;
        drop(rx);
        driver.await.map_err(|e| {
            Error::classified(
                crate::error_kind::ErrorKind::Unknown,
                format!("stream driver failed: {}", e),
            )
        })
    }
}

impl Stream for RouteStream {
    type Item = PipeResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl std::fmt::Debug for RouteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteStream")
            .field("trace_id", &self.trace_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
