//! Backend providers.
//!
//! A [`Provider`] turns one model descriptor plus a message list into text,
//! either all at once ([`Provider::execute`]) or as a lazy sequence of deltas
//! ([`Provider::stream_execute`]). Every failure leaving a provider is already
//! classified (see [`crate::classify`]).
//!
//! | Variant              | Backend                                        |
//! |----------------------|------------------------------------------------|
//! | [`LocalInference`]   | native binary driven over argv + pipes         |
//! | [`RemoteChat`]       | chat-completions style HTTPS API (SSE)         |
//! | [`LocalServer`]      | local model server speaking JSON-lines         |
//! | [`ScriptedProvider`] | in-process scripted responses for tests        |

pub mod local_inference;
pub mod local_server;
pub mod mock;
pub mod remote_chat;

pub use local_inference::LocalInference;
pub use local_server::LocalServer;
pub use mock::{Script, ScriptedProvider};
pub use remote_chat::RemoteChat;

use crate::config::{HardwareProfile, ProviderConfig};
use crate::error_kind::ClassifiedError;
use crate::params::Params;
use crate::pipeline::{single_delta, TextStream, UsageCell};
use crate::registry::ModelDescriptor;
use crate::types::{BackendKind, Message, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Per-attempt call context handed to a provider.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub trace_id: String,
    pub cancel: CancellationToken,
    /// Upper bound for this attempt, already clipped to the request deadline.
    pub attempt_timeout: Duration,
    /// 1-based attempt number within the retry envelope.
    pub attempt: u32,
    /// Where a streaming call leaves the usage its backend reported.
    pub usage: UsageCell,
}

impl CallContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            cancel: CancellationToken::new(),
            attempt_timeout: Duration::from_secs(120),
            attempt: 1,
            usage: UsageCell::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Full response of a non-streaming call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Uniform contract over every backend.
///
/// Implementations are shared across tasks and must tolerate concurrent calls.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Stable name used in logs, health records and fallback configuration.
    fn name(&self) -> &str;

    fn backend_kind(&self) -> BackendKind;

    async fn execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<Completion>;

    /// Finite, non-restartable sequence of text deltas.
    async fn stream_execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<TextStream>;

    fn validate_config(&self) -> Result<()>;
}

/// Build the provider described by `config`.
pub fn build_provider(
    config: &ProviderConfig,
    profile: &HardwareProfile,
) -> Result<Arc<dyn Provider>> {
    config.validate()?;
    let provider: Arc<dyn Provider> = match config.backend_kind {
        BackendKind::LocalInference => Arc::new(LocalInference::new(config.clone(), profile.clone())?),
        BackendKind::RemoteChatHttp => Arc::new(RemoteChat::new(config.clone())?),
        BackendKind::LocalServerHttp => Arc::new(LocalServer::new(config.clone())?),
    };
    Ok(provider)
}

/// Bounds in-flight calls for one provider.
#[derive(Debug, Clone)]
pub(crate) struct ConcurrencyLimit {
    permits: Arc<Semaphore>,
    provider: String,
}

impl ConcurrencyLimit {
    pub(crate) fn new(provider: impl Into<String>, max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max.max(1))),
            provider: provider.into(),
        }
    }

    /// Wait for a slot, giving up on cancellation.
    pub(crate) async fn acquire(&self, ctx: &CallContext) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Error::Classified(
                ClassifiedError::cancelled().with_provider(self.provider.clone()),
            )),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| {
                Error::classified(crate::error_kind::ErrorKind::Unknown, "provider is shut down")
            }),
        }
    }
}

/// Keep `guard` alive for as long as the stream is.
pub(crate) fn hold<G: Send + Sync + 'static>(stream: TextStream, guard: G) -> TextStream {
    Box::pin(stream.map(move |item| {
        let _held = &guard;
        item
    }))
}

/// Stream emulation for a backend configured without streaming.
pub(crate) fn downgraded(provider: &str, ctx: &CallContext, completion: Completion) -> TextStream {
    tracing::info!(
        trace_id = %ctx.trace_id,
        event = "capability-downgrade",
        provider = %provider,
        capability = "streaming",
        "backend cannot stream; returning the full response as one delta"
    );
    if completion.usage.total().is_some() {
        ctx.usage.record(completion.usage);
    }
    single_delta(completion.text)
}

/// Plain-text prompt for backends that take a single string.
pub fn render_prompt(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let label = match m.role {
            crate::types::MessageRole::System => "### System",
            crate::types::MessageRole::User => "### User",
            crate::types::MessageRole::Assistant => "### Assistant",
        };
        out.push_str(label);
        out.push_str(":\n");
        out.push_str(&m.content);
        out.push_str("\n\n");
    }
    out.push_str("### Assistant:\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prompt() {
        let p = render_prompt(&[Message::system("be brief"), Message::user("hi")]);
        assert_eq!(
            p,
            "### System:\nbe brief\n\n### User:\nhi\n\n### Assistant:\n"
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_respects_cancel() {
        let limit = ConcurrencyLimit::new("p", 1);
        let ctx = CallContext::new("t");
        let _first = limit.acquire(&ctx).await.unwrap();
        ctx.cancel.cancel();
        let err = limit.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error_kind::ErrorKind::Cancelled);
    }
}
