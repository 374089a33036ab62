//! Per-call request and response values.

use crate::params::Params;
use crate::resilience::FallbackStrategy;
use crate::types::{Message, MessageRole, Usage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Model id that asks the router to pick a model by use case.
pub const AUTO_MODEL: &str = "auto";

#[derive(Debug, Clone)]
pub struct Request {
    pub model_id: String,
    pub messages: Vec<Message>,
    /// Canonical parameter names; normalized per backend by the router.
    pub params: Params,
    pub stream: bool,
    /// Generated when absent.
    pub trace_id: Option<String>,
    /// Falls back to the router default.
    pub timeout_total_ms: Option<u64>,
    pub fallback_strategy: Option<FallbackStrategy>,
    /// Continue an existing session instead of opening a new one.
    pub session_id: Option<String>,
    /// Write the exchange to the session store (when one is configured).
    pub journal: bool,
    pub cancel: CancellationToken,
}

impl Request {
    pub fn new(model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            params: Params::new(),
            stream: false,
            trace_id: None,
            timeout_total_ms: None,
            fallback_strategy: None,
            session_id: None,
            journal: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Single user turn.
    pub fn prompt(model_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(model_id, vec![Message::user(text)])
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_total_ms = Some(ms);
        self
    }

    pub fn with_strategy(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback_strategy = Some(strategy);
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn without_journal(mut self) -> Self {
        self.journal = false;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Text of the last user message, used for use-case detection.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Result of a non-streaming route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutput {
    pub text: String,
    pub usage: Usage,
    pub trace_id: String,
    pub model_id: String,
    pub provider: String,
    pub attempts: u32,
    pub session_id: Option<String>,
}
