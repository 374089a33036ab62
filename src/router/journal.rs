//! Session writes on behalf of one routed request.

use crate::error_kind::ErrorKind;
use crate::registry::ModelDescriptor;
use crate::session::{NewMessage, SessionOptions, SessionStatus, SessionStore};
use crate::types::{Message, MessageRole};
use crate::{Error, Result};
use serde_json::json;

const TITLE_CHARS: usize = 60;

/// What happened on the assistant turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct Turn {
    pub text: String,
    pub tokens: Option<u64>,
    pub duration_ms: u64,
    pub provider: Option<String>,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Journal {
    store: SessionStore,
    session_id: Option<String>,
    trace_id: String,
}

impl Journal {
    /// Check a caller-supplied session before any provider is called.
    pub(crate) async fn open(
        store: &SessionStore,
        session_id: Option<&str>,
        trace_id: &str,
    ) -> Result<Self> {
        if let Some(id) = session_id {
            let session = store.get_session(id).await?;
            if session.status == SessionStatus::Archived {
                return Err(Error::invalid_request(format!("session '{}' is archived", id)));
            }
        }
        Ok(Self {
            store: store.clone(),
            session_id: session_id.map(str::to_string),
            trace_id: trace_id.to_string(),
        })
    }

    /// Write the request messages not yet stored and the assistant turn.
    /// A new session receives every request message; an existing one only
    /// the trailing user message.
    pub(crate) async fn record(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        turn: Turn,
    ) -> Result<String> {
        let mut options = SessionOptions::new();
        let pending: &[Message] = match &self.session_id {
            Some(_) => match messages.last() {
                Some(m) if m.role == MessageRole::User => &messages[messages.len() - 1..],
                _ => &[][..],
            },
            None => {
                if let Some(first) = messages.iter().find(|m| m.role == MessageRole::User) {
                    options = options.with_title(first.content.chars().take(TITLE_CHARS).collect::<String>());
                }
                messages
            }
        };

        let mut batch: Vec<NewMessage> = pending
            .iter()
            .map(|m| {
                NewMessage::new(m.role, m.content.clone())
                    .with_metadata("trace_id", json!(self.trace_id))
            })
            .collect();

        let mut assistant = NewMessage::assistant(turn.text)
            .with_tokens(turn.tokens)
            .with_duration_ms(Some(turn.duration_ms))
            .with_metadata("trace_id", json!(self.trace_id))
            .with_metadata("attempts", json!(turn.attempts));
        if let Some(p) = &turn.provider {
            assistant = assistant.with_metadata("provider", json!(p));
        }
        if let Some(kind) = turn.error_kind {
            assistant = assistant.with_metadata("error_kind", json!(kind.name()));
        }
        if turn.cancelled {
            assistant = assistant.with_metadata("cancelled", json!(true));
        }
        batch.push(assistant);

        let (session_id, written) = self
            .store
            .append_exchange(self.session_id.as_deref(), descriptor, options, batch)
            .await?;

        tracing::info!(
            trace_id = %self.trace_id,
            event = "journal_write",
            session_id = %session_id,
            written = written.len(),
            error_kind = turn.error_kind.map(|k| k.name()).unwrap_or(""),
            cancelled = turn.cancelled,
            "exchange journaled"
        );
        Ok(session_id)
    }
}
