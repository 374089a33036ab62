//! Local model server provider.
//!
//! Wire shape: `POST {endpoint}/api/chat` with generation knobs under
//! `options`. Streams are JSON-lines with the delta at `message.content` and
//! a final `{"done": true}` record carrying token counts.

use crate::config::ProviderConfig;
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::params::Params;
use crate::pipeline::{decode_lines, lines_from_bytes, DecodeContext, JsonLinesParser, TextStream};
use crate::providers::{downgraded, hold, CallContext, Completion, ConcurrencyLimit, Provider};
use crate::registry::ModelDescriptor;
use crate::transport::HttpTransport;
use crate::types::{BackendKind, Message, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

const CHAT_PATH: &str = "/api/chat";
const DEFAULT_CONTENT_PATH: &str = "message.content";

pub struct LocalServer {
    config: ProviderConfig,
    transport: HttpTransport,
    parser: JsonLinesParser,
    limit: ConcurrencyLimit,
}

impl std::fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServer")
            .field("name", &self.config.name)
            .field("endpoint", &self.transport.base_url())
            .finish()
    }
}

impl LocalServer {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        let path = config.delta_path.as_deref().unwrap_or(DEFAULT_CONTENT_PATH);
        let parser = JsonLinesParser::with_content_path(path).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid delta_path: {}", e),
                ErrorContext::new()
                    .with_field_path("delta_path")
                    .with_source(format!("provider:{}", config.name)),
            )
        })?;
        let limit = ConcurrencyLimit::new(config.name.clone(), config.max_concurrency);
        Ok(Self {
            config,
            transport,
            parser,
            limit,
        })
    }

    fn body(&self, descriptor: &ModelDescriptor, messages: &[Message], params: &Params, stream: bool) -> Value {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut v = json!({"role": m.role.as_str(), "content": m.content});
                if !m.images.is_empty() {
                    v["images"] = json!(m.images);
                }
                v
            })
            .collect();
        let mut options = Map::new();
        let mut format = None;
        for (k, v) in params {
            if k == "format" {
                if v.as_str() == Some("json") {
                    format = Some(v.clone());
                }
                continue;
            }
            options.insert(k.clone(), v.clone());
        }
        let mut body = json!({
            "model": descriptor.location,
            "messages": wire,
            "stream": stream,
            "options": options,
        });
        if let Some(f) = format {
            body["format"] = f;
        }
        body
    }
}

#[async_trait]
impl Provider for LocalServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::LocalServerHttp
    }

    async fn execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<Completion> {
        let _permit = self.limit.acquire(ctx).await?;
        let body = self.body(descriptor, messages, params, false);
        let resp = self
            .transport
            .post_json(CHAT_PATH, &body, &ctx.trace_id, false, Some(ctx.attempt_timeout))
            .await?;
        let value = self.transport.read_json(resp).await?;
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(Error::Classified(
                ClassifiedError::new(ErrorKind::Server, err).with_provider(self.config.name.clone()),
            ));
        }
        let text = value
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Classified(
                    ClassifiedError::new(ErrorKind::Decode, "response has no message.content")
                        .with_provider(self.config.name.clone()),
                )
            })?;
        let usage = Usage {
            prompt_tokens: value.get("prompt_eval_count").and_then(Value::as_u64),
            completion_tokens: value.get("eval_count").and_then(Value::as_u64),
        };
        Ok(Completion::new(text).with_usage(usage))
    }

    async fn stream_execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<TextStream> {
        if !self.config.streaming {
            let completion = self.execute(descriptor, messages, params, ctx).await?;
            return Ok(downgraded(&self.config.name, ctx, completion));
        }
        let permit = self.limit.acquire(ctx).await?;
        let body = self.body(descriptor, messages, params, true);
        let resp = self
            .transport
            .post_json(CHAT_PATH, &body, &ctx.trace_id, true, None)
            .await?;
        let lines = lines_from_bytes(self.transport.byte_stream(resp));
        let deltas = decode_lines(
            lines,
            self.parser.clone(),
            DecodeContext::new(self.config.name.clone(), ctx.trace_id.clone())
                .with_usage(ctx.usage.clone()),
        );
        Ok(hold(deltas, permit))
    }

    fn validate_config(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.backend_kind != BackendKind::LocalServerHttp {
            return Err(Error::configuration_with_context(
                "backend_kind must be local-server-http",
                ErrorContext::new()
                    .with_field_path("backend_kind")
                    .with_source(format!("provider:{}", self.config.name)),
            ));
        }
        Ok(())
    }
}
