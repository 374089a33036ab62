//! Chat-completions style HTTPS provider.
//!
//! Wire shape: `POST {endpoint}/chat/completions` with bearer auth, streamed
//! as server-sent events (`choices.0.delta.content`) or returned whole
//! (`choices.0.message.content`).

use crate::config::ProviderConfig;
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::params::Params;
use crate::pipeline::{decode_lines, lines_from_bytes, DecodeContext, SseLineParser, TextStream};
use crate::providers::{downgraded, hold, CallContext, Completion, ConcurrencyLimit, Provider};
use crate::registry::ModelDescriptor;
use crate::transport::HttpTransport;
use crate::types::{BackendKind, Message, Usage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

const CHAT_PATH: &str = "/chat/completions";

pub struct RemoteChat {
    config: ProviderConfig,
    transport: HttpTransport,
    parser: SseLineParser,
    limit: ConcurrencyLimit,
}

impl std::fmt::Debug for RemoteChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChat")
            .field("name", &self.config.name)
            .field("endpoint", &self.transport.base_url())
            .finish()
    }
}

impl RemoteChat {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        let parser = match config.delta_path.as_deref() {
            Some(path) => SseLineParser::new(path).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid delta_path: {}", e),
                    ErrorContext::new()
                        .with_field_path("delta_path")
                        .with_source(format!("provider:{}", config.name)),
                )
            })?,
            None => SseLineParser::default(),
        };
        let limit = ConcurrencyLimit::new(config.name.clone(), config.max_concurrency);
        Ok(Self {
            config,
            transport,
            parser,
            limit,
        })
    }

    fn body(&self, descriptor: &ModelDescriptor, messages: &[Message], params: &Params, stream: bool) -> Value {
        let wire: Vec<Value> = messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": descriptor.location,
            "messages": wire,
            "stream": stream,
        });
        if let Some(obj) = body.as_object_mut() {
            if stream {
                obj.insert("stream_options".into(), json!({"include_usage": true}));
            }
            for (k, v) in params {
                if k == "response_format" {
                    if v.as_str() == Some("json") {
                        obj.insert(k.clone(), json!({"type": "json_object"}));
                    }
                    continue;
                }
                obj.insert(k.clone(), v.clone());
            }
        }
        body
    }

    fn require_credential(&self) -> Result<()> {
        if self.transport.has_credential() {
            Ok(())
        } else {
            Err(Error::Classified(self.transport.missing_credential()))
        }
    }
}

fn wire_message(m: &Message) -> Value {
    if m.images.is_empty() {
        return json!({"role": m.role.as_str(), "content": m.content});
    }
    let mut parts = vec![json!({"type": "text", "text": m.content})];
    for image in &m.images {
        parts.push(json!({"type": "image_url", "image_url": {"url": image}}));
    }
    json!({"role": m.role.as_str(), "content": parts})
}

fn usage_from(value: &Value) -> Usage {
    Usage {
        prompt_tokens: value.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
        completion_tokens: value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64),
    }
}

#[async_trait]
impl Provider for RemoteChat {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::RemoteChatHttp
    }

    async fn execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<Completion> {
        self.require_credential()?;
        let _permit = self.limit.acquire(ctx).await?;
        let body = self.body(descriptor, messages, params, false);
        let resp = self
            .transport
            .post_json(CHAT_PATH, &body, &ctx.trace_id, false, Some(ctx.attempt_timeout))
            .await?;
        let value = self.transport.read_json(resp).await?;
        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Classified(
                    ClassifiedError::new(
                        ErrorKind::Decode,
                        "response has no choices[0].message.content",
                    )
                    .with_provider(self.config.name.clone()),
                )
            })?;
        Ok(Completion::new(text).with_usage(usage_from(&value)))
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
        self.require_credential()?;
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
        if self.config.backend_kind != BackendKind::RemoteChatHttp {
            return Err(Error::configuration_with_context(
                "backend_kind must be remote-chat-http",
                ErrorContext::new()
                    .with_field_path("backend_kind")
                    .with_source(format!("provider:{}", self.config.name)),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn provider(url: &str) -> RemoteChat {
        std::env::set_var("REMOTE_CHAT_TEST_KEY", "sk-test-abcdefghijklmnopqrstuvwxyz");
        RemoteChat::new(
            ProviderConfig::new("remote-test", BackendKind::RemoteChatHttp)
                .with_endpoint(url)
                .with_credential_ref("REMOTE_CHAT_TEST_KEY"),
        )
        .unwrap()
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x")
    }

    #[tokio::test]
    async fn test_execute_reads_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/chat/completions")
            .match_header(
                "authorization",
                "Bearer sk-test-abcdefghijklmnopqrstuvwxyz",
            )
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "gpt-x",
                "stream": false,
                "temperature": 0.7,
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}],
                    "usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
            )
            .create_async()
            .await;
        let p = provider(&server.url());
        let mut params = Params::new();
        params.insert("temperature".into(), json!(0.7));
        params.insert("response_format".into(), json!("json"));
        let out = p
            .execute(&descriptor(), &[Message::user("hi")], &params, &CallContext::new("t"))
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.usage.total(), Some(4));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_yields_deltas() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;
        let p = provider(&server.url());
        let stream = p
            .stream_execute(&descriptor(), &[Message::user("hi")], &Params::new(), &CallContext::new("t"))
            .await
            .unwrap();
        let parts: Vec<String> = stream.map(|d| d.unwrap()).collect().await;
        assert_eq!(parts, vec!["Hel", "lo"]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"invalid api key"}}"#)
            .create_async()
            .await;
        let p = provider(&server.url());
        let err = p
            .execute(&descriptor(), &[Message::user("hi")], &Params::new(), &CallContext::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(!err.as_classified().unwrap().retryable);
    }

    #[test]
    fn test_images_become_content_parts() {
        let m = Message::user("what is this").with_image("data:image/png;base64,AAAA");
        let v = wire_message(&m);
        assert_eq!(v["content"][1]["type"], "image_url");
    }
}
