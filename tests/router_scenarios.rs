//! End-to-end routing scenarios against scripted providers and mock HTTP backends.

use futures::StreamExt;
use llm_router::config::{ProviderConfig, RouterSettings};
use llm_router::providers::{RemoteChat, Script, ScriptedProvider};
use llm_router::resilience::{FallbackStrategy, HealthState};
use llm_router::router::StreamOutcome;
use llm_router::session::StoreConfig;
use llm_router::telemetry::{json_subscriber, MemoryLogWriter};
use llm_router::types::Usage;
use llm_router::{
    BackendKind, ErrorKind, Message, MessageRole, ModelDescriptor, Request, Router, SessionStore,
};
use mockito::Server;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const KEY_ENV: &str = "LLM_ROUTER_SCENARIO_KEY";

fn chat_model() -> ModelDescriptor {
    ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x").with_display_name("Chat A")
}

async fn store() -> (tempfile::TempDir, SessionStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(StoreConfig::at(dir.path().join("sessions.db")))
        .await
        .unwrap();
    (dir, store)
}

fn fast_settings(max_attempts: u32) -> RouterSettings {
    let mut settings = RouterSettings::default();
    settings.retry = settings
        .retry
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(1));
    settings.default_fallback_strategy = FallbackStrategy::FirstAvailable;
    settings
}

fn remote(name: &str, url: &str) -> Arc<RemoteChat> {
    std::env::set_var(KEY_ENV, "sk-test-0123456789");
    let config = ProviderConfig::new(name, BackendKind::RemoteChatHttp)
        .with_endpoint(url)
        .with_credential_ref(KEY_ENV);
    Arc::new(RemoteChat::new(config).unwrap())
}

#[tokio::test]
async fn test_single_call_is_journaled() {
    let (_dir, store) = store().await;
    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(Arc::new(
            ScriptedProvider::new("mock", BackendKind::RemoteChatHttp).always(Script::reply("hello")),
        ))
        .with_store(store.clone())
        .build()
        .unwrap();

    let request = Request::new("m-chat-a", vec![Message::user("hi")])
        .with_param("temperature", 0.7)
        .with_param("max_tokens", 16);
    let out = router.complete(request).await.unwrap();
    assert_eq!(out.text, "hello");

    let sessions = store.list_sessions(10, 0).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session_id = out.session_id.unwrap();
    assert_eq!(sessions[0].session_id, session_id);
    assert_eq!(sessions[0].message_count, 2);

    let history = store.get_history(&session_id).await.unwrap();
    let turns: Vec<(MessageRole, &str)> = history.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(turns, vec![(MessageRole::User, "hi"), (MessageRole::Assistant, "hello")]);
    assert_eq!(history[0].sequence_number + 1, history[1].sequence_number);
    assert_eq!(history[1].metadata["trace_id"], out.trace_id.as_str());
}

#[tokio::test]
async fn test_rate_limit_falls_back_to_next_provider() {
    let mut s1 = Server::new_async().await;
    let mut s2 = Server::new_async().await;
    let limited = s1
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("retry-after", "0")
        .with_body(r#"{"error":{"message":"slow down"}}"#)
        .expect(2)
        .create_async()
        .await;
    let ok = s2
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#)
        .expect(1)
        .create_async()
        .await;

    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(remote("p1", &s1.url()))
        .with_provider(remote("p2", &s2.url()))
        .with_settings(fast_settings(2))
        .build()
        .unwrap();

    let sink = MemoryLogWriter::new();
    let _guard = tracing::subscriber::set_default(json_subscriber(EnvFilter::new("info"), sink.clone()));

    let out = router
        .complete(Request::prompt("m-chat-a", "hi").with_trace_id("trace-fallback"))
        .await
        .unwrap();
    assert_eq!(out.text, "ok");
    assert_eq!(out.provider, "p2");
    assert_eq!(out.attempts, 3);
    assert_eq!(router.provider_health("p1").unwrap().state, HealthState::Degraded);
    assert_eq!(router.provider_health("p2").unwrap().state, HealthState::Healthy);
    limited.assert_async().await;
    ok.assert_async().await;

    let events = sink.events();
    let ours: Vec<_> = events.iter().filter(|e| e["trace_id"] == "trace-fallback").collect();
    let attempts = ours.iter().filter(|e| e["event"] == "provider_attempt").count();
    assert_eq!(attempts, 3);
    assert!(ours.iter().any(|e| e["event"] == "fallback_handoff" && e["from"] == "p1"));
    assert!(ours.iter().any(|e| e["event"] == "fallback_success" && e["provider"] == "p2"));
    assert!(!sink.contents().contains("sk-test-0123456789"));
}

#[tokio::test]
async fn test_server_error_without_retry_hint_falls_back_before_deadline() {
    let mut s1 = Server::new_async().await;
    let mut s2 = Server::new_async().await;
    let down = s1
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body(r#"{"error":{"message":"overloaded"}}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = s2
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#)
        .expect(1)
        .create_async()
        .await;

    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(remote("p1", &s1.url()))
        .with_provider(remote("p2", &s2.url()))
        .with_settings(fast_settings(3))
        .build()
        .unwrap();

    // a 5xx without Retry-After waits 60s before a retry, more than this request allows
    let out = router
        .complete(Request::prompt("m-chat-a", "hi").with_timeout_ms(10_000))
        .await
        .unwrap();
    assert_eq!(out.text, "ok");
    assert_eq!(out.provider, "p2");
    assert_eq!(out.attempts, 2);
    down.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let (_dir, store) = store().await;
    let mut server = Server::new_async().await;
    let denied = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"bad key"}}"#)
        .expect(1)
        .create_async()
        .await;

    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(remote("p1", &server.url()))
        .with_settings(fast_settings(3))
        .with_store(store.clone())
        .build()
        .unwrap();

    let err = router.complete(Request::prompt("m-chat-a", "hi")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    denied.assert_async().await;

    let sessions = store.list_sessions(10, 0).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let history = store.get_history(&sessions[0].session_id).await.unwrap();
    assert_eq!(history.len(), 2);
    let marker = &history[1];
    assert_eq!(marker.role, MessageRole::Assistant);
    assert_eq!(marker.content, "");
    assert_eq!(marker.metadata["error_kind"], "auth");
}

#[tokio::test]
async fn test_stream_cancel_aborts_and_keeps_partial_text() {
    let (_dir, store) = store().await;
    let provider = Arc::new(
        ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
            .always(Script::StreamThenHang(vec!["partial ".to_string()])),
    );
    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(provider.clone())
        .with_store(store.clone())
        .build()
        .unwrap();

    let mut stream = router.stream(Request::prompt("m-chat-a", "tell me a story")).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, "partial ");

    let cancelled_at = tokio::time::Instant::now();
    stream.cancel();
    let summary = stream.join().await.unwrap();
    assert_eq!(summary.outcome, StreamOutcome::Cancelled);
    assert_eq!(summary.text, "partial ");

    let dropped_at = provider.stream_dropped_at().expect("provider stream released");
    assert!(dropped_at.duration_since(cancelled_at) < Duration::from_millis(200));

    let history = store.get_history(&summary.session_id.unwrap()).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(last.content, "partial ");
    assert_eq!(last.metadata["cancelled"], true);
}

#[tokio::test]
async fn test_dropping_stream_releases_provider() {
    let provider = Arc::new(
        ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
            .always(Script::StreamThenHang(vec!["a".to_string()])),
    );
    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(provider.clone())
        .build()
        .unwrap();

    let mut stream = router.stream(Request::prompt("m-chat-a", "hi")).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    while provider.stream_dropped_at().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "stream not released in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_streamed_remote_chat_over_sse() {
    let mut server = Server::new_async().await;
    let body = [
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
        "data: [DONE]",
    ]
    .iter()
    .map(|l| format!("{}\n\n", l))
    .collect::<String>();
    let _m = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(remote("p1", &server.url()))
        .build()
        .unwrap();
    let stream = router.stream(Request::prompt("m-chat-a", "hi")).await.unwrap();
    let deltas: Vec<String> = stream.map(|d| d.unwrap()).collect().await;
    assert_eq!(deltas.concat(), "Hello");
}

#[tokio::test]
async fn test_streamed_usage_is_journaled_like_complete() {
    let (_dir, store) = store().await;
    let usage = Usage {
        prompt_tokens: Some(3),
        completion_tokens: Some(2),
    };
    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(Arc::new(
            ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
                .always(Script::ReplyWithUsage("hello".to_string(), usage)),
        ))
        .with_store(store.clone())
        .build()
        .unwrap();

    let out = router.complete(Request::prompt("m-chat-a", "hi")).await.unwrap();
    let complete_session = store.get_session(&out.session_id.unwrap()).await.unwrap();
    assert_eq!(complete_session.total_tokens, 5);

    let mut stream = router.stream(Request::prompt("m-chat-a", "hi")).await.unwrap();
    while let Some(delta) = stream.next().await {
        delta.unwrap();
    }
    let summary = stream.join().await.unwrap();
    assert_eq!(summary.outcome, StreamOutcome::Completed);
    assert_eq!(summary.usage.total(), Some(5));
    let streamed_session = store.get_session(&summary.session_id.unwrap()).await.unwrap();
    assert_eq!(streamed_session.total_tokens, 5);
}

#[tokio::test]
async fn test_sse_usage_frame_reaches_the_journal() {
    let (_dir, store) = store().await;
    let mut server = Server::new_async().await;
    let body = [
        r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"!"}}]}"#,
        r#"data: {"choices":[],"usage":{"prompt_tokens":11,"completion_tokens":2}}"#,
        "data: [DONE]",
    ]
    .iter()
    .map(|l| format!("{}\n\n", l))
    .collect::<String>();
    let _m = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(remote("p1", &server.url()))
        .with_store(store.clone())
        .build()
        .unwrap();
    let mut stream = router.stream(Request::prompt("m-chat-a", "hi")).await.unwrap();
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        text.push_str(&delta.unwrap());
    }
    let summary = stream.join().await.unwrap();
    assert_eq!(text, "Hi!");
    assert_eq!(summary.usage.prompt_tokens, Some(11));

    let session_id = summary.session_id.unwrap();
    assert_eq!(store.get_session(&session_id).await.unwrap().total_tokens, 13);
    let history = store.get_history(&session_id).await.unwrap();
    assert_eq!(history[1].tokens_used, Some(13));
}

#[tokio::test]
async fn test_unhealthy_chain_fails_without_calling_providers() {
    let provider = Arc::new(
        ScriptedProvider::new("p1", BackendKind::RemoteChatHttp).always(Script::Fail(
            llm_router::ClassifiedError::new(ErrorKind::Server, "down").with_retry_after_ms(None),
        )),
    );
    let mut settings = fast_settings(5);
    settings.default_fallback_strategy = FallbackStrategy::FirstHealthy;
    let router = Router::builder()
        .with_model(chat_model())
        .with_provider(provider.clone())
        .with_settings(settings)
        .build()
        .unwrap();

    // five failed attempts take the provider to unhealthy
    let err = router.complete(Request::prompt("m-chat-a", "hi")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(router.provider_health("p1").unwrap().state, HealthState::Unhealthy);

    let calls = provider.calls();
    let err = router.complete(Request::prompt("m-chat-a", "hi")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllProvidersFailed);
    assert_eq!(provider.calls(), calls);
}
