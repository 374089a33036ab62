//! Classification of transport failures and the kind-level retry table.

use llm_router::classify::{classify_http, classify_transport, retry_after_ms};
use llm_router::ErrorKind;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use std::time::Duration;

const ALL: [ErrorKind; 14] = [
    ErrorKind::Auth,
    ErrorKind::RateLimit,
    ErrorKind::NotFound,
    ErrorKind::InvalidRequest,
    ErrorKind::Server,
    ErrorKind::NetworkTimeout,
    ErrorKind::NetworkConnect,
    ErrorKind::Decode,
    ErrorKind::UnsupportedCapability,
    ErrorKind::DataIntegrity,
    ErrorKind::Cancelled,
    ErrorKind::DeadlineExceeded,
    ErrorKind::AllProvidersFailed,
    ErrorKind::Unknown,
];

#[test]
fn test_only_transient_kinds_retry() {
    let retryable: Vec<_> = ALL.iter().filter(|k| k.default_retryable()).copied().collect();
    assert_eq!(
        retryable,
        vec![
            ErrorKind::RateLimit,
            ErrorKind::Server,
            ErrorKind::NetworkTimeout,
            ErrorKind::NetworkConnect
        ]
    );
    for kind in ALL {
        assert_eq!(
            kind.default_retry_after_ms().is_some(),
            kind.default_retryable(),
            "{}",
            kind
        );
    }
}

#[test]
fn test_request_shaped_failures_do_not_fall_back() {
    for kind in [
        ErrorKind::InvalidRequest,
        ErrorKind::UnsupportedCapability,
        ErrorKind::Cancelled,
        ErrorKind::DeadlineExceeded,
        ErrorKind::AllProvidersFailed,
    ] {
        assert!(!kind.is_fallbackable(), "{}", kind);
    }
    assert!(ErrorKind::Auth.is_fallbackable());
    assert!(ErrorKind::Auth.is_user_facing());
    assert!(!ErrorKind::Server.is_user_facing());
    assert!(ErrorKind::Cancelled.is_interruption());
}

#[test]
fn test_wire_names_round_trip() {
    for kind in ALL {
        assert_eq!(ErrorKind::from_name(kind.name()), Some(kind));
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, format!("\"{}\"", kind.name()));
    }
    assert_eq!(ErrorKind::from_name("rate_limited"), None);
}

#[test]
fn test_retry_after_http_date() {
    let when = chrono::Utc::now() + chrono::Duration::seconds(30);
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_str(&when.to_rfc2822()).unwrap());
    let ms = retry_after_ms(&headers).unwrap();
    assert!(ms > 25_000 && ms <= 30_000, "{}", ms);

    let e = classify_http(429, &headers, "slow down", "p1");
    assert_eq!(e.kind, ErrorKind::RateLimit);
    let hinted = e.retry_after_ms.unwrap();
    assert!(hinted > 25_000 && hinted <= 30_000, "{}", hinted);

    headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
    assert_eq!(retry_after_ms(&headers), None);
}

#[tokio::test]
async fn test_refused_connection_is_network_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = reqwest::Client::new()
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap_err();
    let classified = classify_transport(&err, "p1");
    assert_eq!(classified.kind, ErrorKind::NetworkConnect);
    assert!(classified.retryable);
    assert_eq!(classified.retry_after_ms, Some(10_000));
}

#[tokio::test]
async fn test_silent_server_is_network_timeout() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        // accept and hold the socket open without answering
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let err = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap()
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap_err();
    let classified = classify_transport(&err, "p1");
    assert_eq!(classified.kind, ErrorKind::NetworkTimeout);
    assert_eq!(classified.provider_name.as_deref(), Some("p1"));
    server.abort();
}
