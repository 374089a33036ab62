//! Classification of raw backend failures.
//!
//! | Condition                 | Kind              | retryable | retry_after            |
//! |---------------------------|-------------------|-----------|------------------------|
//! | HTTP 401/403              | `auth`            | no        | -                      |
//! | HTTP 404                  | `not-found`       | no        | -                      |
//! | HTTP 400                  | `invalid-request` | no        | -                      |
//! | HTTP 429                  | `rate-limit`      | yes       | `Retry-After`, else 60s|
//! | HTTP 5xx                  | `server`          | yes       | 60s                    |
//! | timeout                   | `network-timeout` | yes       | 10s                    |
//! | connect/reset             | `network-connect` | yes       | 10s                    |
//! | JSON decode               | `decode`          | no        | -                      |
//! | subprocess non-zero exit  | `server` (crash) / `invalid-request` (bad args) | per kind | - |
//! | anything else             | `unknown`         | no        | -                      |
//!
//! Every function here is pure apart from reading its arguments.

use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::telemetry::redact;
use reqwest::header::HeaderMap;

const MAX_MESSAGE_LEN: usize = 512;

/// First present header among `names`, as a string.
pub fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
    })
}

/// Parse `Retry-After` as delta-seconds (fractions allowed) or an HTTP date.
pub fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = header_first(headers, &["retry-after"])?;
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some((secs * 1000.0).round() as u64);
        }
        return None;
    }
    let when = chrono::DateTime::parse_from_rfc2822(&raw).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_milliseconds().max(0) as u64)
}

/// Best-effort human message from an error body, masked and truncated.
pub fn message_from_body(body: &str) -> String {
    let extracted = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string());
    let masked = redact(&extracted).into_owned();
    truncate(masked, MAX_MESSAGE_LEN)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Map an HTTP error response.
pub fn classify_http(status: u16, headers: &HeaderMap, body: &str, provider: &str) -> ClassifiedError {
    let message = {
        let m = message_from_body(body);
        if m.is_empty() {
            format!("HTTP {}", status)
        } else {
            m
        }
    };
    let kind = match status {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        400 => ErrorKind::InvalidRequest,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    };
    let mut err = ClassifiedError::new(kind, message)
        .with_provider(provider)
        .with_status(status);
    if kind == ErrorKind::RateLimit {
        if let Some(ms) = retry_after_ms(headers) {
            err.retry_after_ms = Some(ms);
        }
    }
    err
}

fn is_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        current = e.source();
    }
    false
}

/// Map a transport-level failure (no usable HTTP response).
pub fn classify_transport(err: &reqwest::Error, provider: &str) -> ClassifiedError {
    let message = redact(&err.to_string()).into_owned();
    let kind = if err.is_timeout() {
        ErrorKind::NetworkTimeout
    } else if err.is_connect() || is_reset(err) {
        ErrorKind::NetworkConnect
    } else if err.is_decode() {
        ErrorKind::Decode
    } else if err.is_body() || err.is_request() {
        // body read aborted mid-flight, typically a dropped connection
        ErrorKind::NetworkConnect
    } else {
        ErrorKind::Unknown
    };
    let mut classified = ClassifiedError::new(kind, message).with_provider(provider);
    if let Some(status) = err.status() {
        classified.status_code = Some(status.as_u16());
    }
    classified
}

/// Map a JSON payload that could not be decoded.
pub fn classify_decode(err: &serde_json::Error, provider: &str) -> ClassifiedError {
    ClassifiedError::new(ErrorKind::Decode, format!("invalid response payload: {}", err))
        .with_provider(provider)
}

const CRASH_MARKERS: &[&str] = &[
    "segmentation fault",
    "segfault",
    "core dumped",
    "out of memory",
    "cuda error",
    "metal error",
    "illegal instruction",
    "bus error",
    "abort",
    "panicked",
    "killed",
    "std::bad_alloc",
    "ggml_assert",
];

const BAD_ARG_MARKERS: &[&str] = &[
    "invalid argument",
    "unknown argument",
    "unrecognized option",
    "unknown option",
    "unexpected argument",
    "invalid value",
    "usage:",
    "failed to load model",
    "no such file",
];

/// Map a subprocess exit. `code` is `None` when the child died from a signal.
pub fn classify_exit(code: Option<i32>, stderr: &str, provider: &str) -> ClassifiedError {
    let lower = stderr.to_ascii_lowercase();
    let tail = truncate(
        redact(stderr.trim()).into_owned(),
        MAX_MESSAGE_LEN,
    );
    let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    let message = if tail.is_empty() {
        format!("inference process exited with {}", status)
    } else {
        format!("inference process exited with {}: {}", status, tail)
    };

    let kind = if BAD_ARG_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::InvalidRequest
    } else if code.is_none() || CRASH_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Server
    } else {
        ErrorKind::Unknown
    };
    ClassifiedError::new(kind, message)
        .with_provider(provider)
        // subprocess failures carry no retry hint
        .with_retry_after_ms(None)
}
