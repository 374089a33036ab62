//! Failure taxonomy shared by every routing layer.
//!
//! Raw backend failures (HTTP statuses, transport errors, subprocess exits,
//! malformed payloads) are classified once, at the provider boundary, into an
//! [`ErrorKind`] carried by a [`ClassifiedError`]. Everything above the
//! provider (retry envelope, fallback chain, router, journal) only looks at
//! the classified form.
//!
//! ## Kinds
//!
//! | Kind                     | Retryable | Default retry-after | Audience |
//! |--------------------------|-----------|---------------------|----------|
//! | `auth`                   | no        | -                   | user     |
//! | `rate-limit`             | yes       | 60s                 | operator |
//! | `not-found`              | no        | -                   | user     |
//! | `invalid-request`        | no        | -                   | user     |
//! | `server`                 | yes       | 60s                 | operator |
//! | `network-timeout`        | yes       | 10s                 | operator |
//! | `network-connect`        | yes       | 10s                 | operator |
//! | `decode`                 | no        | -                   | operator |
//! | `unsupported-capability` | no        | -                   | user     |
//! | `data-integrity`         | no        | -                   | operator |
//! | `cancelled`              | no        | -                   | caller   |
//! | `deadline-exceeded`      | no        | -                   | caller   |
//! | `all-providers-failed`   | no        | -                   | operator |
//! | `unknown`                | no        | -                   | operator |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    NotFound,
    InvalidRequest,
    Server,
    NetworkTimeout,
    NetworkConnect,
    Decode,
    UnsupportedCapability,
    DataIntegrity,
    Cancelled,
    DeadlineExceeded,
    AllProvidersFailed,
    Unknown,
}

impl ErrorKind {
    /// Stable wire name, also written to `metadata.error_kind` in the session journal.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate-limit",
            Self::NotFound => "not-found",
            Self::InvalidRequest => "invalid-request",
            Self::Server => "server",
            Self::NetworkTimeout => "network-timeout",
            Self::NetworkConnect => "network-connect",
            Self::Decode => "decode",
            Self::UnsupportedCapability => "unsupported-capability",
            Self::DataIntegrity => "data-integrity",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::AllProvidersFailed => "all-providers-failed",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "auth" => Self::Auth,
            "rate-limit" => Self::RateLimit,
            "not-found" => Self::NotFound,
            "invalid-request" => Self::InvalidRequest,
            "server" => Self::Server,
            "network-timeout" => Self::NetworkTimeout,
            "network-connect" => Self::NetworkConnect,
            "decode" => Self::Decode,
            "unsupported-capability" => Self::UnsupportedCapability,
            "data-integrity" => Self::DataIntegrity,
            "cancelled" => Self::Cancelled,
            "deadline-exceeded" => Self::DeadlineExceeded,
            "all-providers-failed" => Self::AllProvidersFailed,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether a failure of this kind is retried by default.
    #[inline]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Server | Self::NetworkTimeout | Self::NetworkConnect
        )
    }

    /// Retry hint applied when the backend did not supply one.
    #[inline]
    pub fn default_retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit | Self::Server => Some(60_000),
            Self::NetworkTimeout | Self::NetworkConnect => Some(10_000),
            _ => None,
        }
    }

    /// Whether another provider in the chain may succeed where this one failed.
    ///
    /// Request-shaped failures (`invalid-request`, `unsupported-capability`)
    /// fail identically everywhere, and cancellation/deadline must surface
    /// unchanged, so none of those hand off.
    #[inline]
    pub fn is_fallbackable(&self) -> bool {
        matches!(
            self,
            Self::Auth
                | Self::RateLimit
                | Self::NotFound
                | Self::Server
                | Self::NetworkTimeout
                | Self::NetworkConnect
                | Self::Decode
                | Self::Unknown
        )
    }

    /// Errors the caller can act on (fix the request, the model id, or credentials).
    #[inline]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest | Self::NotFound | Self::UnsupportedCapability | Self::Auth
        )
    }

    /// Errors that indicate the caller stopped the request rather than a backend failure.
    #[inline]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One provider's contribution to an `all-providers-failed` error.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    /// The provider was invoked and failed with this error.
    Failed(ClassifiedError),
    /// The provider was not invoked because of its health bucket.
    Skipped { provider: String, reason: String },
}

impl ProviderFailure {
    pub fn provider(&self) -> &str {
        match self {
            Self::Failed(err) => err.provider_name.as_deref().unwrap_or("unknown"),
            Self::Skipped { provider, .. } => provider,
        }
    }
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub provider_name: Option<String>,
    pub status_code: Option<u16>,
    /// Per-provider errors, populated only for `all-providers-failed`.
    pub failures: Vec<ProviderFailure>,
}

impl ClassifiedError {
    /// New error with the kind's default retry semantics.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            retry_after_ms: kind.default_retry_after_ms(),
            provider_name: None,
            status_code: None,
            failures: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "request deadline exceeded")
    }

    pub fn all_providers_failed(failures: Vec<ProviderFailure>) -> Self {
        let summary = failures
            .iter()
            .map(|f| match f {
                ProviderFailure::Failed(e) => format!("{}: {}", f.provider(), e.kind),
                ProviderFailure::Skipped { reason, .. } => format!("{}: {}", f.provider(), reason),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut err = Self::new(
            ErrorKind::AllProvidersFailed,
            format!("all providers failed [{}]", summary),
        );
        err.failures = failures;
        err
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_name = Some(provider.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after_ms(mut self, ms: Option<u64>) -> Self {
        self.retry_after_ms = ms;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = self.status_code {
            write!(f, " (HTTP {})", status)?;
        }
        if let Some(ref provider) = self.provider_name {
            write!(f, " [provider: {}]", provider)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip_for_every_kind() {
        let kinds = [
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
        for kind in kinds {
            assert_eq!(ErrorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("teapot"), None);
    }

    #[test]
    fn test_defaults_follow_table() {
        let rl = ClassifiedError::new(ErrorKind::RateLimit, "slow down");
        assert!(rl.retryable);
        assert_eq!(rl.retry_after_ms, Some(60_000));

        let auth = ClassifiedError::new(ErrorKind::Auth, "bad key");
        assert!(!auth.retryable);
        assert_eq!(auth.retry_after_ms, None);
        assert!(auth.kind.is_user_facing());
        assert!(auth.kind.is_fallbackable());

        assert!(!ErrorKind::InvalidRequest.is_fallbackable());
        assert!(!ErrorKind::Cancelled.is_fallbackable());
    }

    #[test]
    fn test_all_providers_failed_keeps_each_failure() {
        let err = ClassifiedError::all_providers_failed(vec![
            ProviderFailure::Failed(
                ClassifiedError::new(ErrorKind::Server, "boom").with_provider("p1"),
            ),
            ProviderFailure::Skipped {
                provider: "p2".into(),
                reason: "unhealthy".into(),
            },
        ]);
        assert_eq!(err.kind, ErrorKind::AllProvidersFailed);
        assert_eq!(err.failures.len(), 2);
        assert!(err.message.contains("p1: server"));
        assert!(err.message.contains("p2: unhealthy"));
    }
}
