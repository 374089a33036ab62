use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

/// Bounded retry configuration for a single provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the computed backoff. Backend `retry_after` hints are not capped.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempt_timeout_ms")]
    pub max_attempt_timeout_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempt_timeout_ms() -> u64 {
    120_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempt_timeout_ms: default_max_attempt_timeout_ms(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.max_attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before attempt `attempt + 1`, given the failed attempt number (1-based).
    ///
    /// `max(retry_after, base * 2^(attempt-1))`, where only the computed part
    /// is capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let computed = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(32);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        }
        .min(self.max_delay_ms);
        Duration::from_millis(computed.max(retry_after_ms.unwrap_or(0)))
    }

    fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.max_attempt_timeout_ms)
    }
}

/// What the envelope hands to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// `min(remaining deadline, max_attempt_timeout)`.
    pub timeout: Duration,
}

/// Result of running an operation through the envelope.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, ClassifiedError>,
    pub attempts: u32,
    /// Every failed attempt in order, including the final one on failure.
    pub failures: Vec<ClassifiedError>,
}

/// Bounded retries with backoff, a shared deadline and cooperative cancellation.
///
/// Attempts for one envelope run strictly one after another. A cancel
/// observed during an attempt or a backoff sleep ends the run with
/// `cancelled`; running out of time ends it with `deadline-exceeded`.
#[derive(Debug, Clone)]
pub struct RetryEnvelope {
    policy: RetryPolicy,
    deadline: Instant,
    cancel: CancellationToken,
    trace_id: String,
    label: String,
}

impl RetryEnvelope {
    pub fn new(policy: RetryPolicy, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            policy,
            deadline,
            cancel,
            trace_id: String::new(),
            label: String::new(),
        }
    }

    /// Attach the request trace id and the name of the thing being retried.
    pub fn with_trace(mut self, trace_id: impl Into<String>, label: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self.label = label.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut failures = Vec::new();
        let mut number = 0u32;

        loop {
            number += 1;
            if self.cancel.is_cancelled() {
                return self.finish(number - 1, failures, ClassifiedError::cancelled());
            }
            let now = Instant::now();
            if now >= self.deadline {
                return self.finish(number - 1, failures, ClassifiedError::deadline_exceeded());
            }
            let remaining = self.deadline - now;
            let per_attempt = self.policy.attempt_timeout();
            let deadline_bound = remaining <= per_attempt;
            let attempt = Attempt {
                number,
                timeout: remaining.min(per_attempt),
            };

            tracing::info!(
                trace_id = %self.trace_id,
                event = "provider_attempt",
                provider = %self.label,
                attempt = number,
                timeout_ms = attempt.timeout.as_millis() as u64,
                "attempt started"
            );

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ClassifiedError::cancelled()),
                r = tokio::time::timeout(attempt.timeout, op(attempt)) => match r {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.into_classified()),
                    Err(_) if deadline_bound => Err(ClassifiedError::deadline_exceeded()),
                    Err(_) => Err(ClassifiedError::new(
                        ErrorKind::NetworkTimeout,
                        format!("attempt timed out after {} ms", attempt.timeout.as_millis()),
                    )
                    .with_provider(self.label.clone())),
                },
            };

            let err = match outcome {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: number,
                        failures,
                    }
                }
                Err(e) => e,
            };

            if err.kind.is_interruption() {
                return self.finish(number, failures, err);
            }

            tracing::warn!(
                trace_id = %self.trace_id,
                event = "attempt_failed",
                provider = %self.label,
                attempt = number,
                error_kind = %err.kind,
                retryable = err.retryable,
                error = %err.message,
                "attempt failed"
            );

            if !err.retryable || number >= max_attempts {
                failures.push(err.clone());
                return RetryOutcome {
                    result: Err(err),
                    attempts: number,
                    failures,
                };
            }

            let delay = self.policy.backoff_delay(number, err.retry_after_ms);
            if Instant::now() + delay > self.deadline {
                // no room for another attempt; the backend's error stands
                tracing::info!(
                    trace_id = %self.trace_id,
                    event = "retry_skipped",
                    provider = %self.label,
                    attempt = number,
                    delay_ms = delay.as_millis() as u64,
                    "backoff would pass the deadline"
                );
                failures.push(err.clone());
                return self.finish(number, failures, err);
            }
            failures.push(err);

            tracing::info!(
                trace_id = %self.trace_id,
                event = "retry_scheduled",
                provider = %self.label,
                attempt = number,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.finish(number, failures, ClassifiedError::cancelled());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish<T>(
        &self,
        attempts: u32,
        failures: Vec<ClassifiedError>,
        err: ClassifiedError,
    ) -> RetryOutcome<T> {
        let err = if err.provider_name.is_none() && !self.label.is_empty() {
            err.with_provider(self.label.clone())
        } else {
            err
        };
        RetryOutcome {
            result: Err(err),
            attempts,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn envelope(policy: RetryPolicy) -> (RetryEnvelope, CancellationToken) {
        let cancel = CancellationToken::new();
        let env = RetryEnvelope::new(
            policy,
            Instant::now() + Duration::from_secs(600),
            cancel.clone(),
        )
        .with_trace("t-1", "p1");
        (env, cancel)
    }

    #[test]
    fn test_backoff_delay() {
        let p = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(1, None), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2, None), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3, None), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(10, None), Duration::from_millis(1000));
        // retry-after wins over the computed delay, even above the cap
        assert_eq!(p.backoff_delay(1, Some(5000)), Duration::from_millis(5000));
        assert_eq!(p.backoff_delay(3, Some(0)), Duration::from_millis(400));

        let fixed = p.clone().with_backoff(Backoff::Fixed);
        assert_eq!(fixed.backoff_delay(5, None), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_runs_once() {
        let (env, _) = envelope(RetryPolicy::new().with_max_attempts(5));
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = env
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::classified(ErrorKind::Auth, "bad key")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.result.unwrap_err().kind, ErrorKind::Auth);
        assert_eq!(out.failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored() {
        let (env, _) = envelope(
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(10)),
        );
        let starts = Arc::new(Mutex::new(Vec::new()));
        let out: RetryOutcome<&str> = env
            .run(|a| {
                starts.lock().unwrap().push(Instant::now());
                async move {
                    if a.number == 1 {
                        Err(Error::Classified(
                            ClassifiedError::new(ErrorKind::RateLimit, "slow down")
                                .with_retry_after_ms(Some(2_000)),
                        ))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(out.result.unwrap(), "ok");
        assert_eq!(out.attempts, 2);
        let starts = starts.lock().unwrap();
        assert!(starts[1] - starts[0] >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let (env, _) = envelope(
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1)),
        );
        let out: RetryOutcome<()> = env
            .run(|_| async {
                Err(Error::Classified(
                    ClassifiedError::new(ErrorKind::Server, "boom").with_retry_after_ms(None),
                ))
            })
            .await;
        assert_eq!(out.attempts, 3);
        assert_eq!(out.failures.len(), 3);
        assert_eq!(out.result.unwrap_err().kind, ErrorKind::Server);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_returns_immediately() {
        let (env, cancel) = envelope(RetryPolicy::new().with_max_attempts(3));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let out: RetryOutcome<()> = env
            .run(|_| async {
                Err(Error::Classified(
                    ClassifiedError::new(ErrorKind::RateLimit, "later")
                        .with_retry_after_ms(Some(30_000)),
                ))
            })
            .await;
        let err = out.result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(!err.retryable);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_attempt() {
        let cancel = CancellationToken::new();
        let env = RetryEnvelope::new(
            RetryPolicy::new(),
            Instant::now() + Duration::from_millis(100),
            cancel,
        );
        let out: RetryOutcome<()> = env
            .run(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(out.result.unwrap_err().kind, ErrorKind::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_past_deadline_surfaces_backend_error() {
        let cancel = CancellationToken::new();
        let env = RetryEnvelope::new(
            RetryPolicy::new().with_max_attempts(3),
            Instant::now() + Duration::from_secs(1),
            cancel,
        )
        .with_trace("t-1", "p1");
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = env
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                // default 60s retry-after for server errors
                async { Err(Error::classified(ErrorKind::Server, "down")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.failures.len(), 1);
        let err = out.result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Server);
        assert!(err.kind.is_fallbackable());
        assert_eq!(err.provider_name.as_deref(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let (env, _) = envelope(
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_attempt_timeout(Duration::from_millis(50))
                .with_base_delay(Duration::from_millis(1)),
        );
        let out: RetryOutcome<u8> = env
            .run(|a| async move {
                if a.number == 1 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(7)
            })
            .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.failures[0].kind, ErrorKind::NetworkTimeout);
    }
}
