//! Resilience around provider calls.
//!
//! | Component        | Description                                              |
//! |------------------|----------------------------------------------------------|
//! | [`retry`]        | Bounded retries with backoff, deadline and cancellation  |
//! | [`health`]       | Per-provider health buckets with a half-open probe       |
//! | [`fallback`]     | Ordered provider chains tried per [`FallbackStrategy`]   |
//!
//! ```rust
//! use llm_router::resilience::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(3)
//!     .with_base_delay(Duration::from_millis(200));
//! assert_eq!(policy.backoff_delay(2, None), Duration::from_millis(400));
//! // a backend hint always wins
//! assert_eq!(policy.backoff_delay(1, Some(5_000)), Duration::from_secs(5));
//! ```

pub mod fallback;
pub mod health;
pub mod retry;

pub use fallback::{Candidate, FallbackChain, FallbackStrategy, Handled, Plan};
pub use health::{HealthState, HealthTracker, ProviderHealth};
pub use retry::{Attempt, Backoff, RetryEnvelope, RetryOutcome, RetryPolicy};
