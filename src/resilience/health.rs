use crate::error_kind::ClassifiedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Failure count at which a provider becomes `degraded`.
pub const DEGRADED_AT: u32 = 2;
/// Failure count at which a provider becomes `unhealthy`.
pub const UNHEALTHY_AT: u32 = 5;

/// Health bucket, ordered best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub state: HealthState,
    pub error_count: u32,
    pub success_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct State {
    state: HealthState,
    error_count: u32,
    success_count: u64,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_failure_at: Option<Instant>,
    last_probe_at: Option<Instant>,
}

/// Health record for one provider, updated under its own lock.
///
/// - success: `success_count += 1`, `error_count -= 1` (floored at 0),
///   back to `healthy` once `error_count` reaches 0
/// - failure: `error_count += 1`; `degraded` at 2, `unhealthy` at 5
/// - an `unhealthy` provider may be probed once `check_interval` has
///   elapsed since its last failure (or its last probe)
#[derive(Debug)]
pub struct HealthTracker {
    name: String,
    check_interval: Duration,
    state: std::sync::Mutex<State>,
}

impl HealthTracker {
    pub fn new(name: impl Into<String>, check_interval: Duration) -> Self {
        Self {
            name: name.into(),
            check_interval,
            state: std::sync::Mutex::new(State {
                state: HealthState::Healthy,
                error_count: 0,
                success_count: 0,
                last_check: None,
                last_error: None,
                last_failure_at: None,
                last_probe_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a poisoned health record is still a valid record
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        st.success_count = st.success_count.saturating_add(1);
        st.error_count = st.error_count.saturating_sub(1);
        if st.error_count == 0 {
            st.state = HealthState::Healthy;
        }
        st.last_check = Some(Utc::now());
    }

    pub fn record_failure(&self, err: &ClassifiedError) {
        let mut st = self.lock();
        st.error_count = st.error_count.saturating_add(1);
        if st.error_count >= UNHEALTHY_AT {
            st.state = HealthState::Unhealthy;
        } else if st.error_count >= DEGRADED_AT {
            st.state = HealthState::Degraded;
        }
        st.last_check = Some(Utc::now());
        st.last_error = Some(format!("{}: {}", err.kind, err.message));
        st.last_failure_at = Some(Instant::now());
    }

    /// Claim the half-open probe if one is due. Only one caller per interval wins.
    pub fn try_probe(&self) -> bool {
        let mut st = self.lock();
        if st.state != HealthState::Unhealthy {
            return true;
        }
        let since = match (st.last_failure_at, st.last_probe_at) {
            (Some(f), Some(p)) => Some(f.max(p)),
            (a, b) => a.or(b),
        };
        let due = since.map_or(true, |t| t.elapsed() >= self.check_interval);
        if due {
            st.last_probe_at = Some(Instant::now());
        }
        due
    }

    pub fn snapshot(&self) -> ProviderHealth {
        let st = self.lock();
        ProviderHealth {
            name: self.name.clone(),
            state: st.state,
            error_count: st.error_count,
            success_count: st.success_count,
            last_check: st.last_check,
            last_error: st.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_kind::ErrorKind;

    fn fail(t: &HealthTracker) {
        t.record_failure(&ClassifiedError::new(ErrorKind::Server, "boom"));
    }

    #[test]
    fn test_transitions() {
        let t = HealthTracker::new("p1", Duration::from_secs(30));
        assert_eq!(t.state(), HealthState::Healthy);
        fail(&t);
        assert_eq!(t.state(), HealthState::Healthy);
        fail(&t);
        assert_eq!(t.state(), HealthState::Degraded);
        for _ in 0..3 {
            fail(&t);
        }
        assert_eq!(t.state(), HealthState::Unhealthy);
        assert_eq!(t.snapshot().error_count, 5);

        for _ in 0..4 {
            t.record_success();
        }
        // one error left, state unchanged until the count drains
        assert_eq!(t.state(), HealthState::Unhealthy);
        t.record_success();
        let snap = t.snapshot();
        assert_eq!(snap.state, HealthState::Healthy);
        assert_eq!(snap.success_count, 5);
        assert_eq!(snap.last_error.as_deref(), Some("server: boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_interval() {
        let t = HealthTracker::new("p1", Duration::from_secs(30));
        for _ in 0..5 {
            fail(&t);
        }
        assert!(!t.try_probe());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(t.try_probe());
        // the probe is claimed; the next one waits another interval
        assert!(!t.try_probe());
    }

    #[test]
    fn test_ordering() {
        assert!(HealthState::Healthy < HealthState::Degraded);
        assert!(HealthState::Degraded < HealthState::Unhealthy);
    }
}
