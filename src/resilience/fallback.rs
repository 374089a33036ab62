use crate::error_kind::{ClassifiedError, ProviderFailure};
use crate::resilience::{HealthState, HealthTracker, ProviderHealth, RetryOutcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Order in which a chain's providers are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Configured order, regardless of health.
    #[default]
    FirstAvailable,
    /// Configured order, skipping `unhealthy` providers that are not due a probe.
    FirstHealthy,
    /// Healthiest first, configured order as tiebreak.
    BestEffort,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstAvailable => "first-available",
            Self::FirstHealthy => "first-healthy",
            Self::BestEffort => "best-effort",
        }
    }
}

struct Entry<P: ?Sized> {
    provider: Arc<P>,
    health: HealthTracker,
}

/// A provider selected for an attempt.
pub struct Candidate<P: ?Sized> {
    pub name: String,
    pub provider: Arc<P>,
    index: usize,
}

/// Candidates in attempt order, plus providers skipped for health.
pub struct Plan<P: ?Sized> {
    pub candidates: Vec<Candidate<P>>,
    pub skipped: Vec<ProviderFailure>,
}

/// Successful chain run.
#[derive(Debug)]
pub struct Handled<T> {
    pub value: T,
    pub provider: String,
    /// Attempts across every provider tried.
    pub attempts: u32,
}

/// Ordered providers with per-provider health.
pub struct FallbackChain<P: ?Sized> {
    entries: Vec<Entry<P>>,
}

impl<P: ?Sized> FallbackChain<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, provider: Arc<P>, check_interval: Duration) {
        self.entries.push(Entry {
            provider,
            health: HealthTracker::new(name, check_interval),
        });
    }

    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        provider: Arc<P>,
        check_interval: Duration,
    ) -> Self {
        self.push(name, provider, check_interval);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.health.name())
    }

    pub fn health(&self, name: &str) -> Option<ProviderHealth> {
        self.entries
            .iter()
            .find(|e| e.health.name() == name)
            .map(|e| e.health.snapshot())
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.entries.iter().map(|e| e.health.snapshot()).collect()
    }

    /// Attempt order under `strategy`.
    pub fn plan(&self, strategy: FallbackStrategy) -> Plan<P> {
        let candidate = |index: usize| {
            let e = &self.entries[index];
            Candidate {
                name: e.health.name().to_string(),
                provider: e.provider.clone(),
                index,
            }
        };
        let mut plan = Plan {
            candidates: Vec::with_capacity(self.entries.len()),
            skipped: Vec::new(),
        };
        match strategy {
            FallbackStrategy::FirstAvailable => {
                plan.candidates = (0..self.entries.len()).map(candidate).collect();
            }
            FallbackStrategy::FirstHealthy => {
                for (i, e) in self.entries.iter().enumerate() {
                    if e.health.state() != HealthState::Unhealthy || e.health.try_probe() {
                        plan.candidates.push(candidate(i));
                    } else {
                        plan.skipped.push(ProviderFailure::Skipped {
                            provider: e.health.name().to_string(),
                            reason: HealthState::Unhealthy.to_string(),
                        });
                    }
                }
            }
            FallbackStrategy::BestEffort => {
                let mut order: Vec<(HealthState, usize)> = self
                    .entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.health.state(), i))
                    .collect();
                order.sort_by_key(|(state, _)| *state);
                plan.candidates = order.into_iter().map(|(_, i)| candidate(i)).collect();
            }
        }
        plan
    }

    /// Count a failed attempt against a provider. Interruptions and
    /// request-shaped errors say nothing about the provider and are ignored.
    pub fn record_failure(&self, name: &str, err: &ClassifiedError) {
        if !err.kind.is_fallbackable() {
            return;
        }
        if let Some(e) = self.entries.iter().find(|e| e.health.name() == name) {
            e.health.record_failure(err);
        }
    }

    pub fn record_success(&self, name: &str) {
        if let Some(e) = self.entries.iter().find(|e| e.health.name() == name) {
            e.health.record_success();
        }
    }

    /// Try candidates in plan order until one succeeds.
    ///
    /// `call` runs one provider through its retry envelope. Errors that
    /// cannot be helped by another provider surface as-is. When only one
    /// provider was tried, its error surfaces unchanged; otherwise the
    /// per-provider errors are collected into `all-providers-failed`.
    pub async fn run<T, F, Fut>(
        &self,
        strategy: FallbackStrategy,
        trace_id: &str,
        mut call: F,
    ) -> Result<Handled<T>, ClassifiedError>
    where
        F: FnMut(Arc<P>, String) -> Fut,
        Fut: Future<Output = RetryOutcome<T>>,
    {
        let plan = self.plan(strategy);
        let mut failures = plan.skipped;
        if plan.candidates.is_empty() {
            tracing::warn!(
                trace_id = %trace_id,
                event = "no_candidates",
                strategy = strategy.as_str(),
                skipped = failures.len(),
                "no provider eligible"
            );
            return Err(ClassifiedError::all_providers_failed(failures));
        }

        let total = plan.candidates.len();
        let mut attempts = 0u32;
        let mut tried = 0usize;
        for (pos, cand) in plan.candidates.into_iter().enumerate() {
            tried += 1;
            let outcome = call(cand.provider.clone(), cand.name.clone()).await;
            attempts += outcome.attempts;
            let entry = &self.entries[cand.index];
            for f in &outcome.failures {
                if f.kind.is_fallbackable() {
                    entry.health.record_failure(f);
                }
            }
            match outcome.result {
                Ok(value) => {
                    entry.health.record_success();
                    if pos > 0 {
                        tracing::info!(
                            trace_id = %trace_id,
                            event = "fallback_success",
                            provider = %cand.name,
                            position = pos,
                            "fallback provider succeeded"
                        );
                    }
                    return Ok(Handled {
                        value,
                        provider: cand.name,
                        attempts,
                    });
                }
                Err(err) if !err.kind.is_fallbackable() => return Err(err),
                Err(err) => {
                    if pos + 1 < total {
                        tracing::warn!(
                            trace_id = %trace_id,
                            event = "fallback_handoff",
                            from = %cand.name,
                            error_kind = %err.kind,
                            health = %entry.health.state(),
                            "handing off to next provider"
                        );
                    }
                    failures.push(ProviderFailure::Failed(err));
                }
            }
        }

        if tried == 1 && failures.len() == 1 {
            if let Some(ProviderFailure::Failed(err)) = failures.pop() {
                return Err(err);
            }
        }
        Err(ClassifiedError::all_providers_failed(failures))
    }
}

impl<P: ?Sized> Default for FallbackChain<P> {
    fn default() -> Self {
        Self::new()
    }
}
