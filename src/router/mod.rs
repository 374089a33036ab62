//! Request routing.
//!
//! For each [`Request`] the router:
//!
//! 1. resolves the model (`"auto"` goes through [`UseCaseDetector`]),
//! 2. checks the backend's capabilities against what the request needs,
//! 3. normalizes parameters through the backend's schema,
//! 4. runs the backend's [`FallbackChain`], each provider wrapped in a
//!    [`RetryEnvelope`],
//! 5. journals the exchange (or the failure marker) into the session store.
//!
//! Streaming routes may retry and fall back only until the first delta
//! reaches the caller; after that a failure ends the stream.

pub mod journal;
pub mod request;
pub mod stream;
pub mod usecase;

pub use request::{Request, RouteOutput, AUTO_MODEL};
pub use stream::{RouteStream, StreamOutcome, StreamSummary};
pub use usecase::UseCaseDetector;

use crate::config::{AppConfig, HardwareProfile, RouterSettings};
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::params::{ParameterSchemas, Params};
use crate::pipeline::{TextStream, UsageCell};
use crate::providers::{build_provider, CallContext, Completion, Provider};
use crate::registry::{Capability, CapabilityRegistry, ModelDescriptor, ModelRegistry};
use crate::resilience::{FallbackChain, FallbackStrategy, ProviderHealth, RetryEnvelope};
use crate::session::SessionStore;
use crate::telemetry::new_trace_id;
use crate::types::{BackendKind, Message, MessageRole, Usage};
use crate::workflow::{PromptCall, PromptRunner, WorkflowEngine, WorkflowLoader};
use crate::{Error, ErrorContext, PipeResult, Result};
use async_trait::async_trait;
use futures::StreamExt;
use journal::{Journal, Turn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const STREAM_BUFFER: usize = 32;

/// Outcome of [`Router::route`].
#[derive(Debug)]
pub enum RouteResponse {
    Complete(RouteOutput),
    Stream(RouteStream),
}

impl RouteResponse {
    pub fn into_output(self) -> Option<RouteOutput> {
        match self {
            Self::Complete(o) => Some(o),
            Self::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<RouteStream> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Complete(_) => None,
        }
    }
}

type Chain = FallbackChain<dyn Provider>;

struct Inner {
    registry: ModelRegistry,
    capabilities: CapabilityRegistry,
    schemas: ParameterSchemas,
    chains: HashMap<BackendKind, Arc<Chain>>,
    store: Option<SessionStore>,
    settings: RouterSettings,
    detector: UseCaseDetector,
}

/// Entry point for routed calls. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("models", &self.inner.registry.len())
            .field("chains", &self.inner.chains.keys().collect::<Vec<_>>())
            .field("journaling", &self.inner.store.is_some())
            .finish()
    }
}

/// Everything resolved before a provider is called.
struct Prepared {
    descriptor: Arc<ModelDescriptor>,
    params: Params,
    chain: Arc<Chain>,
    strategy: FallbackStrategy,
    deadline: Instant,
}

pub struct RouterBuilder {
    models: Vec<ModelDescriptor>,
    providers: Vec<Arc<dyn Provider>>,
    capabilities: CapabilityRegistry,
    schemas: ParameterSchemas,
    settings: RouterSettings,
    store: Option<SessionStore>,
    profile: Option<HardwareProfile>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            models: Vec::new(),
            providers: Vec::new(),
            capabilities: CapabilityRegistry::builtin(),
            schemas: ParameterSchemas::default(),
            settings: RouterSettings::default(),
            store: None,
            profile: None,
        }
    }

    pub fn with_model(mut self, descriptor: ModelDescriptor) -> Self {
        self.models.push(descriptor);
        self
    }

    pub fn with_models(mut self, descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        self.models.extend(descriptors);
        self
    }

    /// Add a provider to the chain of its backend kind, after any already added.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_schemas(mut self, schemas: ParameterSchemas) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate model locations against this profile when building.
    pub fn with_profile(mut self, profile: HardwareProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn build(self) -> Result<Router> {
        let mut registry = ModelRegistry::from_descriptors(self.models)?;
        if let Some(profile) = &self.profile {
            let report = registry.validate_all(profile);
            tracing::info!(
                event = "registry_validated",
                usable = report.usable().count(),
                unusable = report.unusable().count(),
                "model registry validated"
            );
        }

        let interval = Duration::from_millis(self.settings.health_check_interval_ms);
        let mut chains: HashMap<BackendKind, Chain> = HashMap::new();
        for provider in self.providers {
            provider.validate_config()?;
            let chain = chains.entry(provider.backend_kind()).or_default();
            if chain.names().any(|n| n == provider.name()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider name '{}'", provider.name()),
                    ErrorContext::new().with_source("router_builder"),
                ));
            }
            chain.push(provider.name().to_string(), provider, interval);
        }

        let detector = match &self.settings.use_case_keywords {
            Some(table) => UseCaseDetector::from_keywords(table),
            None => UseCaseDetector::default(),
        };

        Ok(Router {
            inner: Arc::new(Inner {
                registry,
                capabilities: self.capabilities,
                schemas: self.schemas,
                chains: chains.into_iter().map(|(k, c)| (k, Arc::new(c))).collect(),
                store: self.store,
                settings: self.settings,
                detector,
            }),
        })
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Build providers, open the session store and validate the registry.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let mut builder = RouterBuilder::new()
            .with_models(config.models)
            .with_profile(config.profile.clone());
        for p in &config.providers {
            builder = builder.with_provider(build_provider(p, &config.profile)?);
        }
        let store = SessionStore::open(config.settings.store.clone()).await?;
        builder.with_store(store).with_settings(config.settings).build()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.inner.store.as_ref()
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.inner.settings
    }

    /// Workflow engine running its prompts through this router, loading
    /// definitions from `workflows_dir` when one is configured.
    pub async fn workflow_engine(&self) -> Result<WorkflowEngine> {
        let engine = WorkflowEngine::new(Arc::new(self.clone()));
        match &self.inner.settings.workflows_dir {
            Some(dir) => Ok(engine.with_loader(Arc::new(WorkflowLoader::open(dir).await?))),
            None => Ok(engine),
        }
    }

    /// Health of every provider, grouped by backend in a stable order.
    pub fn health(&self) -> Vec<ProviderHealth> {
        BackendKind::ALL
            .iter()
            .filter_map(|k| self.inner.chains.get(k))
            .flat_map(|c| c.health_snapshot())
            .collect()
    }

    pub fn provider_health(&self, name: &str) -> Option<ProviderHealth> {
        self.inner.chains.values().find_map(|c| c.health(name))
    }

    /// Model id `auto` resolves through use-case detection; any other id is used as given.
    pub fn resolve_model_id(&self, request: &Request) -> Result<String> {
        if request.model_id != AUTO_MODEL {
            return Ok(request.model_id.clone());
        }
        let text = request.last_user_text().unwrap_or_default();
        let category = self.inner.detector.detect(text);
        let model = self
            .inner
            .detector
            .recommend(category, &self.inner.settings.recommendations)
            .ok_or_else(|| {
                Error::not_found(format!("no model recommended for use case '{}'", category))
            })?;
        tracing::info!(
            trace_id = request.trace_id.as_deref().unwrap_or(""),
            event = "use_case_detected",
            category = category,
            model_id = model,
            "model picked by use case"
        );
        Ok(model.to_string())
    }

    /// Route a request; `request.stream` picks the response shape.
    pub async fn route(&self, mut request: Request) -> Result<RouteResponse> {
        let trace_id = request.trace_id.get_or_insert_with(new_trace_id).clone();
        let prepared = self.prepare(&request, &trace_id)?;
        tracing::info!(
            trace_id = %trace_id,
            event = "route_start",
            model_id = %prepared.descriptor.id,
            backend = %prepared.descriptor.backend_kind,
            strategy = prepared.strategy.as_str(),
            stream = request.stream,
            "routing request"
        );
        let journal = match (&self.inner.store, request.journal) {
            (Some(store), true) => {
                Some(Journal::open(store, request.session_id.as_deref(), &trace_id).await?)
            }
            _ => None,
        };
        if request.stream {
            Ok(RouteResponse::Stream(self.spawn_stream(request, prepared, journal, trace_id)))
        } else {
            self.complete_prepared(request, prepared, journal, trace_id)
                .await
                .map(RouteResponse::Complete)
        }
    }

    /// Non-streaming shorthand.
    pub async fn complete(&self, request: Request) -> Result<RouteOutput> {
        match self.route(request.streaming(false)).await? {
            RouteResponse::Complete(out) => Ok(out),
            RouteResponse::Stream(_) => Err(Error::classified(ErrorKind::Unknown, "unexpected stream")),
        }
    }

    /// Streaming shorthand.
    pub async fn stream(&self, request: Request) -> Result<RouteStream> {
        match self.route(request.streaming(true)).await? {
            RouteResponse::Stream(s) => Ok(s),
            RouteResponse::Complete(_) => Err(Error::classified(ErrorKind::Unknown, "unexpected completion")),
        }
    }

    fn prepare(&self, request: &Request, trace_id: &str) -> Result<Prepared> {
        if request.messages.is_empty() {
            return Err(Error::invalid_request("request has no messages"));
        }
        let model_id = self.resolve_model_id(request)?;
        let descriptor = self.inner.registry.select(&model_id)?;
        let backend = descriptor.backend_kind;

        let required = required_capabilities(request);
        let missing = self.inner.capabilities.missing(backend, &required);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(Capability::as_str).collect();
            tracing::warn!(
                trace_id = %trace_id,
                event = "unsupported_capability",
                model_id = %descriptor.id,
                missing = %names.join(","),
                "backend lacks required capabilities"
            );
            return Err(Error::Classified(ClassifiedError::new(
                ErrorKind::UnsupportedCapability,
                format!("backend {} lacks: {}", backend, names.join(", ")),
            )));
        }

        let params = self
            .inner
            .schemas
            .validate_with_defaults(backend, &descriptor.default_params, &request.params)?;

        let chain = self
            .inner
            .chains
            .get(&backend)
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("no provider configured for backend {}", backend),
                    ErrorContext::new()
                        .with_source("router")
                        .with_hint("add a provider with this backend_kind"),
                )
            })?;

        let timeout_ms = request
            .timeout_total_ms
            .unwrap_or(self.inner.settings.default_timeout_total_ms);
        Ok(Prepared {
            descriptor,
            params,
            chain,
            strategy: request
                .fallback_strategy
                .unwrap_or(self.inner.settings.default_fallback_strategy),
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        })
    }

    async fn complete_prepared(
        &self,
        request: Request,
        prepared: Prepared,
        journal: Option<Journal>,
        trace_id: String,
    ) -> Result<RouteOutput> {
        let started = std::time::Instant::now();
        let attempts = AtomicU32::new(0);
        let policy = &self.inner.settings.retry;
        let descriptor = &*prepared.descriptor;
        let messages = &request.messages[..];
        let params = &prepared.params;
        let cancel = &request.cancel;
        let trace = trace_id.as_str();
        let deadline = prepared.deadline;
        let counter = &attempts;

        let result = prepared
            .chain
            .run(prepared.strategy, trace, |provider, name| async move {
                let envelope = RetryEnvelope::new(policy.clone(), deadline, cancel.clone())
                    .with_trace(trace, name);
                envelope
                    .run(|attempt| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let provider = provider.clone();
                        let ctx = CallContext::new(trace)
                            .with_cancel(cancel.clone())
                            .with_attempt_timeout(attempt.timeout)
                            .with_attempt(attempt.number);
                        async move { provider.execute(descriptor, messages, params, &ctx).await }
                    })
                    .await
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(handled) => {
                let Completion { text, usage } = handled.value;
                tracing::info!(
                    trace_id = %trace_id,
                    event = "route_complete",
                    provider = %handled.provider,
                    attempts,
                    duration_ms,
                    "request completed"
                );
                let turn = Turn {
                    text: text.clone(),
                    tokens: usage.total(),
                    duration_ms,
                    provider: Some(handled.provider.clone()),
                    attempts,
                    ..Turn::default()
                };
                let session_id = write_journal(journal.as_ref(), descriptor, messages, turn, &trace_id).await;
                Ok(RouteOutput {
                    text,
                    usage,
                    trace_id,
                    model_id: descriptor.id.clone(),
                    provider: handled.provider,
                    attempts,
                    session_id,
                })
            }
            Err(err) => {
                log_failure(&trace_id, &err, attempts);
                let turn = Turn {
                    duration_ms,
                    provider: err.provider_name.clone(),
                    attempts,
                    error_kind: (err.kind != ErrorKind::Cancelled).then_some(err.kind),
                    cancelled: err.kind == ErrorKind::Cancelled,
                    ..Turn::default()
                };
                write_journal(journal.as_ref(), descriptor, messages, turn, &trace_id).await;
                Err(Error::Classified(err))
            }
        }
    }

    fn spawn_stream(
        &self,
        request: Request,
        prepared: Prepared,
        journal: Option<Journal>,
        trace_id: String,
    ) -> RouteStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = request.cancel.child_token();
        let router = self.clone();
        let driver_cancel = cancel.clone();
        let driver_trace = trace_id.clone();
        let driver = tokio::spawn(async move {
            router
                .drive_stream(request.messages, prepared, journal, driver_trace, driver_cancel, tx)
                .await
        });
        RouteStream::new(rx, cancel, driver, trace_id)
    }

    async fn drive_stream(
        self,
        messages: Vec<Message>,
        prepared: Prepared,
        journal: Option<Journal>,
        trace_id: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<PipeResult<String>>,
    ) -> StreamSummary {
        let started = std::time::Instant::now();
        let attempts = AtomicU32::new(0);
        let policy = &self.inner.settings.retry;
        let descriptor = &*prepared.descriptor;
        let msgs = &messages[..];
        let params = &prepared.params;
        let trace = trace_id.as_str();
        let deadline = prepared.deadline;
        let counter = &attempts;
        let call_cancel = &cancel;

        // Retry and fallback only cover opening the stream and its first delta.
        let opened = tokio::select! {
            r = prepared.chain.run(prepared.strategy, trace, |provider, name| async move {
                let envelope = RetryEnvelope::new(policy.clone(), deadline, call_cancel.clone())
                    .with_trace(trace, name);
                envelope
                    .run(|attempt| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let provider = provider.clone();
                        let ctx = CallContext::new(trace)
                            .with_cancel(call_cancel.clone())
                            .with_attempt_timeout(attempt.timeout)
                            .with_attempt(attempt.number);
                        async move { open_stream(provider, descriptor, msgs, params, &ctx).await }
                    })
                    .await
            }) => r,
            _ = tx.closed() => {
                cancel.cancel();
                Err(ClassifiedError::cancelled())
            }
        };

        let mut text = String::new();
        let mut usage = Usage::default();
        let (provider, outcome) = match opened {
            Ok(handled) => {
                let (first, rest, reported) = handled.value;
                let outcome =
                    forward(first, rest, &tx, &cancel, deadline, &handled.provider, &mut text).await;
                usage = reported.get().unwrap_or_default();
                if let StreamOutcome::Failed(err) = &outcome {
                    prepared.chain.record_failure(&handled.provider, err);
                }
                (Some(handled.provider), outcome)
            }
            Err(err) => {
                let outcome = if err.kind == ErrorKind::Cancelled {
                    StreamOutcome::Cancelled
                } else {
                    StreamOutcome::Failed(err.clone())
                };
                let provider = err.provider_name.clone();
                let _ = tx.try_send(Err(Error::Classified(err)));
                (provider, outcome)
            }
        };
        if outcome == StreamOutcome::Cancelled {
            cancel.cancel();
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst);

        match &outcome {
            StreamOutcome::Completed => tracing::info!(
                trace_id = %trace_id,
                event = "route_complete",
                provider = provider.as_deref().unwrap_or(""),
                attempts,
                duration_ms,
                chars = text.len(),
                "stream completed"
            ),
            StreamOutcome::Cancelled => tracing::info!(
                trace_id = %trace_id,
                event = "stream_cancelled",
                provider = provider.as_deref().unwrap_or(""),
                chars = text.len(),
                "stream cancelled"
            ),
            StreamOutcome::Failed(err) => log_failure(&trace_id, err, attempts),
        }

        let turn = Turn {
            text: text.clone(),
            tokens: usage.total(),
            duration_ms,
            provider: provider.clone(),
            attempts,
            error_kind: match &outcome {
                StreamOutcome::Failed(e) => Some(e.kind),
                _ => None,
            },
            cancelled: outcome == StreamOutcome::Cancelled,
        };
        let session_id = write_journal(journal.as_ref(), descriptor, msgs, turn, &trace_id).await;

        StreamSummary {
            trace_id,
            model_id: descriptor.id.clone(),
            provider,
            text,
            usage,
            attempts,
            duration_ms,
            session_id,
            outcome,
        }
    }
}

/// Open a provider stream and wait for its first delta.
///
/// The returned cell fills with whatever usage the backend reports in-band.
async fn open_stream(
    provider: Arc<dyn Provider>,
    descriptor: &ModelDescriptor,
    messages: &[Message],
    params: &Params,
    ctx: &CallContext,
) -> Result<(Option<String>, TextStream, UsageCell)> {
    let mut stream = provider.stream_execute(descriptor, messages, params, ctx).await?;
    let usage = ctx.usage.clone();
    match stream.next().await {
        Some(Ok(first)) => Ok((Some(first), stream, usage)),
        Some(Err(e)) => Err(e),
        None => Ok((None, stream, usage)),
    }
}

/// Pump deltas to the caller until the provider ends, fails, or the caller goes away.
async fn forward(
    first: Option<String>,
    mut rest: TextStream,
    tx: &mpsc::Sender<PipeResult<String>>,
    cancel: &CancellationToken,
    deadline: Instant,
    provider: &str,
    text: &mut String,
) -> StreamOutcome {
    if let Some(delta) = first {
        text.push_str(&delta);
        if !emit(tx, cancel, Ok(delta)).await {
            return StreamOutcome::Cancelled;
        }
    }
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            _ = tx.closed() => return StreamOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                let err = ClassifiedError::deadline_exceeded().with_provider(provider);
                let _ = tx.try_send(Err(Error::Classified(err.clone())));
                return StreamOutcome::Failed(err);
            }
            item = rest.next() => item,
        };
        match item {
            None => return StreamOutcome::Completed,
            Some(Ok(delta)) => {
                text.push_str(&delta);
                if !emit(tx, cancel, Ok(delta)).await {
                    return StreamOutcome::Cancelled;
                }
            }
            Some(Err(e)) => {
                let err = e.into_classified();
                if err.kind == ErrorKind::Cancelled {
                    return StreamOutcome::Cancelled;
                }
                let _ = tx.try_send(Err(Error::Classified(err.clone())));
                return StreamOutcome::Failed(err);
            }
        }
    }
}

async fn emit(
    tx: &mpsc::Sender<PipeResult<String>>,
    cancel: &CancellationToken,
    item: PipeResult<String>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

fn required_capabilities(request: &Request) -> Vec<Capability> {
    let mut caps = Vec::new();
    if request.stream {
        caps.push(Capability::Streaming);
    }
    if request.messages.iter().any(Message::has_images) {
        caps.push(Capability::Vision);
    }
    if request.messages.iter().any(|m| m.role == MessageRole::System) {
        caps.push(Capability::SystemPrompt);
    }
    if request.params.get("response_format").and_then(|v| v.as_str()) == Some("json") {
        caps.push(Capability::JsonMode);
    }
    caps
}

fn log_failure(trace_id: &str, err: &ClassifiedError, attempts: u32) {
    let audience = if err.kind.is_user_facing() {
        "user"
    } else if err.kind.is_interruption() {
        "caller"
    } else {
        "operator"
    };
    tracing::warn!(
        trace_id = %trace_id,
        event = "route_failed",
        error_kind = %err.kind,
        audience,
        provider = err.provider_name.as_deref().unwrap_or(""),
        attempts,
        error = %err.message,
        "request failed"
    );
}

/// Journal failures never replace the route result; they are logged.
async fn write_journal(
    journal: Option<&Journal>,
    descriptor: &ModelDescriptor,
    messages: &[Message],
    turn: Turn,
    trace_id: &str,
) -> Option<String> {
    let journal = journal?;
    match journal.record(descriptor, messages, turn).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(
                trace_id = %trace_id,
                event = "journal_failed",
                error_kind = %e.kind(),
                error = %e,
                "could not journal exchange"
            );
            None
        }
    }
}

#[async_trait]
impl PromptRunner for Router {
    async fn run_prompt(&self, call: PromptCall) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = call.system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(call.prompt));
        let mut request = Request::new(call.model_id, messages)
            .with_params(call.params)
            .with_trace_id(call.trace_id)
            .with_cancel(call.cancel);
        if let Some(ms) = call.timeout_ms {
            request = request.with_timeout_ms(ms);
        }
        request = match call.session_id {
            Some(id) => request.in_session(id),
            None => request.without_journal(),
        };
        Ok(self.complete(request).await?.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Script, ScriptedProvider};
    use crate::resilience::HealthState;

    fn router_with(providers: Vec<ScriptedProvider>) -> (Router, Vec<Arc<ScriptedProvider>>) {
        let arcs: Vec<Arc<ScriptedProvider>> = providers.into_iter().map(Arc::new).collect();
        let mut settings = RouterSettings::default();
        settings.retry = settings.retry.with_base_delay(Duration::from_millis(1));
        let mut b = Router::builder()
            .with_model(ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x"))
            .with_settings(settings);
        for p in &arcs {
            b = b.with_provider(p.clone());
        }
        (b.build().unwrap(), arcs)
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let (router, _) = router_with(vec![ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)]);
        let err = router.complete(Request::prompt("nope", "hi")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_param_rejected_before_dispatch() {
        let (router, ps) = router_with(vec![ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
            .always(Script::reply("x"))]);
        let err = router
            .complete(Request::prompt("m-chat-a", "hi").with_param("bogus", 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(ps[0].calls(), 0);
    }

    #[tokio::test]
    async fn test_params_normalized_before_provider() {
        let (router, ps) = router_with(vec![ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
            .always(Script::reply("x"))]);
        router
            .complete(Request::prompt("m-chat-a", "hi").with_param("max_tokens", 16))
            .await
            .unwrap();
        let call = &ps[0].recorded()[0];
        assert_eq!(call.params["max_tokens"], 16);
        assert_eq!(call.params["temperature"], 0.7);
    }

    #[tokio::test]
    async fn test_vision_needed_on_local_inference_is_unsupported() {
        let router = Router::builder()
            .with_model(ModelDescriptor::new("local", BackendKind::LocalInference, "m.gguf"))
            .with_provider(Arc::new(
                ScriptedProvider::new("cli", BackendKind::LocalInference).always(Script::reply("x")),
            ))
            .build()
            .unwrap();
        let req = Request::new("local", vec![Message::user("look").with_image("a.png")]);
        let err = router.complete(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
        assert!(!err.as_classified().unwrap().retryable);
    }

    #[tokio::test]
    async fn test_server_error_falls_back_and_degrades_health() {
        let (router, ps) = router_with(vec![
            ScriptedProvider::new("p1", BackendKind::RemoteChatHttp).always(Script::Fail(
                ClassifiedError::new(ErrorKind::Server, "boom").with_retry_after_ms(None),
            )),
            ScriptedProvider::new("p2", BackendKind::RemoteChatHttp).always(Script::reply("ok")),
        ]);
        let out = router.complete(Request::prompt("m-chat-a", "hi")).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(out.provider, "p2");
        assert_eq!(ps[0].calls(), 3);
        assert_eq!(router.provider_health("p1").unwrap().state, HealthState::Degraded);
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test]
    async fn test_server_error_with_default_hint_falls_back_within_deadline() {
        let (router, ps) = router_with(vec![
            ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
                .always(Script::fail(ErrorKind::Server, "boom")),
            ScriptedProvider::new("p2", BackendKind::RemoteChatHttp).always(Script::reply("ok")),
        ]);
        // the 60s server retry hint does not fit in 30s, so p1 gets one attempt
        let out = router
            .complete(Request::prompt("m-chat-a", "hi").with_timeout_ms(30_000))
            .await
            .unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(out.provider, "p2");
        assert_eq!(ps[0].calls(), 1);
        assert_eq!(ps[1].calls(), 1);
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn test_auto_model_uses_recommendation() {
        let mut settings = RouterSettings::default();
        settings.recommendations.insert("general".into(), "m-chat-a".into());
        let p = Arc::new(ScriptedProvider::new("p1", BackendKind::RemoteChatHttp).always(Script::reply("x")));
        let router = Router::builder()
            .with_model(ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x"))
            .with_provider(p.clone())
            .with_settings(settings)
            .build()
            .unwrap();
        let out = router.complete(Request::prompt(AUTO_MODEL, "write a poem")).await.unwrap();
        assert_eq!(out.model_id, "m-chat-a");
        assert_eq!(p.recorded()[0].model_id, "m-chat-a");
    }

    #[tokio::test]
    async fn test_explicit_model_never_overridden() {
        let mut settings = RouterSettings::default();
        settings.recommendations.insert("coding".into(), "m-code".into());
        let router = Router::builder()
            .with_model(ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x"))
            .with_model(ModelDescriptor::new("m-code", BackendKind::RemoteChatHttp, "coder"))
            .with_provider(Arc::new(
                ScriptedProvider::new("p1", BackendKind::RemoteChatHttp).always(Script::reply("x")),
            ))
            .with_settings(settings)
            .build()
            .unwrap();
        let out = router
            .complete(Request::prompt("m-chat-a", "debug this rust function"))
            .await
            .unwrap();
        assert_eq!(out.model_id, "m-chat-a");
    }
}
