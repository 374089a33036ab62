//! Workflow execution.
//!
//! Blocks run their steps one at a time in topological order. Each step runs
//! inside a [`RetryEnvelope`] built from its `retry` and `timeout_ms`, so step
//! retries, timeouts and cancellation behave exactly like provider calls.
//! Loop iterations and conditional branches run in a copy of the variables;
//! a branch's new bindings are copied back, loop bodies only contribute the
//! collected results.

use super::approval::{ApprovalGate, ApprovalRequest};
use super::expr::{display, Expr};
use super::loader::WorkflowLoader;
use super::model::{OnError, Step, StepKind, Workflow};
use super::template::{Template, TemplateStore};
use super::validate::{plan_block, validate, BlockPlan};
use super::{PromptCall, PromptRunner, Variables};
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::router::AUTO_MODEL;
use crate::telemetry::new_trace_id;
use crate::utils::PathMapper;
use crate::{Error, ErrorContext, Result};
use async_recursion::async_recursion;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Run budget when the workflow sets no `timeout_ms`.
const UNBOUNDED_RUN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Outcome of one executed (or skipped) step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// `name`, or `loop[i]/name` inside loop bodies and `cond/name` inside branches.
    pub path: String,
    pub kind: &'static str,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Set on a failed step whose fallback ran.
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub execution_id: String,
    pub workflow_id: String,
    pub trace_id: String,
    pub status: RunStatus,
    pub variables: Variables,
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn output(&self, var: &str) -> Option<&Value> {
        self.variables.get(var)
    }

    /// Last record for the step at `path`.
    pub fn record(&self, path: &str) -> Option<&StepRecord> {
        self.steps.iter().rev().find(|r| r.path == path)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// What a successful step contributes.
struct StepEffect {
    output: Value,
    /// Bindings made by a conditional branch.
    bindings: Variables,
}

impl StepEffect {
    fn value(output: Value) -> Self {
        Self {
            output,
            bindings: Variables::new(),
        }
    }
}

struct RunCtx {
    execution_id: String,
    workflow_id: String,
    trace_id: String,
    default_model: String,
    templates: BTreeMap<String, String>,
    cancel: CancellationToken,
    deadline: Instant,
    records: Mutex<Vec<StepRecord>>,
}

impl RunCtx {
    fn push(&self, record: StepRecord) {
        if let Ok(mut r) = self.records.lock() {
            r.push(record);
        }
    }
}

fn step_error(step: &Step, msg: impl Into<String>) -> Error {
    Error::workflow_with_context(msg, ErrorContext::new().with_field_path(step.name.clone()))
}

fn scoped(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", scope, name)
    }
}

/// Runs workflows, calling a [`PromptRunner`] for `prompt` steps.
pub struct WorkflowEngine {
    runner: Arc<dyn PromptRunner>,
    loader: Option<Arc<WorkflowLoader>>,
    templates: TemplateStore,
    approvals: Option<Arc<dyn ApprovalGate>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("loader", &self.loader)
            .field("templates", &self.templates.len())
            .field("approvals", &self.approvals.is_some())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(runner: Arc<dyn PromptRunner>) -> Self {
        Self {
            runner,
            loader: None,
            templates: TemplateStore::new(),
            approvals: None,
        }
    }

    /// Resolve workflow ids through `loader`; its templates become the shared store.
    pub fn with_loader(mut self, loader: Arc<WorkflowLoader>) -> Self {
        self.templates = loader.templates().clone();
        self.loader = Some(loader);
        self
    }

    pub fn with_templates(mut self, templates: TemplateStore) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = Some(gate);
        self
    }

    pub async fn load(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        match &self.loader {
            Some(l) => l.load(workflow_id).await,
            None => Err(Error::configuration_with_context(
                "no workflow directory configured",
                ErrorContext::new()
                    .with_source("workflow_engine")
                    .with_hint("set workflows_dir in router settings"),
            )),
        }
    }

    pub fn validate(&self, workflow: &Workflow) -> Result<()> {
        validate(workflow, &self.templates)
    }

    /// Load a workflow by id and run it.
    pub async fn execute(&self, workflow_id: &str, variables: Variables) -> Result<WorkflowRun> {
        let workflow = self.load(workflow_id).await?;
        self.execute_workflow(&workflow, variables, CancellationToken::new())
            .await
    }

    /// Validate and run `workflow`.
    ///
    /// Definition and input problems are returned as `Err`; a step failure
    /// yields a run with status `failed` and the error recorded.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        variables: Variables,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        self.validate(workflow)?;
        let missing: Vec<&str> = workflow
            .inputs
            .iter()
            .filter(|i| !variables.contains_key(i.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::invalid_request(format!(
                "workflow '{}' is missing inputs: {}",
                workflow.id,
                missing.join(", ")
            )));
        }

        let started = std::time::Instant::now();
        let budget = workflow
            .timeout_ms
            .map_or(UNBOUNDED_RUN, Duration::from_millis);
        let ctx = RunCtx {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            trace_id: new_trace_id(),
            default_model: workflow
                .default_model
                .clone()
                .unwrap_or_else(|| AUTO_MODEL.to_string()),
            templates: workflow.templates.clone(),
            cancel,
            deadline: Instant::now() + budget,
            records: Mutex::new(Vec::new()),
        };
        tracing::info!(
            trace_id = %ctx.trace_id,
            event = "workflow_start",
            workflow_id = %ctx.workflow_id,
            execution_id = %ctx.execution_id,
            steps = workflow.steps.len(),
            "workflow started"
        );

        let mut vars = variables;
        let outcome = self.run_block(&ctx, &workflow.steps, "", &mut vars).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, error_kind, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None, None),
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                (RunStatus::Cancelled, Some(ErrorKind::Cancelled), Some(e.to_string()))
            }
            Err(e) => (RunStatus::Failed, Some(e.kind()), Some(e.to_string())),
        };
        match status {
            RunStatus::Completed => tracing::info!(
                trace_id = %ctx.trace_id,
                event = "workflow_complete",
                workflow_id = %ctx.workflow_id,
                execution_id = %ctx.execution_id,
                duration_ms,
                "workflow completed"
            ),
            _ => tracing::warn!(
                trace_id = %ctx.trace_id,
                event = "workflow_failed",
                workflow_id = %ctx.workflow_id,
                execution_id = %ctx.execution_id,
                error_kind = error_kind.map(|k| k.name()).unwrap_or(""),
                error = error.as_deref().unwrap_or(""),
                "workflow did not complete"
            ),
        }

        let steps = ctx.records.into_inner().unwrap_or_default();
        Ok(WorkflowRun {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            trace_id: ctx.trace_id,
            status,
            variables: vars,
            steps,
            duration_ms,
            error_kind,
            error,
        })
    }

    #[async_recursion]
    async fn run_block(
        &self,
        ctx: &RunCtx,
        steps: &[Step],
        scope: &str,
        vars: &mut Variables,
    ) -> Result<()> {
        let plan = plan_block(steps).map_err(|ps| {
            let summary: Vec<String> = ps.iter().map(ToString::to_string).collect();
            Error::validation_with_context(summary.join("; "), ErrorContext::new().with_source("workflow"))
        })?;

        for &i in &plan.order {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Classified(ClassifiedError::cancelled()));
            }
            let step = &steps[i];
            let path = scoped(scope, &step.name);

            if let Some(cond) = &step.condition {
                let run = Expr::parse(cond).and_then(|e| e.eval_bool(vars));
                match run {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!(
                            trace_id = %ctx.trace_id,
                            event = "step_skipped",
                            step = %path,
                            "condition false"
                        );
                        ctx.push(StepRecord {
                            path,
                            kind: step.kind_name(),
                            status: StepStatus::Skipped,
                            attempts: 0,
                            duration_ms: 0,
                            output: None,
                            error: None,
                            fallback: None,
                        });
                        continue;
                    }
                    Err(e) => {
                        self.handle_failure(ctx, steps, step, &path, vars, e, 0, 0).await?;
                        continue;
                    }
                }
            }

            let started = std::time::Instant::now();
            let (result, attempts) = self.attempt(ctx, step, &path, vars).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(effect) => {
                    tracing::info!(
                        trace_id = %ctx.trace_id,
                        event = "step_complete",
                        step = %path,
                        kind = step.kind_name(),
                        attempts,
                        duration_ms,
                        "step completed"
                    );
                    vars.extend(effect.bindings);
                    if let Some(var) = &step.output_var {
                        vars.insert(var.clone(), effect.output.clone());
                    }
                    ctx.push(StepRecord {
                        path,
                        kind: step.kind_name(),
                        status: StepStatus::Succeeded,
                        attempts,
                        duration_ms,
                        output: Some(effect.output),
                        error: None,
                        fallback: None,
                    });
                }
                Err(e) => {
                    self.handle_failure(ctx, steps, step, &path, vars, e, attempts, duration_ms)
                        .await?
                }
            }
        }
        Ok(())
    }

    /// Apply the step's `on_error` policy. `Err` stops the enclosing block.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        ctx: &RunCtx,
        steps: &[Step],
        step: &Step,
        path: &str,
        vars: &mut Variables,
        err: Error,
        attempts: u32,
        duration_ms: u64,
    ) -> Result<()> {
        tracing::warn!(
            trace_id = %ctx.trace_id,
            event = "step_failed",
            step = %path,
            error_kind = %err.kind(),
            on_error = %step.on_error,
            error = %err,
            "step failed"
        );
        let fallback = match &step.on_error {
            OnError::Fallback(name) => Some(name.clone()),
            _ => None,
        };
        ctx.push(StepRecord {
            path: path.to_string(),
            kind: step.kind_name(),
            status: StepStatus::Failed,
            attempts,
            duration_ms,
            output: None,
            error: Some(err.to_string()),
            fallback: fallback.clone(),
        });

        if err.kind().is_interruption() {
            return Err(err);
        }
        match &step.on_error {
            OnError::Fail => Err(err),
            OnError::Continue => {
                if let Some(var) = &step.output_var {
                    vars.insert(var.clone(), Value::Null);
                }
                Ok(())
            }
            OnError::Fallback(name) => {
                let target = BlockPlan::index_of(steps, name)
                    .map(|i| &steps[i])
                    .ok_or_else(|| step_error(step, format!("fallback step '{}' not found", name)))?;
                let scope = path.rsplit_once('/').map_or("", |(s, _)| s);
                let fb_path = scoped(scope, &target.name);
                let started = std::time::Instant::now();
                let (result, fb_attempts) = self.attempt(ctx, target, &fb_path, vars).await;
                let fb_duration = started.elapsed().as_millis() as u64;
                match result {
                    Ok(effect) => {
                        vars.extend(effect.bindings);
                        for var in [&target.output_var, &step.output_var].into_iter().flatten() {
                            vars.insert(var.clone(), effect.output.clone());
                        }
                        ctx.push(StepRecord {
                            path: fb_path,
                            kind: target.kind_name(),
                            status: StepStatus::Succeeded,
                            attempts: fb_attempts,
                            duration_ms: fb_duration,
                            output: Some(effect.output),
                            error: None,
                            fallback: None,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        ctx.push(StepRecord {
                            path: fb_path,
                            kind: target.kind_name(),
                            status: StepStatus::Failed,
                            attempts: fb_attempts,
                            duration_ms: fb_duration,
                            output: None,
                            error: Some(e.to_string()),
                            fallback: None,
                        });
                        Err(e)
                    }
                }
            }
        }
    }

    /// Run one step through its retry envelope.
    async fn attempt(
        &self,
        ctx: &RunCtx,
        step: &Step,
        path: &str,
        vars: &Variables,
    ) -> (Result<StepEffect>, u32) {
        let policy = step
            .retry
            .clone()
            .unwrap_or_default()
            .to_policy(Some(step.timeout_ms.unwrap_or(u64::MAX)));
        let envelope = crate::resilience::RetryEnvelope::new(policy, ctx.deadline, ctx.cancel.clone())
            .with_trace(ctx.trace_id.clone(), path.to_string());
        let outcome = envelope
            .run(|_attempt| self.exec(ctx, step, path, vars))
            .await;
        (outcome.result.map_err(Error::Classified), outcome.attempts)
    }

    async fn exec(
        &self,
        ctx: &RunCtx,
        step: &Step,
        path: &str,
        vars: &Variables,
    ) -> Result<StepEffect> {
        match &step.kind {
            StepKind::Prompt {
                prompt,
                model,
                system,
                params,
            } => {
                let call = PromptCall {
                    model_id: model.clone().unwrap_or_else(|| ctx.default_model.clone()),
                    prompt: Template::parse(prompt)?.render(vars)?,
                    system: match system {
                        Some(s) => Some(Template::parse(s)?.render(vars)?),
                        None => None,
                    },
                    params: params.clone(),
                    timeout_ms: step.timeout_ms,
                    cancel: ctx.cancel.child_token(),
                    trace_id: ctx.trace_id.clone(),
                    session_id: None,
                };
                let text = self.runner.run_prompt(call).await?;
                Ok(StepEffect::value(Value::String(text)))
            }
            StepKind::Template { template, vars: extra } => {
                let body = ctx
                    .templates
                    .get(template)
                    .map(String::as_str)
                    .or_else(|| self.templates.get(template))
                    .ok_or_else(|| step_error(step, format!("unknown template '{}'", template)))?;
                let mut scope = vars.clone();
                for (k, v) in extra {
                    let value = match v.as_str() {
                        Some(s) => Value::String(Template::parse(s)?.render(vars)?),
                        None => v.clone(),
                    };
                    scope.insert(k.clone(), value);
                }
                let text = Template::parse(body)?.render(&scope)?;
                Ok(StepEffect::value(Value::String(text)))
            }
            StepKind::Conditional {
                expression,
                then,
                otherwise,
            } => {
                let taken = Expr::parse(expression)?.eval_bool(vars)?;
                let branch = if taken { then } else { otherwise };
                let mut local = vars.clone();
                self.run_block(ctx, branch, path, &mut local).await?;
                let bindings = local
                    .into_iter()
                    .filter(|(k, v)| vars.get(k) != Some(v))
                    .collect();
                Ok(StepEffect {
                    output: Value::Bool(taken),
                    bindings,
                })
            }
            StepKind::Loop {
                over,
                item_var,
                index_var,
                max_iterations,
                steps,
            } => {
                let items = match Expr::parse(over)?.eval(vars)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(step_error(
                            step,
                            format!("loop over '{}' needs an array, got {}", over, other),
                        ))
                    }
                };
                if items.len() > *max_iterations {
                    return Err(step_error(
                        step,
                        format!(
                            "{} items exceed max_iterations {}",
                            items.len(),
                            max_iterations
                        ),
                    ));
                }
                let collect = plan_block(steps)
                    .ok()
                    .and_then(|p| {
                        p.order
                            .iter()
                            .rev()
                            .find_map(|&i| steps[i].output_var.clone())
                    });
                let mut results = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut local = vars.clone();
                    local.insert(item_var.clone(), item);
                    local.insert(index_var.clone(), Value::from(index));
                    let scope = format!("{}[{}]", path, index);
                    self.run_block(ctx, steps, &scope, &mut local).await?;
                    results.push(
                        collect
                            .as_ref()
                            .and_then(|v| local.get(v).cloned())
                            .unwrap_or(Value::Null),
                    );
                }
                Ok(StepEffect::value(Value::Array(results)))
            }
            StepKind::Extract {
                from,
                regex,
                group,
                json_path,
            } => {
                let source = Expr::parse(from)?.eval(vars)?;
                if let Some(pattern) = regex {
                    let re = regex::Regex::new(pattern)
                        .map_err(|e| step_error(step, format!("invalid regex: {}", e)))?;
                    let text = display(&source);
                    let caps = re
                        .captures(&text)
                        .ok_or_else(|| step_error(step, format!("no match for /{}/", pattern)))?;
                    let g = group.unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });
                    let m = caps
                        .get(g)
                        .ok_or_else(|| step_error(step, format!("group {} did not match", g)))?;
                    return Ok(StepEffect::value(Value::String(m.as_str().to_string())));
                }
                let path_expr = json_path.as_deref().unwrap_or("");
                let doc = match source {
                    Value::String(s) => serde_json::from_str(&s)?,
                    other => other,
                };
                PathMapper::get_path(&doc, path_expr)
                    .cloned()
                    .map(StepEffect::value)
                    .ok_or_else(|| step_error(step, format!("json path '{}' not found", path_expr)))
            }
            StepKind::Sleep { duration_ms } => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(Error::Classified(ClassifiedError::cancelled())),
                    _ = tokio::time::sleep(Duration::from_millis(*duration_ms)) => {
                        Ok(StepEffect::value(Value::Null))
                    }
                }
            }
            StepKind::UserConfirmation { message } => {
                let gate = self.approvals.as_ref().ok_or_else(|| {
                    step_error(step, "no approval gate configured for user_confirmation")
                })?;
                let request = ApprovalRequest {
                    execution_id: ctx.execution_id.clone(),
                    workflow_id: ctx.workflow_id.clone(),
                    step: path.to_string(),
                    message: Template::parse(message)?.render(vars)?,
                };
                tracing::info!(
                    trace_id = %ctx.trace_id,
                    event = "confirmation_requested",
                    step = %path,
                    "waiting for approval"
                );
                let approved = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Err(Error::Classified(ClassifiedError::cancelled()))
                    }
                    r = gate.confirm(request) => r?,
                };
                if approved {
                    Ok(StepEffect::value(Value::Bool(true)))
                } else {
                    Err(step_error(step, "confirmation denied"))
                }
            }
        }
    }
}
