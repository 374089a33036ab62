//! Declarative multi-step workflows over the router.
//!
//! | Component        | Description                                                |
//! |------------------|------------------------------------------------------------|
//! | [`model`]        | `Workflow` / `Step` definitions (YAML or JSON)             |
//! | [`expr`]         | Sandboxed condition language with filters                  |
//! | [`template`]     | `{{ expr }}` interpolation and the shared template store   |
//! | [`validate`]     | Static checks: names, dependencies, cycles, variable flow  |
//! | [`loader`]       | Directory-backed loader with an LRU cache                  |
//! | [`engine`]       | Topological execution with per-step retry and error policy |
//! | [`approval`]     | Gates for `user_confirmation` steps                        |

pub mod approval;
pub mod engine;
pub mod expr;
pub mod loader;
pub mod model;
pub mod template;
pub mod validate;

pub use approval::{ApprovalGate, ApprovalRequest, AutoApprove, ChannelApprovalGate, PendingApproval};
pub use engine::{RunStatus, StepRecord, StepStatus, WorkflowEngine, WorkflowRun};
pub use expr::Expr;
pub use loader::WorkflowLoader;
pub use model::{OnError, Step, StepKind, StepRetry, Workflow};
pub use template::{Template, TemplateStore};
pub use validate::{problems, validate, Problem};

use crate::params::Params;
use crate::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Variables visible to a running workflow.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// One model call made by a `prompt` step.
#[derive(Debug, Clone)]
pub struct PromptCall {
    pub model_id: String,
    pub prompt: String,
    pub system: Option<String>,
    pub params: Params,
    pub timeout_ms: Option<u64>,
    pub cancel: CancellationToken,
    pub trace_id: String,
    /// Journal into this session; unjournaled when `None`.
    pub session_id: Option<String>,
}

/// Executes `prompt` steps. Implemented by [`crate::router::Router`].
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_prompt(&self, call: PromptCall) -> Result<String>;
}
