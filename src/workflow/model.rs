//! Serde model of workflow definitions.
//!
//! ```yaml
//! id: summarize-items
//! inputs: [items]
//! steps:
//!   - name: each
//!     type: loop
//!     over: items
//!     output_var: results
//!     steps:
//!       - name: describe
//!         type: prompt
//!         prompt: "describe {{ item }}"
//!         output_var: line
//!   - name: check
//!     type: conditional
//!     expression: "{{ results | length > 2 }}"
//!     then:
//!       - name: summary
//!         type: prompt
//!         prompt: "summarize {{ results | json }}"
//!         output_var: summary
//! ```

use crate::params::Params;
use crate::resilience::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Variables the caller must supply.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Model for prompt steps that do not name one; `auto` when unset.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Bound on the whole run.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Templates local to this workflow; shadow the shared template store.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Every step, nested ones included, in declaration order.
    pub fn all_steps(&self) -> Vec<&Step> {
        fn walk<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for s in steps {
                out.push(s);
                match &s.kind {
                    StepKind::Loop { steps, .. } => walk(steps, out),
                    StepKind::Conditional { then, otherwise, .. } => {
                        walk(then, out);
                        walk(otherwise, out);
                    }
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Steps of the same block that must finish first. When omitted the step
    /// follows the one declared before it; `[]` makes it a root.
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    /// Expression; the step is skipped when it is false.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retry: Option<StepRetry>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub output_var: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            depends_on: None,
            condition: None,
            on_error: OnError::Fail,
            retry: None,
            timeout_ms: None,
            output_var: None,
            kind,
        }
    }

    pub fn prompt(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Prompt {
                prompt: prompt.into(),
                model: None,
                system: None,
                params: Params::new(),
            },
        )
    }

    pub fn output(mut self, var: impl Into<String>) -> Self {
        self.output_var = Some(var.into());
        self
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// What a step does, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Routed model call with a templated prompt.
    Prompt {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        system: Option<String>,
        #[serde(default)]
        params: Params,
    },
    /// Render a saved template.
    Template {
        template: String,
        /// Extra bindings; string values are themselves rendered first.
        #[serde(default)]
        vars: serde_json::Map<String, serde_json::Value>,
    },
    Conditional {
        expression: String,
        #[serde(default)]
        then: Vec<Step>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Step>,
    },
    /// Run `steps` once per element of the array `over` evaluates to.
    Loop {
        over: String,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: usize,
        steps: Vec<Step>,
    },
    /// Pull a value out of a prior output by regex or JSON path.
    Extract {
        from: String,
        #[serde(default)]
        regex: Option<String>,
        /// Capture group; 1 when the pattern has groups, else the whole match.
        #[serde(default)]
        group: Option<usize>,
        #[serde(default)]
        json_path: Option<String>,
    },
    Sleep {
        duration_ms: u64,
    },
    UserConfirmation {
        message: String,
    },
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

fn default_max_iterations() -> usize {
    100
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Template { .. } => "template",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
            Self::Extract { .. } => "extract",
            Self::Sleep { .. } => "sleep",
            Self::UserConfirmation { .. } => "user_confirmation",
        }
    }
}

/// Per-step failure policy: `fail`, `continue`, or the name of a fallback step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Fallback(String),
}

impl From<String> for OnError {
    fn from(s: String) -> Self {
        match s.as_str() {
            "fail" => Self::Fail,
            "continue" => Self::Continue,
            _ => Self::Fallback(s),
        }
    }
}

impl From<OnError> for String {
    fn from(p: OnError) -> Self {
        p.to_string()
    }
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Continue => f.write_str("continue"),
            Self::Fallback(s) => f.write_str(s),
        }
    }
}

/// Step retry settings, same semantics as the provider retry envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRetry {
    #[serde(default = "default_step_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_step_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for StepRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_step_attempts(),
            backoff: Backoff::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl StepRetry {
    pub fn to_policy(&self, timeout_ms: Option<u64>) -> RetryPolicy {
        let mut policy = RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff);
        policy.base_delay_ms = self.initial_delay_ms;
        policy.max_delay_ms = self.max_delay_ms;
        if let Some(ms) = timeout_ms {
            policy.max_attempt_timeout_ms = ms;
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_steps() {
        let yaml = r#"
id: wf
inputs: [items]
steps:
  - name: each
    type: loop
    over: items
    output_var: results
    steps:
      - name: ask
        type: prompt
        prompt: "n={{ item }}"
        output_var: line
  - name: check
    type: conditional
    depends_on: [each]
    expression: "{{ results | length > 2 }}"
    on_error: continue
    then:
      - name: summary
        type: prompt
        prompt: "sum"
    else: []
  - name: pick
    type: extract
    from: results
    regex: "n=(\\d+)"
    on_error: rescue
  - name: rescue
    type: sleep
    duration_ms: 5
"#;
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.steps.len(), 4);
        match &wf.steps[0].kind {
            StepKind::Loop {
                item_var,
                max_iterations,
                steps,
                ..
            } => {
                assert_eq!(item_var, "item");
                assert_eq!(*max_iterations, 100);
                assert_eq!(steps[0].kind_name(), "prompt");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(wf.steps[1].on_error, OnError::Continue);
        assert_eq!(wf.steps[2].on_error, OnError::Fallback("rescue".into()));
        assert_eq!(wf.steps[0].depends_on, None);
        assert_eq!(wf.all_steps().len(), 6);
    }

    #[test]
    fn test_step_retry_policy() {
        let r = StepRetry {
            max_attempts: 4,
            initial_delay_ms: 10,
            ..StepRetry::default()
        };
        let p = r.to_policy(Some(2_000));
        assert_eq!(p.max_attempts, 4);
        assert_eq!(p.base_delay_ms, 10);
        assert_eq!(p.max_attempt_timeout_ms, 2_000);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = "id: x\nsteps:\n  - name: a\n    type: teleport\n";
        assert!(serde_yaml::from_str::<Workflow>(yaml).is_err());
    }
}
