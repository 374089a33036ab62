//! Static checks run before a workflow executes.
//!
//! Each block (the top level, a loop body, a conditional branch) is its own
//! DAG: `depends_on` names siblings, a step without `depends_on` follows the
//! sibling declared before it, and steps named as an `on_error` fallback are
//! only run in place of the step that failed.
//!
//! A variable counts as produced for a step when the caller supplies it
//! (`inputs`) or an ancestor in the DAG binds it unconditionally. A step with
//! a `condition` guarantees none of its outputs; a conditional guarantees what
//! both branches produce.

use super::expr::Expr;
use super::model::{OnError, Step, StepKind, Workflow};
use super::template::{Template, TemplateStore};
use crate::utils::PathMapper;
use crate::{Error, ErrorContext, Result};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt;

const RESERVED: [&str; 8] = ["and", "or", "not", "in", "contains", "true", "false", "null"];

/// One static problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub step: Option<String>,
    pub message: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(s) => write!(f, "step '{}': {}", s, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Run order of one block.
#[derive(Debug, Clone)]
pub(crate) struct BlockPlan {
    /// Scheduled steps in topological order; ties keep declaration order.
    pub order: Vec<usize>,
    /// Resolved direct dependencies per step.
    pub deps: Vec<Vec<usize>>,
    /// Steps that only run as an `on_error` fallback.
    pub fallbacks: BTreeSet<usize>,
}

impl BlockPlan {
    pub fn index_of(steps: &[Step], name: &str) -> Option<usize> {
        steps.iter().position(|s| s.name == name)
    }
}

/// Resolve dependencies and order a block. `Err` lists every problem found.
pub(crate) fn plan_block(steps: &[Step]) -> std::result::Result<BlockPlan, Vec<Problem>> {
    let mut problems = Vec::new();
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut fallbacks = BTreeSet::new();
    for s in steps {
        if let OnError::Fallback(target) = &s.on_error {
            match index.get(target.as_str()) {
                Some(&t) if t != index[s.name.as_str()] => {
                    fallbacks.insert(t);
                }
                Some(_) => problems.push(problem(s, "on_error names the step itself")),
                None => problems.push(problem(
                    s,
                    format!("on_error fallback '{}' is not a step of this block", target),
                )),
            }
        }
    }

    let mut deps = vec![Vec::new(); steps.len()];
    let mut previous: Option<usize> = None;
    for (i, s) in steps.iter().enumerate() {
        if fallbacks.contains(&i) {
            if matches!(s.on_error, OnError::Fallback(_)) {
                problems.push(problem(s, "a fallback step cannot have its own fallback"));
            }
            continue;
        }
        match &s.depends_on {
            None => deps[i].extend(previous),
            Some(names) => {
                for name in names {
                    match index.get(name.as_str()) {
                        None => problems.push(problem(
                            s,
                            format!("depends_on '{}', which is not a step of this block", name),
                        )),
                        Some(&d) if d == i => problems.push(problem(s, "depends on itself")),
                        Some(&d) if fallbacks.contains(&d) => problems.push(problem(
                            s,
                            format!("depends on fallback step '{}'", name),
                        )),
                        Some(&d) => deps[i].push(d),
                    }
                }
            }
        }
        previous = Some(i);
    }
    if !problems.is_empty() {
        return Err(problems);
    }

    // Kahn's algorithm over the scheduled steps.
    let mut indegree = vec![0usize; steps.len()];
    let mut dependents = vec![Vec::new(); steps.len()];
    for (i, ds) in deps.iter().enumerate() {
        indegree[i] = ds.len();
        for &d in ds {
            dependents[d].push(i);
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = (0..steps.len())
        .filter(|i| !fallbacks.contains(i) && indegree[*i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &n in &dependents[i] {
            indegree[n] -= 1;
            if indegree[n] == 0 {
                ready.push(Reverse(n));
            }
        }
    }
    let scheduled = steps.len() - fallbacks.len();
    if order.len() != scheduled {
        let stuck: Vec<&str> = (0..steps.len())
            .filter(|i| !fallbacks.contains(i) && !order.contains(i))
            .map(|i| steps[i].name.as_str())
            .collect();
        return Err(vec![Problem {
            step: None,
            message: format!("dependency cycle among: {}", stuck.join(", ")),
        }]);
    }
    Ok(BlockPlan {
        order,
        deps,
        fallbacks,
    })
}

fn problem(step: &Step, message: impl Into<String>) -> Problem {
    Problem {
        step: Some(step.name.clone()),
        message: message.into(),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name)
}

struct Checker<'a> {
    workflow: &'a Workflow,
    store: &'a TemplateStore,
    problems: Vec<Problem>,
}

impl Checker<'_> {
    fn push(&mut self, step: &Step, message: impl Into<String>) {
        self.problems.push(problem(step, message));
    }

    fn expr(&mut self, step: &Step, what: &str, src: &str, refs: &mut BTreeSet<String>) {
        match Expr::parse(src) {
            Ok(e) => e.roots(refs),
            Err(e) => self.push(step, format!("{}: {}", what, e)),
        }
    }

    fn template(&mut self, step: &Step, what: &str, src: &str, refs: &mut BTreeSet<String>) {
        match Template::parse(src) {
            Ok(t) => t.roots(refs),
            Err(e) => self.push(step, format!("{}: {}", what, e)),
        }
    }

    /// Check a block; returns the variables it guarantees to bind.
    fn block(&mut self, steps: &[Step], entry: &BTreeSet<String>) -> BTreeSet<String> {
        let plan = match plan_block(steps) {
            Ok(p) => p,
            Err(ps) => {
                self.problems.extend(ps);
                return BTreeSet::new();
            }
        };

        let mut guaranteed: Vec<BTreeSet<String>> = vec![BTreeSet::new(); steps.len()];
        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        let mut fallback_entry: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        let mut produced = BTreeSet::new();

        for &i in &plan.order {
            let mut anc = BTreeSet::new();
            for &d in &plan.deps[i] {
                anc.insert(d);
                anc.extend(ancestors[d].iter().copied());
            }
            let mut available = entry.clone();
            for a in &anc {
                available.extend(guaranteed[*a].iter().cloned());
            }
            ancestors[i] = anc;

            let step = &steps[i];
            let outputs = self.step(step, &available);
            if let OnError::Fallback(target) = &step.on_error {
                if let Some(t) = BlockPlan::index_of(steps, target) {
                    fallback_entry
                        .entry(t)
                        .and_modify(|s| s.retain(|v| available.contains(v)))
                        .or_insert_with(|| available.clone());
                }
            }
            if step.condition.is_none() {
                produced.extend(outputs.iter().cloned());
                guaranteed[i] = outputs;
            }
        }

        for (t, available) in fallback_entry {
            self.step(&steps[t], &available);
        }
        produced
    }

    /// Check one step against the variables available to it; returns its outputs.
    fn step(&mut self, step: &Step, available: &BTreeSet<String>) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        let mut outputs = BTreeSet::new();

        if step.name.trim().is_empty() {
            self.push(step, "name is empty");
        }
        if let Some(c) = &step.condition {
            self.expr(step, "condition", c, &mut refs);
        }
        if let Some(var) = &step.output_var {
            if is_identifier(var) {
                outputs.insert(var.clone());
            } else {
                self.push(step, format!("output_var '{}' is not a valid identifier", var));
            }
        }
        if step.timeout_ms == Some(0) {
            self.push(step, "timeout_ms must be positive");
        }
        if let Some(r) = &step.retry {
            if r.max_attempts == 0 {
                self.push(step, "retry.max_attempts must be at least 1");
            }
        }

        match &step.kind {
            StepKind::Prompt {
                prompt,
                model,
                system,
                ..
            } => {
                if prompt.trim().is_empty() {
                    self.push(step, "prompt is empty");
                }
                self.template(step, "prompt", prompt, &mut refs);
                if let Some(s) = system {
                    self.template(step, "system", s, &mut refs);
                }
                if model.as_deref().map_or(false, |m| m.trim().is_empty()) {
                    self.push(step, "model is empty");
                }
            }
            StepKind::Template { template, vars } => {
                let (workflow, store) = (self.workflow, self.store);
                let body = workflow
                    .templates
                    .get(template)
                    .map(String::as_str)
                    .or_else(|| store.get(template));
                match body {
                    None => self.push(step, format!("unknown template '{}'", template)),
                    Some(body) => {
                        let mut inner = BTreeSet::new();
                        self.template(step, "template body", body, &mut inner);
                        refs.extend(inner.into_iter().filter(|v| !vars.contains_key(v)));
                    }
                }
                for v in vars.values() {
                    if let Some(s) = v.as_str() {
                        self.template(step, "template var", s, &mut refs);
                    }
                }
            }
            StepKind::Conditional {
                expression,
                then,
                otherwise,
            } => {
                self.expr(step, "expression", expression, &mut refs);
                if then.is_empty() && otherwise.is_empty() {
                    self.push(step, "conditional has no branches");
                }
                let a = self.block(then, available);
                let b = self.block(otherwise, available);
                outputs.extend(a.intersection(&b).cloned());
            }
            StepKind::Loop {
                over,
                item_var,
                index_var,
                max_iterations,
                steps,
            } => {
                self.expr(step, "over", over, &mut refs);
                if steps.is_empty() {
                    self.push(step, "loop body is empty");
                }
                if *max_iterations == 0 {
                    self.push(step, "max_iterations must be positive");
                }
                for v in [item_var, index_var] {
                    if !is_identifier(v) {
                        self.push(step, format!("'{}' is not a valid identifier", v));
                    }
                }
                let mut inner = available.clone();
                inner.insert(item_var.clone());
                inner.insert(index_var.clone());
                self.block(steps, &inner);
            }
            StepKind::Extract {
                from,
                regex,
                group,
                json_path,
            } => {
                self.expr(step, "from", from, &mut refs);
                match (regex, json_path) {
                    (Some(_), Some(_)) | (None, None) => {
                        self.push(step, "extract needs exactly one of regex or json_path")
                    }
                    (Some(pattern), None) => match regex::Regex::new(pattern) {
                        Ok(re) => {
                            if let Some(g) = group {
                                if *g >= re.captures_len() {
                                    self.push(step, format!("regex has no group {}", g));
                                }
                            }
                        }
                        Err(e) => self.push(step, format!("invalid regex: {}", e)),
                    },
                    (None, Some(path)) => {
                        if let Err(e) = PathMapper::parse(path) {
                            self.push(step, format!("invalid json_path: {}", e));
                        }
                    }
                }
            }
            StepKind::Sleep { .. } => {}
            StepKind::UserConfirmation { message } => {
                if message.trim().is_empty() {
                    self.push(step, "confirmation message is empty");
                }
                self.template(step, "message", message, &mut refs);
            }
        }

        for var in refs.difference(available) {
            self.push(
                step,
                format!("reads '{}', which is not produced on every path before it", var),
            );
        }
        outputs
    }
}

/// All problems in `workflow`, empty when it is valid.
pub fn problems(workflow: &Workflow, store: &TemplateStore) -> Vec<Problem> {
    let mut checker = Checker {
        workflow,
        store,
        problems: Vec::new(),
    };
    if workflow.id.trim().is_empty() {
        checker.problems.push(Problem {
            step: None,
            message: "workflow id is empty".to_string(),
        });
    }
    if workflow.steps.is_empty() {
        checker.problems.push(Problem {
            step: None,
            message: "workflow has no steps".to_string(),
        });
    }
    let mut seen = BTreeSet::new();
    for s in workflow.all_steps() {
        if !seen.insert(s.name.as_str()) {
            checker.problems.push(problem(s, "duplicate step name"));
        }
    }
    for input in &workflow.inputs {
        if !is_identifier(input) {
            checker.problems.push(Problem {
                step: None,
                message: format!("input '{}' is not a valid identifier", input),
            });
        }
    }
    let entry: BTreeSet<String> = workflow.inputs.iter().cloned().collect();
    checker.block(&workflow.steps, &entry);
    checker.problems
}

/// Fail with every problem in one validation error.
pub fn validate(workflow: &Workflow, store: &TemplateStore) -> Result<()> {
    let found = problems(workflow, store);
    if found.is_empty() {
        return Ok(());
    }
    let summary: Vec<String> = found.iter().map(ToString::to_string).collect();
    Err(Error::validation_with_context(
        format!("workflow '{}' is invalid: {}", workflow.id, summary.join("; ")),
        ErrorContext::new()
            .with_source(format!("workflow:{}", workflow.id))
            .with_field_path(found[0].step.clone().unwrap_or_default()),
    ))
}
