//! Per-backend generation parameter schemas.
//!
//! Callers speak one canonical vocabulary (`temperature`, `max_tokens`,
//! `top_p`, …). Each backend schema declares which canonical keys it accepts,
//! their constraints, optional defaults, and the native key the backend
//! expects on the wire. Validation is total: the input either becomes a
//! normalized map keyed by native names or fails with `invalid-request`
//! naming the offending key.
//!
//! | canonical         | remote-chat-http    | local-server-http | local-inference  |
//! |-------------------|---------------------|-------------------|------------------|
//! | temperature       | temperature         | temperature       | temp             |
//! | max_tokens        | max_tokens          | num_predict       | n-predict        |
//! | top_p             | top_p               | top_p             | top-p            |
//! | top_k             | -                   | top_k             | top-k            |
//! | stop              | stop                | stop              | -                |
//! | seed              | seed                | seed              | seed             |
//! | repeat_penalty    | -                   | repeat_penalty    | repeat-penalty   |
//! | presence_penalty  | presence_penalty    | -                 | -                |
//! | frequency_penalty | frequency_penalty   | -                 | -                |
//! | context_tokens    | -                   | num_ctx           | ctx-size         |
//! | response_format   | response_format     | format            | -                |

use crate::types::BackendKind;
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Normalized parameters keyed by native names.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Float,
    Integer,
    Bool,
    String,
    /// A string or a list of strings; always normalized to a list.
    StringList,
}

/// Constraints for one canonical key.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub native: String,
    pub ty: ParamType,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<Vec<String>>,
    pub default: Option<Value>,
    /// Upper bound on list length for `StringList`.
    pub max_items: Option<usize>,
}

impl ParamSpec {
    pub fn new(native: impl Into<String>, ty: ParamType) -> Self {
        Self {
            native: native.into(),
            ty,
            min: None,
            max: None,
            allowed: None,
            default: None,
            max_items: None,
        }
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    fn check(&self, key: &str, value: &Value) -> std::result::Result<Value, ParamViolation> {
        let violation = |reason: String| ParamViolation {
            field: key.to_string(),
            reason,
        };
        let normalized = match self.ty {
            ParamType::Float => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| violation(format!("expected number, got {}", type_name(value))))?;
                self.check_range(n).map_err(violation)?;
                value.clone()
            }
            ParamType::Integer => {
                let n = as_integer(value).ok_or_else(|| {
                    violation(format!("expected integer, got {}", type_name(value)))
                })?;
                self.check_range(n as f64).map_err(violation)?;
                Value::from(n)
            }
            ParamType::Bool => {
                if !value.is_boolean() {
                    return Err(violation(format!("expected boolean, got {}", type_name(value))));
                }
                value.clone()
            }
            ParamType::String => {
                let s = value
                    .as_str()
                    .ok_or_else(|| violation(format!("expected string, got {}", type_name(value))))?;
                self.check_allowed(s).map_err(violation)?;
                value.clone()
            }
            ParamType::StringList => {
                let items: Vec<String> = match value {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(arr) => arr
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| violation("expected a list of strings".to_string()))?,
                    other => {
                        return Err(violation(format!(
                            "expected string or list of strings, got {}",
                            type_name(other)
                        )))
                    }
                };
                if let Some(limit) = self.max_items {
                    if items.len() > limit {
                        return Err(violation(format!(
                            "at most {} entries allowed, got {}",
                            limit,
                            items.len()
                        )));
                    }
                }
                for item in &items {
                    self.check_allowed(item).map_err(violation)?;
                }
                Value::from(items)
            }
        };
        Ok(normalized)
    }

    fn check_range(&self, n: f64) -> std::result::Result<(), String> {
        if !n.is_finite() {
            return Err("value must be finite".to_string());
        }
        if let Some(min) = self.min {
            if n < min {
                return Err(format!("{} is below minimum {}", n, min));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(format!("{} is above maximum {}", n, max));
            }
        }
        Ok(())
    }

    fn check_allowed(&self, s: &str) -> std::result::Result<(), String> {
        match &self.allowed {
            Some(allowed) if !allowed.iter().any(|a| a == s) => Err(format!(
                "'{}' is not one of [{}]",
                s,
                allowed.join(", ")
            )),
            _ => Ok(()),
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    // 16.0 is accepted as 16; 16.5 is not.
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The offending key and why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamViolation {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for ParamViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid parameter '{}': {}", self.field, self.reason)
    }
}

impl From<ParamViolation> for Error {
    fn from(v: ParamViolation) -> Self {
        Error::invalid_request(v.to_string())
    }
}

/// Accepted keys for one backend.
#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub backend: BackendKind,
    specs: BTreeMap<String, ParamSpec>,
}

impl ParameterSchema {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            specs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, canonical: impl Into<String>, spec: ParamSpec) -> Self {
        self.specs.insert(canonical.into(), spec);
        self
    }

    pub fn spec(&self, canonical: &str) -> Option<&ParamSpec> {
        self.specs.get(canonical)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn builtin(backend: BackendKind) -> Self {
        use ParamType::*;
        let temperature = |default: f64| {
            ParamSpec::new("temperature", Float)
                .range(0.0, 2.0)
                .default_value(Value::from(default))
        };
        match backend {
            BackendKind::RemoteChatHttp => Self::new(backend)
                .with("temperature", temperature(0.7))
                .with("max_tokens", ParamSpec::new("max_tokens", Integer).min(1.0))
                .with("top_p", ParamSpec::new("top_p", Float).range(0.0, 1.0))
                .with("stop", ParamSpec::new("stop", StringList).max_items(4))
                .with("seed", ParamSpec::new("seed", Integer))
                .with(
                    "presence_penalty",
                    ParamSpec::new("presence_penalty", Float).range(-2.0, 2.0),
                )
                .with(
                    "frequency_penalty",
                    ParamSpec::new("frequency_penalty", Float).range(-2.0, 2.0),
                )
                .with(
                    "response_format",
                    ParamSpec::new("response_format", String).one_of(&["text", "json"]),
                ),
            BackendKind::LocalServerHttp => Self::new(backend)
                .with("temperature", temperature(0.8))
                .with("max_tokens", ParamSpec::new("num_predict", Integer).min(1.0))
                .with("top_p", ParamSpec::new("top_p", Float).range(0.0, 1.0))
                .with("top_k", ParamSpec::new("top_k", Integer).range(1.0, 1000.0))
                .with("stop", ParamSpec::new("stop", StringList).max_items(16))
                .with("seed", ParamSpec::new("seed", Integer))
                .with(
                    "repeat_penalty",
                    ParamSpec::new("repeat_penalty", Float).range(0.0, 5.0),
                )
                .with("context_tokens", ParamSpec::new("num_ctx", Integer).min(128.0))
                .with(
                    "response_format",
                    ParamSpec::new("format", String).one_of(&["text", "json"]),
                ),
            BackendKind::LocalInference => Self::new(backend)
                .with(
                    "temperature",
                    ParamSpec::new("temp", Float)
                        .range(0.0, 2.0)
                        .default_value(Value::from(0.8)),
                )
                .with(
                    "max_tokens",
                    ParamSpec::new("n-predict", Integer)
                        .min(1.0)
                        .default_value(Value::from(256)),
                )
                .with("top_p", ParamSpec::new("top-p", Float).range(0.0, 1.0))
                .with("top_k", ParamSpec::new("top-k", Integer).range(1.0, 1000.0))
                .with("seed", ParamSpec::new("seed", Integer))
                .with(
                    "repeat_penalty",
                    ParamSpec::new("repeat-penalty", Float).range(0.0, 5.0),
                )
                .with("context_tokens", ParamSpec::new("ctx-size", Integer).min(128.0)),
        }
    }

    /// Validate canonical params and return them under native names.
    pub fn check(&self, params: &Params) -> std::result::Result<Params, ParamViolation> {
        let mut out = Params::new();
        for (key, value) in params {
            let spec = self.specs.get(key).ok_or_else(|| ParamViolation {
                field: key.clone(),
                reason: format!("not a recognized parameter for {}", self.backend),
            })?;
            if value.is_null() {
                return Err(ParamViolation {
                    field: key.clone(),
                    reason: "null is not allowed".to_string(),
                });
            }
            out.insert(spec.native.clone(), spec.check(key, value)?);
        }
        for spec in self.specs.values() {
            if let Some(ref default) = spec.default {
                out.entry(spec.native.clone()).or_insert_with(|| default.clone());
            }
        }
        Ok(out)
    }
}

/// Schemas for every backend kind.
#[derive(Debug, Clone)]
pub struct ParameterSchemas {
    schemas: HashMap<BackendKind, ParameterSchema>,
}

impl Default for ParameterSchemas {
    fn default() -> Self {
        Self {
            schemas: BackendKind::ALL
                .into_iter()
                .map(|k| (k, ParameterSchema::builtin(k)))
                .collect(),
        }
    }
}

impl ParameterSchemas {
    pub fn get(&self, backend: BackendKind) -> Option<&ParameterSchema> {
        self.schemas.get(&backend)
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.schemas.insert(schema.backend, schema);
        self
    }

    /// `validate(backend_kind, params) -> params' | invalid-request`
    pub fn validate(&self, backend: BackendKind, params: &Params) -> Result<Params> {
        let schema = self.schemas.get(&backend).ok_or_else(|| {
            Error::invalid_request(format!("no parameter schema for backend {}", backend))
        })?;
        Ok(schema.check(params)?)
    }

    /// Layer request params over descriptor defaults, then validate.
    pub fn validate_with_defaults(
        &self,
        backend: BackendKind,
        defaults: &Params,
        params: &Params,
    ) -> Result<Params> {
        let mut merged = defaults.clone();
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
        self.validate(backend, &merged)
    }
}
