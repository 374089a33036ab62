//! `{{ expression }}` interpolation and the shared template store.

use super::expr::{display, Expr};
use super::Variables;
use crate::{Error, ErrorContext, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Hole(Expr),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                Error::workflow_with_context(
                    "unterminated '{{' in template",
                    ErrorContext::new()
                        .with_details(source.to_string())
                        .with_source("template"),
                )
            })?;
            parts.push(Part::Hole(Expr::parse(&after[..close])?));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn roots(&self, out: &mut BTreeSet<String>) {
        for p in &self.parts {
            if let Part::Hole(e) = p {
                e.roots(out);
            }
        }
    }

    pub fn render(&self, vars: &Variables) -> Result<String> {
        let mut out = String::new();
        for p in &self.parts {
            match p {
                Part::Text(t) => out.push_str(t),
                Part::Hole(e) => out.push_str(&display(&e.eval(vars)?)),
            }
        }
        Ok(out)
    }
}

/// Parse and render in one go.
pub fn render(source: &str, vars: &Variables) -> Result<String> {
    Template::parse(source)?.render(vars)
}

/// Named templates shared by every workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateStore {
    templates: BTreeMap<String, String>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(name, body);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(name.into(), body.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Every regular file in `dir`, keyed by file stem. A missing directory is empty.
    pub async fn from_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let body = tokio::fs::read_to_string(&path).await?;
                store.insert(stem, body);
            }
        }
        Ok(store)
    }
}
