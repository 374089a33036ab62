//! Backend capability declarations.
//!
//! A static map from [`BackendKind`] to the [`Capability`] set it supports.
//! The router consults it before dispatch and rejects requests that need a
//! capability the target backend lacks (`unsupported-capability`, not retried).

use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Opt-in feature a backend advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Streaming,
    Vision,
    #[serde(alias = "tools")]
    ToolCalling,
    JsonMode,
    SystemPrompt,
    TokenCounting,
    ExtendedContext,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Vision => "vision",
            Self::ToolCalling => "tool-calling",
            Self::JsonMode => "json-mode",
            Self::SystemPrompt => "system-prompt",
            Self::TokenCounting => "token-counting",
            Self::ExtendedContext => "extended-context",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(backend_kind) -> set<Capability>`
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    map: HashMap<BackendKind, BTreeSet<Capability>>,
}

impl CapabilityRegistry {
    /// Registry with no backends declared.
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Capabilities of the three built-in backends.
    pub fn builtin() -> Self {
        use Capability::*;
        Self::empty()
            .with_backend(
                BackendKind::LocalInference,
                [Streaming, SystemPrompt, TokenCounting],
            )
            .with_backend(
                BackendKind::RemoteChatHttp,
                [
                    Streaming,
                    Vision,
                    ToolCalling,
                    JsonMode,
                    SystemPrompt,
                    TokenCounting,
                    ExtendedContext,
                ],
            )
            .with_backend(
                BackendKind::LocalServerHttp,
                [Streaming, Vision, ToolCalling, JsonMode, SystemPrompt],
            )
    }

    /// Replace the declared set for one backend.
    pub fn with_backend(
        mut self,
        backend: BackendKind,
        caps: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.map.insert(backend, caps.into_iter().collect());
        self
    }

    pub fn has(&self, backend: BackendKind, cap: Capability) -> bool {
        self.map.get(&backend).map_or(false, |s| s.contains(&cap))
    }

    /// Backends supporting `cap`, in stable order.
    pub fn find(&self, cap: Capability) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|b| self.has(*b, cap))
            .collect()
    }

    pub fn capabilities(&self, backend: BackendKind) -> BTreeSet<Capability> {
        self.map.get(&backend).cloned().unwrap_or_default()
    }

    /// Required capabilities the backend lacks.
    pub fn missing<'a>(
        &self,
        backend: BackendKind,
        required: impl IntoIterator<Item = &'a Capability>,
    ) -> Vec<Capability> {
        required
            .into_iter()
            .filter(|c| !self.has(backend, **c))
            .copied()
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
