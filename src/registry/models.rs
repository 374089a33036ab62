//! Typed model registry.
//!
//! Descriptors are loaded once from configuration and never mutated. The only
//! runtime state is each descriptor's usability flag, set by
//! [`ModelRegistry::validate_all`] at startup: unusable descriptors stay
//! visible through [`get`](ModelRegistry::get) and [`list`](ModelRegistry::list)
//! but [`select`](ModelRegistry::select) refuses them.

use crate::config::HardwareProfile;
use crate::registry::Capability;
use crate::types::BackendKind;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Static metadata describing how and where a model runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub backend_kind: BackendKind,
    /// Filesystem path (local inference) or backend model id (HTTP backends).
    pub location: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub context_tokens: Option<u32>,
    /// Advisory tokens per second.
    #[serde(default)]
    pub estimated_speed: Option<f64>,
    /// Keyed by the canonical parameter names of the backend's schema.
    #[serde(default)]
    pub default_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub capability_hints: BTreeSet<Capability>,
    #[serde(default)]
    pub system_prompt_ref: Option<String>,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        backend_kind: BackendKind,
        location: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            notes: None,
            backend_kind,
            location: location.into(),
            size_bytes: None,
            context_tokens: None,
            estimated_speed: None,
            default_params: serde_json::Map::new(),
            capability_hints: BTreeSet::new(),
            system_prompt_ref: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_default_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.default_params.insert(key.into(), value);
        self
    }

    pub fn with_capability_hint(mut self, cap: Capability) -> Self {
        self.capability_hints.insert(cap);
        self
    }

    /// Name shown to users; falls back to the id.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Usability of one descriptor after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    /// Not yet validated against a profile.
    Unchecked,
    Usable,
    Unusable { reason: String },
}

impl ModelStatus {
    pub fn is_selectable(&self) -> bool {
        !matches!(self, ModelStatus::Unusable { .. })
    }
}

/// Outcome of [`ModelRegistry::validate_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub entries: Vec<(String, ModelStatus)>,
}

impl ValidationReport {
    pub fn usable(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, s)| *s == ModelStatus::Usable)
            .map(|(id, _)| id.as_str())
    }

    pub fn unusable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(id, s)| match s {
            ModelStatus::Unusable { reason } => Some((id.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn all_usable(&self) -> bool {
        self.unusable().next().is_none()
    }
}

/// Filter for [`ModelRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub backend_kind: Option<BackendKind>,
    pub capability: Option<Capability>,
}

impl ModelFilter {
    pub fn backend(kind: BackendKind) -> Self {
        Self {
            backend_kind: Some(kind),
            capability: None,
        }
    }

    pub fn capability(cap: Capability) -> Self {
        Self {
            backend_kind: None,
            capability: Some(cap),
        }
    }

    fn matches(&self, d: &ModelDescriptor) -> bool {
        self.backend_kind.map_or(true, |k| d.backend_kind == k)
            && self.capability.map_or(true, |c| d.capability_hints.contains(&c))
    }
}

/// Single source of truth for model descriptors.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    descriptors: Vec<Arc<ModelDescriptor>>,
    index: HashMap<String, usize>,
    status: Vec<ModelStatus>,
}

impl ModelRegistry {
    /// Build from an ordered list; duplicate or empty ids are rejected.
    pub fn from_descriptors(descriptors: Vec<ModelDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, d) in descriptors.iter().enumerate() {
            if d.id.trim().is_empty() {
                return Err(Error::configuration_with_context(
                    "model id must not be empty",
                    ErrorContext::new().with_field_path(format!("models[{}].id", i)),
                ));
            }
            if index.insert(d.id.clone(), i).is_some() {
                return Err(Error::configuration_with_context(
                    format!("duplicate model id '{}'", d.id),
                    ErrorContext::new().with_field_path(format!("models[{}].id", i)),
                ));
            }
        }
        let status = vec![ModelStatus::Unchecked; descriptors.len()];
        Ok(Self {
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
            index,
            status,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Look up a descriptor regardless of usability.
    pub fn get(&self, id: &str) -> Result<Arc<ModelDescriptor>> {
        self.index
            .get(id)
            .map(|i| self.descriptors[*i].clone())
            .ok_or_else(|| Error::not_found(format!("model '{}' is not registered", id)))
    }

    /// Look up a descriptor that may be dispatched to.
    pub fn select(&self, id: &str) -> Result<Arc<ModelDescriptor>> {
        let descriptor = self.get(id)?;
        match self.status(id) {
            Some(ModelStatus::Unusable { reason }) => Err(Error::not_found(format!(
                "model '{}' is unusable: {}",
                id, reason
            ))),
            _ => Ok(descriptor),
        }
    }

    pub fn status(&self, id: &str) -> Option<&ModelStatus> {
        self.index.get(id).map(|i| &self.status[*i])
    }

    pub fn is_usable(&self, id: &str) -> bool {
        self.status(id).map_or(false, |s| s.is_selectable())
    }

    /// Descriptors in registration order, optionally filtered.
    pub fn list(&self, filter: &ModelFilter) -> Vec<Arc<ModelDescriptor>> {
        self.descriptors
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    /// Check every descriptor against the profile and record usability.
    ///
    /// `local-inference` locations must resolve (via `models_root`) to a
    /// readable regular file. HTTP-backed descriptors only need a non-empty
    /// location.
    pub fn validate_all(&mut self, profile: &HardwareProfile) -> ValidationReport {
        let mut report = ValidationReport::default();
        for (i, d) in self.descriptors.iter().enumerate() {
            let status = check_descriptor(d, profile);
            if let ModelStatus::Unusable { ref reason } = status {
                tracing::warn!(
                    event = "model_unusable",
                    model_id = %d.id,
                    reason = %reason,
                    "model descriptor marked unusable"
                );
            }
            self.status[i] = status.clone();
            report.entries.push((d.id.clone(), status));
        }
        report
    }
}

fn check_descriptor(d: &ModelDescriptor, profile: &HardwareProfile) -> ModelStatus {
    if d.location.trim().is_empty() {
        return ModelStatus::Unusable {
            reason: "empty location".to_string(),
        };
    }
    if d.backend_kind != BackendKind::LocalInference {
        return ModelStatus::Usable;
    }
    let path = profile.resolve_location(&d.location);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => match std::fs::File::open(&path) {
            Ok(_) => ModelStatus::Usable,
            Err(e) => ModelStatus::Unusable {
                reason: format!("{} is not readable: {}", path.display(), e),
            },
        },
        Ok(_) => ModelStatus::Unusable {
            reason: format!("{} is not a regular file", path.display()),
        },
        Err(e) => ModelStatus::Unusable {
            reason: format!("{} cannot be opened: {}", path.display(), e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::error_kind::ErrorKind;

    fn registry(root: &std::path::Path) -> ModelRegistry {
        std::fs::write(root.join("present.gguf"), b"weights").unwrap();
        ModelRegistry::from_descriptors(vec![
            ModelDescriptor::new("local-ok", BackendKind::LocalInference, "present.gguf"),
            ModelDescriptor::new("local-missing", BackendKind::LocalInference, "absent.gguf"),
            ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x")
                .with_capability_hint(Capability::Vision),
        ])
        .unwrap()
    }

    #[test]
    fn test_validate_all_flags_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path());
        let profile = HardwareProfile::new(Platform::Linux, dir.path());
        let report = reg.validate_all(&profile);

        assert_eq!(report.usable().collect::<Vec<_>>(), vec!["local-ok", "m-chat-a"]);
        let unusable: Vec<_> = report.unusable().map(|(id, _)| id).collect();
        assert_eq!(unusable, vec!["local-missing"]);

        // still visible, but not selectable
        assert!(reg.get("local-missing").is_ok());
        let err = reg.select("local-missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(reg.select("local-ok").is_ok());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let reg = ModelRegistry::from_descriptors(vec![]).unwrap();
        assert_eq!(reg.get("nope").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let d = ModelDescriptor::new("x", BackendKind::RemoteChatHttp, "a");
        assert!(ModelRegistry::from_descriptors(vec![d.clone(), d]).is_err());
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.list(&ModelFilter::default()).len(), 3);
        assert_eq!(
            reg.list(&ModelFilter::backend(BackendKind::LocalInference)).len(),
            2
        );
        let vision = reg.list(&ModelFilter::capability(Capability::Vision));
        assert_eq!(vision.len(), 1);
        assert_eq!(vision[0].id, "m-chat-a");
    }
}
