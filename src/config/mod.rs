//! Declarative configuration.
//!
//! A configuration directory holds up to four documents, each either YAML
//! (`.yaml`/`.yml`) or JSON (`.json`):
//!
//! | File        | Content                                   | Required |
//! |-------------|-------------------------------------------|----------|
//! | `profile`   | [`HardwareProfile`]                       | yes      |
//! | `models`    | `models: [ModelDescriptor]`               | yes      |
//! | `providers` | `providers: [ProviderConfig]`             | yes      |
//! | `router`    | [`RouterSettings`]                        | no       |
//!
//! The directory defaults to `./config` and can be moved with
//! `LLM_ROUTER_CONFIG_DIR`. A handful of deployment knobs are also
//! overridable from the environment (see [`RouterSettings::apply_env`]).

pub mod credentials;
pub mod profile;
pub mod provider;

pub use credentials::{resolve_credential, Credential};
pub use profile::{GpuKind, HardwareProfile, Platform};
pub use provider::{LocalInferenceOptions, PromptInput, ProviderConfig, ProviderTimeouts};

use crate::registry::ModelDescriptor;
use crate::resilience::{FallbackStrategy, RetryPolicy};
use crate::session::StoreConfig;
use crate::{Error, ErrorContext, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "LLM_ROUTER_CONFIG_DIR";

/// Router-wide behavior knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub default_fallback_strategy: FallbackStrategy,
    /// Minimum time after a failure before an unhealthy provider gets a probe.
    #[serde(default = "default_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_timeout_total_ms")]
    pub default_timeout_total_ms: u64,
    #[serde(default)]
    pub store: StoreConfig,
    /// Use-case category -> model id, consulted for `model_id = "auto"`.
    #[serde(default)]
    pub recommendations: BTreeMap<String, String>,
    /// Optional replacement keyword table for use-case detection.
    #[serde(default)]
    pub use_case_keywords: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_timeout_total_ms() -> u64 {
    300_000
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_fallback_strategy: FallbackStrategy::default(),
            health_check_interval_ms: default_check_interval_ms(),
            default_timeout_total_ms: default_timeout_total_ms(),
            store: StoreConfig::default(),
            recommendations: BTreeMap::new(),
            use_case_keywords: None,
            workflows_dir: None,
        }
    }
}

impl RouterSettings {
    /// Apply `LLM_ROUTER_POOL_SIZE`, `LLM_ROUTER_STORE_PATH` and
    /// `LLM_ROUTER_ATTEMPT_TIMEOUT_MS` when set and well-formed.
    pub fn apply_env(&mut self) {
        if let Some(n) = std::env::var("LLM_ROUTER_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
        {
            self.store.pool_size = n;
        }
        if let Ok(path) = std::env::var("LLM_ROUTER_STORE_PATH") {
            if !path.is_empty() {
                self.store.path = PathBuf::from(path);
            }
        }
        if let Some(ms) = std::env::var("LLM_ROUTER_ATTEMPT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.retry.max_attempt_timeout_ms = ms;
        }
    }
}

/// Everything needed to build a router.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub profile: HardwareProfile,
    pub models: Vec<ModelDescriptor>,
    pub providers: Vec<ProviderConfig>,
    pub settings: RouterSettings,
    /// Directory the documents were read from; relative paths resolve against it.
    pub base_path: PathBuf,
}

impl AppConfig {
    /// Cross-document checks: unique provider names, valid provider records, valid profile.
    pub fn validate(&self) -> Result<()> {
        self.profile.validate()?;
        let mut seen = HashSet::new();
        for (i, p) in self.providers.iter().enumerate() {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider name '{}'", p.name),
                    ErrorContext::new().with_field_path(format!("providers[{}].name", i)),
                ));
            }
            p.validate()?;
        }
        for (category, model_id) in &self.settings.recommendations {
            if !self.models.iter().any(|m| &m.id == model_id) {
                return Err(Error::configuration_with_context(
                    format!("recommendation for '{}' names unknown model '{}'", category, model_id),
                    ErrorContext::new().with_field_path(format!("recommendations.{}", category)),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ModelsDoc {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

#[derive(Deserialize)]
struct ProvidersDoc {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
}

/// Loads [`AppConfig`] from a directory.
pub struct ConfigLoader {
    base_path: PathBuf,
    apply_env: bool,
}

impl ConfigLoader {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            apply_env: true,
        }
    }

    /// Directory from `LLM_ROUTER_CONFIG_DIR`, else `./config`.
    pub fn from_env() -> Self {
        let dir = std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| "config".to_string());
        Self::new(dir)
    }

    /// Skip environment overrides (useful for tests).
    pub fn without_env(mut self) -> Self {
        self.apply_env = false;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn load(&self) -> Result<AppConfig> {
        let profile: HardwareProfile = self.require("profile")?;
        let models: ModelsDoc = self.require("models")?;
        let providers: ProvidersDoc = self.require("providers")?;
        let mut settings: RouterSettings = self.read_doc("router")?.unwrap_or_default();
        if self.apply_env {
            settings.apply_env();
        }
        if settings.store.path.is_relative() {
            settings.store.path = self.base_path.join(&settings.store.path);
        }
        if let Some(dir) = settings.workflows_dir.as_mut() {
            if dir.is_relative() {
                *dir = self.base_path.join(&*dir);
            }
        }

        let config = AppConfig {
            profile,
            models: models.models,
            providers: providers.providers,
            settings,
            base_path: self.base_path.clone(),
        };
        config.validate()?;
        tracing::info!(
            event = "config_loaded",
            base_path = %self.base_path.display(),
            models = config.models.len(),
            providers = config.providers.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn require<T: DeserializeOwned>(&self, stem: &str) -> Result<T> {
        self.read_doc(stem)?.ok_or_else(|| {
            Error::configuration_with_context(
                format!("missing configuration document '{}'", stem),
                ErrorContext::new()
                    .with_source("config_loader")
                    .with_details(format!("looked for {0}.yaml, {0}.yml, {0}.json", stem))
                    .with_hint(format!("set {} or create the file", CONFIG_DIR_ENV)),
            )
        })
    }

    /// Read `<stem>.yaml|yml|json`, whichever exists first.
    pub fn read_doc<T: DeserializeOwned>(&self, stem: &str) -> Result<Option<T>> {
        for ext in ["yaml", "yml", "json"] {
            let path = self.base_path.join(format!("{}.{}", stem, ext));
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let doc = parse_document(&content, ext).map_err(|e| {
                Error::configuration_with_context(
                    format!("failed to parse {}: {}", path.display(), e),
                    ErrorContext::new().with_source("config_loader"),
                )
            })?;
            return Ok(Some(doc));
        }
        Ok(None)
    }
}

/// Parse YAML or JSON text by extension.
pub fn parse_document<T: DeserializeOwned>(content: &str, ext: &str) -> Result<T> {
    if ext == "json" {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_loads_full_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "profile.yaml",
            "platform: linux\ngpu_kind: cuda\nvram_bytes: 8000000000\ncpu_threads: 8\nmodels_root: /srv/models\n",
        );
        write(
            dir.path(),
            "models.yaml",
            "models:\n  - id: m-chat-a\n    backend_kind: remote-chat-http\n    location: gpt-x\n",
        );
        write(
            dir.path(),
            "providers.json",
            r#"{"providers":[{"name":"p1","backend_kind":"remote-chat-http","endpoint":"http://127.0.0.1:9/v1"}]}"#,
        );
        write(
            dir.path(),
            "router.yaml",
            "store:\n  path: data/sessions.db\nrecommendations:\n  general: m-chat-a\n",
        );

        let cfg = ConfigLoader::new(dir.path()).without_env().load().unwrap();
        assert_eq!(cfg.profile.cpu_threads, 8);
        assert_eq!(cfg.models[0].id, "m-chat-a");
        assert_eq!(cfg.providers[0].name, "p1");
        assert_eq!(cfg.settings.store.path, dir.path().join("data/sessions.db"));
        assert_eq!(cfg.settings.recommendations["general"], "m-chat-a");
    }

    #[test]
    fn test_missing_profile_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new(dir.path()).without_env().load().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("profile"));
    }

    #[test]
    fn test_duplicate_provider_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "profile.yaml", "platform: linux\nmodels_root: /m\n");
        write(dir.path(), "models.yaml", "models: []\n");
        write(
            dir.path(),
            "providers.yaml",
            "providers:\n  - {name: a, backend_kind: local-server-http, endpoint: 'http://localhost:1'}\n  - {name: a, backend_kind: local-server-http, endpoint: 'http://localhost:2'}\n",
        );
        let err = ConfigLoader::new(dir.path()).without_env().load().unwrap_err();
        assert!(err.to_string().contains("duplicate provider name"));
    }
}
