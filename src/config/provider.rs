//! Per-provider configuration records.

use crate::types::BackendKind;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the prompt reaches a local inference binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptInput {
    /// Written to the child's stdin, which is then closed.
    #[default]
    Stdin,
    /// Substituted into the `{prompt}` argv element.
    Argv,
}

/// Subprocess launch settings for `local-inference` providers.
///
/// `args` is a template; each element is one argv entry and may contain the
/// placeholders `{model}`, `{prompt}`, `{threads}` and `{gpu_layers}`.
/// Normalized generation parameters are appended after the template as
/// `--<native_name> <value>` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalInferenceOptions {
    pub binary: PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt_input: PromptInput,
    /// Serialize invocations that share one model file.
    #[serde(default = "default_true")]
    pub serialize_per_location: bool,
    /// Binary is a Windows executable launched from WSL; locations are translated back.
    #[serde(default)]
    pub windows_binary: bool,
}

fn default_args() -> Vec<String> {
    vec![
        "--model".to_string(),
        "{model}".to_string(),
        "--threads".to_string(),
        "{threads}".to_string(),
        "--n-gpu-layers".to_string(),
        "{gpu_layers}".to_string(),
        "--json-stream".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTimeouts {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_request_ms() -> u64 {
    120_000
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            request_ms: default_request_ms(),
        }
    }
}

impl ProviderTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// One configured provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the keyring entry or environment variable holding the secret.
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub timeouts: ProviderTimeouts,
    /// Whether this instance can stream; when false, streamed requests are downgraded.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Override for the JSON path of the text delta inside stream frames.
    #[serde(default)]
    pub delta_path: Option<String>,
    #[serde(default)]
    pub local: Option<LocalInferenceOptions>,
}

fn default_max_concurrency() -> usize {
    4
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend_kind,
            endpoint: None,
            credential_ref: None,
            max_concurrency: default_max_concurrency(),
            timeouts: ProviderTimeouts::default(),
            streaming: true,
            delta_path: None,
            local: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credential_ref(mut self, reference: impl Into<String>) -> Self {
        self.credential_ref = Some(reference.into());
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ProviderTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_local(mut self, local: LocalInferenceOptions) -> Self {
        self.local = Some(local);
        self
    }

    /// Structural checks shared by every backend.
    pub fn validate(&self) -> Result<()> {
        let ctx = || ErrorContext::new().with_source(format!("provider:{}", self.name));
        if self.name.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "provider name must not be empty",
                ctx().with_field_path("name"),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(Error::configuration_with_context(
                "max_concurrency must be at least 1",
                ctx().with_field_path("max_concurrency"),
            ));
        }
        match self.backend_kind {
            BackendKind::RemoteChatHttp | BackendKind::LocalServerHttp => {
                let endpoint = self.endpoint.as_deref().ok_or_else(|| {
                    Error::configuration_with_context(
                        "HTTP providers require an endpoint",
                        ctx().with_field_path("endpoint"),
                    )
                })?;
                let url = url::Url::parse(endpoint).map_err(|e| {
                    Error::configuration_with_context(
                        format!("invalid endpoint: {}", e),
                        ctx().with_field_path("endpoint"),
                    )
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::configuration_with_context(
                        format!("unsupported endpoint scheme '{}'", url.scheme()),
                        ctx().with_field_path("endpoint"),
                    ));
                }
            }
            BackendKind::LocalInference => {
                let local = self.local.as_ref().ok_or_else(|| {
                    Error::configuration_with_context(
                        "local-inference providers require a `local` section",
                        ctx().with_field_path("local"),
                    )
                })?;
                if local.binary.as_os_str().is_empty() {
                    return Err(Error::configuration_with_context(
                        "local.binary must not be empty",
                        ctx().with_field_path("local.binary"),
                    ));
                }
                if local.prompt_input == PromptInput::Argv
                    && !local.args.iter().any(|a| a.contains("{prompt}"))
                {
                    return Err(Error::configuration_with_context(
                        "prompt_input=argv requires a {prompt} placeholder in args",
                        ctx().with_field_path("local.args"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_provider_needs_valid_endpoint() {
        let p = ProviderConfig::new("remote", BackendKind::RemoteChatHttp);
        assert!(p.validate().is_err());
        let p = p.with_endpoint("ftp://example.com");
        assert!(p.validate().is_err());
        let p = ProviderConfig::new("remote", BackendKind::RemoteChatHttp)
            .with_endpoint("https://api.example.com/v1");
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
name: llama-local
backend_kind: local-inference
local:
  binary: /usr/local/bin/llama-run
"#;
        let p: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.max_concurrency, 4);
        assert!(p.streaming);
        let local = p.local.as_ref().unwrap();
        assert!(local.serialize_per_location);
        assert_eq!(local.prompt_input, PromptInput::Stdin);
        assert!(local.args.contains(&"{model}".to_string()));
        assert!(p.validate().is_ok());
    }
}
