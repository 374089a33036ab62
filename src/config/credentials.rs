//! Provider credential resolution.
//!
//! Lookup order for a provider with `credential_ref = R`:
//! 1. OS keyring entry (service `llm-router`, user `R`)
//! 2. environment variable `R`
//! 3. environment variable `<PROVIDER>_API_KEY`

use keyring::Entry;
use std::env;
use std::fmt;

pub const KEYRING_SERVICE: &str = "llm-router";

/// A resolved secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

fn env_name(provider_name: &str) -> String {
    let upper: String = provider_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_API_KEY", upper)
}

/// Resolve the secret for a provider, if one is configured anywhere.
pub fn resolve_credential(provider_name: &str, credential_ref: Option<&str>) -> Option<Credential> {
    if let Some(reference) = credential_ref {
        if let Ok(entry) = Entry::new(KEYRING_SERVICE, reference) {
            if let Ok(secret) = entry.get_password() {
                return Some(Credential(secret));
            }
        }
        if let Ok(secret) = env::var(reference) {
            if !secret.is_empty() {
                return Some(Credential(secret));
            }
        }
    }
    env::var(env_name(provider_name))
        .ok()
        .filter(|s| !s.is_empty())
        .map(Credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_shows_secret() {
        let c = Credential::new("sk-very-secret");
        assert_eq!(format!("{:?}", c), "Credential([REDACTED])");
    }

    #[test]
    fn test_env_reference_resolves() {
        env::set_var("LLM_ROUTER_TEST_CRED_REF", "abc123");
        let c = resolve_credential("p-test", Some("LLM_ROUTER_TEST_CRED_REF"));
        assert_eq!(c.map(|c| c.expose().to_string()).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_provider_env_fallback() {
        env::set_var("REMOTE_X_API_KEY", "zzz");
        let c = resolve_credential("remote-x", None);
        assert_eq!(c.map(|c| c.expose().to_string()).as_deref(), Some("zzz"));
        assert_eq!(env_name("my.provider"), "MY_PROVIDER_API_KEY");
    }
}
