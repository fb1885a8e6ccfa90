//! API key resolution.
//!
//! Precedence: a key passed on the command line, then the local secret
//! store (secrets.toml), then the environment. Empty values count as unset.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use pubsynth_common::PubsynthError;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Runtime,
    SecretStore,
    Environment(String),
    Missing,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Runtime => f.write_str("command line"),
            CredentialSource::SecretStore => f.write_str("secret store"),
            CredentialSource::Environment(var) => write!(f, "environment ({var})"),
            CredentialSource::Missing => f.write_str("not configured"),
        }
    }
}

pub struct ResolvedKey {
    pub key: Option<SecretString>,
    pub source: CredentialSource,
}

/// Keys read from secrets.toml, indexed by lowercased variable name:
///
/// ```toml
/// openai_api_key = "sk-..."
/// gemini_api_key = "..."
/// ```
#[derive(Default)]
pub struct SecretStore {
    entries: HashMap<String, String>,
}

impl SecretStore {
    /// A missing file is an empty store.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no secret store");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid secret store {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, String> = toml::from_str(content)?;
        let entries = raw.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
        Ok(Self { entries })
    }

    pub fn get(&self, env_var: &str) -> Option<&str> {
        self.entries
            .get(&env_var.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

pub fn resolve(runtime: Option<&str>, store: &SecretStore, env_var: &str) -> ResolvedKey {
    resolve_with(runtime, store, env_var, |name| std::env::var(name).ok())
}

pub fn resolve_with(
    runtime: Option<&str>,
    store: &SecretStore,
    env_var: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> ResolvedKey {
    let found = |key: &str, source| ResolvedKey {
        key: Some(SecretString::from(key.trim().to_string())),
        source,
    };

    if let Some(key) = runtime.filter(|k| !k.trim().is_empty()) {
        return found(key, CredentialSource::Runtime);
    }
    if let Some(key) = store.get(env_var) {
        return found(key, CredentialSource::SecretStore);
    }
    if let Some(key) = lookup(env_var).filter(|k| !k.trim().is_empty()) {
        return found(key.as_str(), CredentialSource::Environment(env_var.to_string()));
    }
    ResolvedKey { key: None, source: CredentialSource::Missing }
}

/// Every key the process needs, resolved once at start-up.
pub struct Credentials {
    pub llm: ResolvedKey,
    pub llm_env: String,
    pub ncbi: ResolvedKey,
}

impl Credentials {
    /// `runtime_key` (from `--api-key`) applies to the generation provider only.
    pub fn resolve(config: &Config, runtime_key: Option<&str>) -> anyhow::Result<Self> {
        let store = SecretStore::load(&config.secrets.path)?;
        let llm_env = config.llm.key_env().to_string();
        let llm = resolve(runtime_key, &store, &llm_env);
        let ncbi = resolve(None, &store, &config.pubmed.api_key_env);
        info!(llm_key = %llm.source, ncbi_key = %ncbi.source, "credentials resolved");
        Ok(Self { llm, llm_env, ncbi })
    }

    /// The generation key, or the "not configured" error naming where to set it.
    pub fn llm_key(&self) -> anyhow::Result<SecretString> {
        let key = self.llm.key.as_ref().map(|k| SecretString::from(k.expose_secret().to_string()));
        key.ok_or_else(|| {
            PubsynthError::Config(format!(
                "LLM API key not configured: pass --api-key, add {} to the secret store, or set {}",
                self.llm_env.to_ascii_lowercase(),
                self.llm_env
            ))
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| pairs.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_runtime_key_wins() {
        let store = SecretStore::parse("openai_api_key = \"stored\"").unwrap();
        let resolved = resolve_with(Some("cli"), &store, "OPENAI_API_KEY", env(&[("OPENAI_API_KEY", "env")]));
        assert_eq!(resolved.source, CredentialSource::Runtime);
        assert_eq!(resolved.key.unwrap().expose_secret(), "cli");
    }

    #[test]
    fn test_store_beats_environment() {
        let store = SecretStore::parse("OPENAI_API_KEY = \"stored\"").unwrap();
        let resolved = resolve_with(None, &store, "OPENAI_API_KEY", env(&[("OPENAI_API_KEY", "env")]));
        assert_eq!(resolved.source, CredentialSource::SecretStore);
        assert_eq!(resolved.key.unwrap().expose_secret(), "stored");
    }

    #[test]
    fn test_empty_values_fall_through() {
        let store = SecretStore::parse("gemini_api_key = \"\"").unwrap();
        let resolved = resolve_with(Some("  "), &store, "GEMINI_API_KEY", env(&[("GEMINI_API_KEY", "env")]));
        assert_eq!(resolved.source, CredentialSource::Environment("GEMINI_API_KEY".to_string()));

        let resolved = resolve_with(None, &store, "GEMINI_API_KEY", env(&[("GEMINI_API_KEY", "")]));
        assert_eq!(resolved.source, CredentialSource::Missing);
        assert!(resolved.key.is_none());
        assert_eq!(resolved.source.to_string(), "not configured");
    }

    #[test]
    fn test_missing_store_file_is_empty() {
        let store = SecretStore::load(Path::new("/nonexistent/secrets.toml")).unwrap();
        assert!(store.get("OPENAI_API_KEY").is_none());
    }

    #[test]
    fn test_missing_llm_key_names_the_variable() {
        let creds = Credentials {
            llm: ResolvedKey { key: None, source: CredentialSource::Missing },
            llm_env: "GEMINI_API_KEY".to_string(),
            ncbi: ResolvedKey { key: None, source: CredentialSource::Missing },
        };
        let err = creds.llm_key().unwrap_err();
        assert!(matches!(err.downcast_ref::<PubsynthError>(), Some(PubsynthError::Config(_))));
        let err = err.to_string();
        assert!(err.contains("not configured"));
        assert!(err.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_malformed_store_is_an_error() {
        assert!(SecretStore::parse("openai_api_key = 42").is_err());
    }
}
