//! Configuration loading for Pubsynth.
//! Reads pubsynth.toml from `--config`, the PUBSYNTH_CONFIG env var, or the
//! current directory. A missing file means built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pubsynth_analysis::Schedule;
use pubsynth_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pubmed: PubMedConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubMedConfig {
    #[serde(default = "default_eutils_url")]
    pub base_url: String,
    /// Environment variable holding an optional NCBI API key.
    #[serde(default = "default_ncbi_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_eutils_url()          -> String { pubsynth_ingestion::sources::pubmed::EUTILS_BASE_URL.to_string() }
fn default_ncbi_key_env()        -> String { "NCBI_API_KEY".to_string() }
fn default_requests_per_window() -> usize  { 3 }
fn default_window_ms()           -> u64    { 1000 }
fn default_max_results()         -> usize  { 10 }

impl Default for PubMedConfig {
    fn default() -> Self {
        Self {
            base_url: default_eutils_url(),
            api_key_env: default_ncbi_key_env(),
            requests_per_window: default_requests_per_window(),
            window_ms: default_window_ms(),
            max_results: default_max_results(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gemini,
    #[default]
    Openrouter,
    OpenaiCompatible,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini-1.5-flash",
            Provider::Openrouter => "mistralai/mistral-7b-instruct:free",
            Provider::OpenaiCompatible => "gpt-4o-mini",
        }
    }

    pub fn default_key_env(&self) -> &'static str {
        match self {
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Openrouter | Provider::OpenaiCompatible => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Provider,
    /// Falls back to the provider's default model.
    pub model: Option<String>,
    /// Required for `openai_compatible`; overrides the endpoint otherwise.
    pub base_url: Option<String>,
    /// Falls back to the provider's conventional variable.
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 { 60 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(self.provider.default_model())
    }

    pub fn key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or(self.provider.default_key_env())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts()       -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms()     -> u64 { 4000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_generation_ttl_hours")]
    pub generation_ttl_hours: u64,
    #[serde(default = "default_search_ttl_hours")]
    pub search_ttl_hours: u64,
}

fn bool_true()                    -> bool { true }
fn default_generation_ttl_hours() -> u64  { 168 }
fn default_search_ttl_hours()     -> u64  { 24 }

/// Ten years; longer lifetimes are rejected at load time.
pub const MAX_TTL_HOURS: u64 = 87_600;

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: bool_true(),
            generation_ttl_hours: default_generation_ttl_hours(),
            search_ttl_hours: default_search_ttl_hours(),
        }
    }
}

impl CacheConfig {
    pub fn generation_ttl(&self) -> Duration {
        Duration::from_secs(self.generation_ttl_hours.saturating_mul(3600))
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub mode: BatchMode,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_concurrency() -> usize { 5 }
fn default_delay_ms()    -> u64   { 500 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            concurrency: default_concurrency(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl BatchConfig {
    pub fn schedule(&self) -> Schedule {
        match self.mode {
            BatchMode::Parallel => Schedule::parallel(self.concurrency),
            BatchMode::Sequential => Schedule::sequential(Duration::from_millis(self.delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_path")]
    pub path: PathBuf,
}

fn default_secrets_path() -> PathBuf { PathBuf::from("secrets.toml") }

impl Default for SecretsConfig {
    fn default() -> Self {
        Self { path: default_secrets_path() }
    }
}


impl Config {
    /// Load configuration from pubsynth.toml.
    /// An explicit path must exist; the implicit locations may be absent.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => (
                std::env::var("PUBSYNTH_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("pubsynth.toml")),
                false,
            ),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        info!(path = %path.display(), provider = ?config.llm.provider, "Configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.llm.provider == Provider::OpenaiCompatible && self.llm.base_url.is_none() {
            anyhow::bail!("llm.base_url is required for provider \"openai_compatible\"");
        }
        if self.pubmed.window_ms == 0 {
            anyhow::bail!("pubmed.window_ms must be greater than zero");
        }
        for (name, hours) in [
            ("cache.generation_ttl_hours", self.cache.generation_ttl_hours),
            ("cache.search_ttl_hours", self.cache.search_ttl_hours),
        ] {
            if hours > MAX_TTL_HOURS {
                anyhow::bail!("{name} must be at most {MAX_TTL_HOURS}, got {hours}");
            }
        }
        Ok(())
    }
}
