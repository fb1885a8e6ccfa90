use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::error::PubsynthError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client that only talks to approved hosts.
/// Every outbound call in the workspace goes through one of these.
#[derive(Debug, Clone)]
pub struct ScopedClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl ScopedClient {
    /// Client allowing the literature database and the supported LLM providers.
    pub fn new() -> Result<Self, PubsynthError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, PubsynthError> {
        let domains = [
            "eutils.ncbi.nlm.nih.gov",           // PubMed
            "generativelanguage.googleapis.com", // Gemini
            "openrouter.ai",                     // OpenRouter
            "api.openai.com",                    // OpenAI
            "localhost",
            "127.0.0.1",
        ];

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("pubsynth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PubsynthError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            allowlist: domains.iter().map(|d| d.to_string()).collect(),
        })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Allow the host of `url` (used for configured base URLs).
    pub fn allow_url(&mut self, url: &str) -> Result<(), PubsynthError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .ok_or_else(|| PubsynthError::Config(format!("Invalid base URL: {}", url)))?;
        self.allowlist.insert(host);
        Ok(())
    }

    /// Exact match, or a subdomain of an allowed domain.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        let Some(host) = parsed.host_str() else { return false };
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
    }

    fn check(&self, url: &str) -> Result<(), PubsynthError> {
        if self.is_allowed(url) {
            Ok(())
        } else {
            Err(PubsynthError::Config(format!("Host not in allowlist for URL {}", url)))
        }
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, PubsynthError> {
        self.check(url)?;
        Ok(self.client.get(url))
    }

    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, PubsynthError> {
        self.check(url)?;
        Ok(self.client.post(url))
    }
}
