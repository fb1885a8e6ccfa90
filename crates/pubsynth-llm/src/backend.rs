//! LLM backend trait and concrete implementations.
//!
//! Backends:
//!   GeminiBackend          : Google Gemini `generateContent`
//!   OpenAiCompatibleBackend: any `/v1/chat/completions` endpoint
//!                             (OpenRouter by default, OpenAI, local servers)
//!
//! Status mapping: 5xx replies become `Network` (retried by the caller),
//! every other rejection becomes `Model` carrying the provider's message.

use std::time::Duration;

use async_trait::async_trait;
use pubsynth_common::http::ScopedClient;
use pubsynth_common::{PubsynthError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    /// A single user-turn prompt for `model`.
    pub fn prompt(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            model: Some(model.into()),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse>;
    /// Default model used when a request names none.
    fn model_id(&self) -> &str;
    fn provider(&self) -> &'static str;
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Read the body and map non-2xx replies onto the error taxonomy.
async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;
    let body: serde_json::Value = match serde_json::from_str(&text) {
        Ok(body) => body,
        Err(_) if status >= 400 => serde_json::Value::String(text),
        Err(e) => return Err(PubsynthError::Parse(format!("provider response is not JSON: {e}"))),
    };
    if status >= 400 {
        return Err(PubsynthError::from_status(status, provider_message(&body)));
    }
    Ok(body)
}

fn provider_message(body: &serde_json::Value) -> String {
    body["error"]["message"]
        .as_str()
        .or_else(|| body["message"].as_str())
        .or_else(|| body.as_str())
        .unwrap_or("unknown API error")
        .to_string()
}

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> Result<LlmResponse> {
    // OpenRouter reports upstream failures inside a 200 body.
    if json["error"].is_object() {
        let status = json["error"]["code"].as_u64().map(|c| c as u16);
        let message = provider_message(json);
        return Err(match status {
            Some(s) => PubsynthError::from_status(s, message),
            None => PubsynthError::model(message),
        });
    }
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| PubsynthError::Parse("completion has no choices[0].message.content".to_string()))?;
    Ok(LlmResponse {
        content: content.to_string(),
        model: json["model"].as_str().unwrap_or(fallback_model).to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

// ── 1. Google Gemini ──────────────────────────────────────────────────────────

pub struct GeminiBackend {
    pub model: String,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
    client: ScopedClient,
}

impl GeminiBackend {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: ScopedClient::new()?,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.client.allow_url(base_url)?;
        self.base_url = base_url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Convert chat messages to Gemini's `contents` / `systemInstruction` shape.
fn gemini_body(req: &LlmRequest) -> serde_json::Value {
    let system_text = req.messages.iter()
        .find(|m| m.role == "system")
        .map(|m| m.content.clone());

    let contents: Vec<serde_json::Value> = req.messages.iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            serde_json::json!({
                "role": role,
                "parts": [{ "text": m.content }]
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": req.max_tokens.unwrap_or(2048),
            "temperature":     req.temperature.unwrap_or(0.2),
        }
    });
    if let Some(sys) = system_text {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": sys }] });
    }
    body
}

fn parse_gemini_response(json: &serde_json::Value, model: &str) -> Result<LlmResponse> {
    if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
        return Err(PubsynthError::model(format!("prompt blocked by provider: {reason}")));
    }
    let parts = json["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| PubsynthError::Parse("Gemini response has no candidates".to_string()))?;
    let content: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();

    Ok(LlmResponse {
        content,
        model: model.to_string(),
        prompt_tokens:     json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    })
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse> {
        let model = req.model.as_deref().unwrap_or(&self.model);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let resp = self.client
            .post(&url)?
            .timeout(self.timeout)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&gemini_body(&req))
            .send()
            .await?;
        let json = check_response_status(resp).await?;
        parse_gemini_response(&json, model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn provider(&self) -> &'static str { "gemini" }
}

// ── 2. OpenAI-Compatible (OpenRouter, OpenAI, vLLM, …) ────────────────────────

pub struct OpenAiCompatibleBackend {
    pub base_url: String,
    pub model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    client: ScopedClient,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<SecretString>) -> Result<Self> {
        let mut client = ScopedClient::new()?;
        client.allow_url(base_url)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn openrouter(api_key: SecretString, model: impl Into<String>) -> Result<Self> {
        Self::new(OPENROUTER_BASE_URL, model, Some(api_key))
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k.expose_secret()),
            None    => req,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let model = req.model.as_deref().unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model":    model,
            "messages": req.messages,
        });
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = temperature.into();
        }
        let resp = self.auth(self.client.post(&url)?)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let json = check_response_status(resp).await?;
        parse_openai_response(&json, model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn provider(&self) -> &'static str { "openai_compatible" }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
