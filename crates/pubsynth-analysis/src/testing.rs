//! In-process fakes for the search and generation providers.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pubsynth_common::{ArticleRecord, PubsynthError, Result};
use pubsynth_ingestion::LiteratureSource;
use pubsynth_llm::{GenerationClient, LlmBackend, LlmRequest, LlmResponse};
use tokio::time::Instant;

pub fn article(id: &str, title: &str, abstract_text: &str) -> ArticleRecord {
    ArticleRecord::new(id, title).with_abstract(abstract_text)
}

pub fn bare_article(id: &str, title: &str) -> ArticleRecord {
    ArticleRecord::new(id, title)
}

pub fn generation_client(backend: &Arc<FakeBackend>) -> Arc<GenerationClient> {
    let backend: Arc<dyn LlmBackend> = backend.clone();
    Arc::new(GenerationClient::new(backend))
}

/// Echoing backend that records every call.
#[derive(Default)]
pub struct FakeBackend {
    calls: AtomicU32,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub call_times: Mutex<Vec<Instant>>,
    pub prompts: Mutex<Vec<String>>,
    latency: Duration,
    /// Articles with this title are rejected with a quota error.
    fail_title: Option<String>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self { latency, ..Self::default() })
    }

    pub fn failing_on(title: &str) -> Arc<Self> {
        Arc::new(Self { fail_title: Some(title.to_string()), ..Self::default() })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for FakeBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.call_times.lock().unwrap().push(Instant::now());
        self.prompts.lock().unwrap().push(prompt.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(title) = &self.fail_title {
            if prompt.contains(&format!("Title: {title}\n")) {
                return Err(PubsynthError::from_status(429, "quota exceeded"));
            }
        }
        let model = req.model.unwrap_or_else(|| "fake-model".to_string());
        Ok(LlmResponse {
            content: format!("[{}] {} chars analysed", model, prompt.len()),
            model,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }

    fn model_id(&self) -> &str { "fake-model" }
    fn provider(&self) -> &'static str { "fake" }
}

/// Source returning a fixed result set.
pub struct FakeSource {
    calls: AtomicU32,
    reply: Result<Vec<ArticleRecord>>,
}

impl FakeSource {
    pub fn returning(articles: Vec<ArticleRecord>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), reply: Ok(articles) })
    }

    pub fn failing(error: PubsynthError) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), reply: Err(error) })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiteratureSource for FakeSource {
    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map(|mut articles| {
            articles.truncate(max_results);
            articles
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
