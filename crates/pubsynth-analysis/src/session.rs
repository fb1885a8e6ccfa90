//! End-to-end research session: search, then analyse every hit.

use std::sync::Arc;

use pubsynth_common::{ArticleRecord, PubsynthError, Result};
use pubsynth_ingestion::LiteratureSource;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::orchestrator::{BatchAnalyzer, BatchEvent, BatchHandle, BatchReport};

/// Search `source` without analysing. A malformed database response counts
/// as zero results; every other failure is returned.
#[instrument(skip(source), fields(source = source.name()))]
pub async fn search_source(source: &dyn LiteratureSource, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PubsynthError::InvalidInput("search query is empty".to_string()));
    }
    match source.search(query, max_results).await {
        Ok(articles) => {
            info!(found = articles.len(), "search complete");
            Ok(articles)
        }
        Err(PubsynthError::Parse(detail)) => {
            warn!(call = "search", error = %detail, "unreadable search response, treating as no results");
            Ok(Vec::new())
        }
        Err(e) => {
            warn!(call = "search", error = %e, "search failed");
            Err(e)
        }
    }
}

pub struct ResearchSession {
    source: Arc<dyn LiteratureSource>,
    analyzer: BatchAnalyzer,
}

impl ResearchSession {
    pub fn new(source: Arc<dyn LiteratureSource>, analyzer: BatchAnalyzer) -> Self {
        Self { source, analyzer }
    }

    pub fn analyzer(&self) -> &BatchAnalyzer {
        &self.analyzer
    }

    /// Search only. A malformed database response counts as zero results.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        search_source(self.source.as_ref(), query, max_results).await
    }

    /// Search, then analyse the results, waiting for the whole batch.
    pub async fn run(
        &self,
        query: &str,
        max_results: usize,
        events: Option<mpsc::UnboundedSender<BatchEvent>>,
    ) -> Result<BatchReport> {
        let articles = self.search(query, max_results).await?;
        Ok(self.analyzer.analyze_batch(query.trim(), articles, events).await)
    }

    /// Search, then analyse the results in the background.
    pub async fn start(&self, query: &str, max_results: usize) -> Result<BatchHandle> {
        let articles = self.search(query, max_results).await?;
        Ok(self.analyzer.spawn(query.trim(), articles))
    }
}
