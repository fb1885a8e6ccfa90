//! Literature source clients.

pub mod pubmed;

use async_trait::async_trait;
use pubsynth_common::{ArticleRecord, Result};

/// Common interface for literature source clients.
#[async_trait]
pub trait LiteratureSource: Send + Sync {
    /// Search for articles matching a query, most relevant first.
    /// Zero matches is an empty list, not an error.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>>;

    /// Short name used in logs and cache keys.
    fn name(&self) -> &'static str;
}
