//! Data model shared by the search, generation, and analysis crates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One retrieved bibliographic entry. Immutable once built by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// External record identifier (PMID for PubMed).
    pub id: String,
    pub title: String,
    /// `None` is a valid state: not every publication has a public abstract.
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub year: Option<String>,
}

impl ArticleRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            abstract_text: None,
            authors: Vec::new(),
            journal: None,
            year: None,
        }
    }

    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = Some(text.into());
        self
    }

    /// Abstract text if present and not blank.
    pub fn usable_abstract(&self) -> Option<&str> {
        self.abstract_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Success { text: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl AnalysisOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisOutcome::Success { .. } => "success",
            AnalysisOutcome::Skipped { .. } => "skipped",
            AnalysisOutcome::Failed { .. }  => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisOutcome::Success { .. })
    }
}

/// Outcome of analysing one article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub article_id: String,
    pub outcome: AnalysisOutcome,
}

impl AnalysisResult {
    pub fn success(article_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { article_id: article_id.into(), outcome: AnalysisOutcome::Success { text: text.into() } }
    }

    pub fn skipped(article_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { article_id: article_id.into(), outcome: AnalysisOutcome::Skipped { reason: reason.into() } }
    }

    pub fn failed(article_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self { article_id: article_id.into(), outcome: AnalysisOutcome::Failed { error: error.into() } }
    }
}

/// Unit of work for one orchestrator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJob {
    pub query: String,
    /// Relevance order as returned by the source.
    pub articles: Vec<ArticleRecord>,
    pub results: HashMap<String, AnalysisResult>,
}

impl BatchJob {
    pub fn new(query: impl Into<String>, articles: Vec<ArticleRecord>) -> Self {
        Self { query: query.into(), articles, results: HashMap::new() }
    }

    pub fn record(&mut self, result: AnalysisResult) {
        self.results.insert(result.article_id.clone(), result);
    }

    pub fn is_complete(&self) -> bool {
        self.articles.iter().all(|a| self.results.contains_key(&a.id))
    }

    /// Articles paired with their results, in source order.
    pub fn rows(&self) -> impl Iterator<Item = (&ArticleRecord, Option<&AnalysisResult>)> {
        self.articles.iter().map(|a| (a, self.results.get(&a.id)))
    }

    /// Articles whose analysis succeeded, with the analysis text.
    pub fn successes(&self) -> Vec<(&ArticleRecord, &str)> {
        self.rows()
            .filter_map(|(a, r)| match r.map(|r| &r.outcome) {
                Some(AnalysisOutcome::Success { text }) => Some((a, text.as_str())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_abstract_is_unusable() {
        let a = ArticleRecord::new("1", "T").with_abstract("   ");
        assert_eq!(a.usable_abstract(), None);
        let b = ArticleRecord::new("2", "T").with_abstract(" text ");
        assert_eq!(b.usable_abstract(), Some("text"));
    }

    #[test]
    fn test_outcome_serialises_tagged() {
        let r = AnalysisResult::skipped("42", "Missing abstract");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["outcome"]["status"], "skipped");
        assert_eq!(json["outcome"]["reason"], "Missing abstract");
    }

    #[test]
    fn test_batch_job_completion_and_successes() {
        let mut job = BatchJob::new(
            "q",
            vec![ArticleRecord::new("1", "A"), ArticleRecord::new("2", "B")],
        );
        job.record(AnalysisResult::success("1", "fine"));
        assert!(!job.is_complete());
        job.record(AnalysisResult::failed("2", "Model error: quota"));
        assert!(job.is_complete());

        let successes = job.successes();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].0.id, "1");
        assert_eq!(successes[0].1, "fine");
    }
}
