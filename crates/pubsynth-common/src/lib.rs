//! pubsynth-common: Shared types, errors, and call wrappers used across all Pubsynth crates.

pub mod cache;
pub mod error;
pub mod http;
pub mod models;
pub mod retry;

// Re-export commonly used types
pub use cache::{CacheKey, ResponseCache};
pub use error::{PubsynthError, Result};
pub use models::{AnalysisOutcome, AnalysisResult, ArticleRecord, BatchJob};
pub use retry::RetryPolicy;
