//! pubsynth-ingestion: Literature retrieval.
//! - Sliding-window rate limiting for the literature database
//! - PubMed E-utilities client (esearch → efetch, esummary)

pub mod rate_limit;
pub mod sources;

pub use rate_limit::SlidingWindowLimiter;
pub use sources::pubmed::{PubMedClient, PubMedSummaries};
pub use sources::LiteratureSource;
