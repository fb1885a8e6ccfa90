//! pubsynth-analysis: Batch analysis of search results.
//!
//! The orchestrator fans out one generation call per article; the session
//! ties search to analysis; synthesis and export work on finished batches.

pub mod export;
pub mod orchestrator;
pub mod session;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod testing;

pub use export::{ExportError, ExportFormat};
pub use orchestrator::{BatchAnalyzer, BatchEvent, BatchHandle, BatchReport, Progress, Schedule};
pub use session::{search_source, ResearchSession};
pub use synthesis::{SynthesisTask, Synthesizer};
