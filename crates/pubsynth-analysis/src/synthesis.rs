//! Cross-article synthesis: research gaps, literature review, themes, and
//! research proposals. Each task is a single generation call through the
//! same retried, cached client used for per-article analysis.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use pubsynth_common::{BatchJob, PubsynthError, Result};
use pubsynth_llm::prompts::{self, ProposalSection};
use pubsynth_llm::GenerationClient;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisTask {
    Gaps,
    Review,
    Themes,
}

impl fmt::Display for SynthesisTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SynthesisTask::Gaps => "gaps",
            SynthesisTask::Review => "review",
            SynthesisTask::Themes => "themes",
        })
    }
}

impl FromStr for SynthesisTask {
    type Err = PubsynthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaps" | "research_gaps" => Ok(SynthesisTask::Gaps),
            "review" | "literature_review" => Ok(SynthesisTask::Review),
            "themes" | "thematic_analysis" => Ok(SynthesisTask::Themes),
            other => Err(PubsynthError::InvalidInput(format!(
                "unknown synthesis task '{other}' (expected gaps, review or themes)"
            ))),
        }
    }
}

pub struct Synthesizer {
    client: Arc<GenerationClient>,
    model: String,
}

impl Synthesizer {
    pub fn new(client: Arc<GenerationClient>) -> Self {
        let model = client.default_model().to_string();
        Self { client, model }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Synthesise over the successful analyses in `job`.
    #[instrument(skip(self, job), fields(topic = %job.query))]
    pub async fn run(&self, task: SynthesisTask, job: &BatchJob) -> Result<String> {
        let successes = job.successes();
        if successes.is_empty() {
            return Err(PubsynthError::InvalidInput(format!(
                "no successful analyses to synthesise ({task})"
            )));
        }
        let prompt = match task {
            SynthesisTask::Gaps => prompts::research_gaps(&job.query, &successes),
            SynthesisTask::Review => prompts::literature_review(&job.query, &successes),
            SynthesisTask::Themes => prompts::thematic_analysis(&job.query, &successes),
        };
        info!(%task, articles = successes.len(), "running synthesis");
        self.client.generate(&prompt, &self.model).await
    }

    pub async fn research_gaps(&self, job: &BatchJob) -> Result<String> {
        self.run(SynthesisTask::Gaps, job).await
    }

    pub async fn literature_review(&self, job: &BatchJob) -> Result<String> {
        self.run(SynthesisTask::Review, job).await
    }

    pub async fn thematic_analysis(&self, job: &BatchJob) -> Result<String> {
        self.run(SynthesisTask::Themes, job).await
    }

    #[instrument(skip(self, sections), fields(sections = sections.len()))]
    pub async fn proposal(&self, topic: &str, sections: &[ProposalSection]) -> Result<String> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PubsynthError::InvalidInput("proposal topic is empty".to_string()));
        }
        if sections.is_empty() {
            return Err(PubsynthError::InvalidInput("proposal needs at least one section".to_string()));
        }
        self.client.generate(&prompts::proposal(topic, sections), &self.model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{article, generation_client, FakeBackend};
    use pubsynth_common::AnalysisResult;

    fn job_with(results: Vec<AnalysisResult>) -> BatchJob {
        let articles = results.iter().map(|r| article(&r.article_id, "T", "a")).collect();
        let mut job = BatchJob::new("sleep and memory", articles);
        for r in results {
            job.record(r);
        }
        job
    }

    #[tokio::test]
    async fn test_synthesis_uses_only_successes() {
        let backend = FakeBackend::new();
        let synth = Synthesizer::new(generation_client(&backend));
        let job = job_with(vec![
            AnalysisResult::success("1", "finding about REM"),
            AnalysisResult::failed("2", "Model error [429]: quota"),
        ]);

        synth.research_gaps(&job).await.unwrap();
        let prompts = backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("finding about REM"));
        assert!(!prompts[0].contains("quota"));
        assert!(prompts[0].contains("\"sleep and memory\""));
    }

    #[tokio::test]
    async fn test_zero_successes_makes_no_call() {
        let backend = FakeBackend::new();
        let synth = Synthesizer::new(generation_client(&backend));
        let job = job_with(vec![AnalysisResult::skipped("1", "Missing abstract")]);

        for task in [SynthesisTask::Gaps, SynthesisTask::Review, SynthesisTask::Themes] {
            assert!(matches!(synth.run(task, &job).await, Err(PubsynthError::InvalidInput(_))));
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_proposal_validation() {
        let backend = FakeBackend::new();
        let synth = Synthesizer::new(generation_client(&backend)).with_model("m2");

        assert!(synth.proposal(" ", &[ProposalSection::new("Aims")]).await.is_err());
        assert!(synth.proposal("topic", &[]).await.is_err());
        assert_eq!(backend.calls(), 0);

        let text = synth.proposal("topic", &[ProposalSection::new("Aims")]).await.unwrap();
        assert!(text.starts_with("[m2]"));
    }

    #[test]
    fn test_task_parsing() {
        assert_eq!("gaps".parse::<SynthesisTask>().unwrap(), SynthesisTask::Gaps);
        assert_eq!("Literature_Review".parse::<SynthesisTask>().unwrap(), SynthesisTask::Review);
        assert!("summary".parse::<SynthesisTask>().is_err());
        assert_eq!(SynthesisTask::Themes.to_string(), "themes");
    }
}
