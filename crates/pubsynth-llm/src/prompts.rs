//! Prompt templates. Every prompt is a pure function of its inputs so that
//! identical requests share a cache entry.

use std::fmt::Write as _;
use std::str::FromStr;

use pubsynth_common::{ArticleRecord, PubsynthError};

pub const DEFAULT_SECTION_INSTRUCTIONS: &str = "Generate standard academic content for this section.";

/// Per-article analysis. Embeds only this article's title and abstract.
pub fn article_analysis(topic: &str, title: &str, abstract_text: &str) -> String {
    format!(
        "You are a research assistant reviewing literature on \"{topic}\".\n\
         Analyse the following article abstract. Summarise its objective, methods, \
         key findings and limitations, then state how it relates to the topic.\n\n\
         Title: {title}\n\
         Abstract: {abstract_text}\n"
    )
}

/// Numbered digest of analysed articles shared by the synthesis prompts.
fn evidence_block(analyses: &[(&ArticleRecord, &str)]) -> String {
    let mut out = String::new();
    for (i, (article, analysis)) in analyses.iter().enumerate() {
        let _ = write!(out, "[{}] {} (PMID {}", i + 1, article.title, article.id);
        if let Some(year) = &article.year {
            let _ = write!(out, ", {}", year);
        }
        let _ = writeln!(out, ")\n{}\n", analysis.trim());
    }
    out
}

pub fn research_gaps(topic: &str, analyses: &[(&ArticleRecord, &str)]) -> String {
    format!(
        "You are a research strategist. Based on the article analyses below on \"{topic}\", \
         identify the open research gaps: unanswered questions, under-studied populations, \
         methodological weaknesses and contradictory findings. Cite articles by their \
         bracketed number.\n\n{}",
        evidence_block(analyses)
    )
}

pub fn literature_review(topic: &str, analyses: &[(&ArticleRecord, &str)]) -> String {
    format!(
        "You are an academic writer. Draft a structured literature review on \"{topic}\" \
         using only the article analyses below. Organise it into an introduction, \
         thematic body sections and a conclusion, citing articles by their bracketed \
         number. Use Markdown headings.\n\n{}",
        evidence_block(analyses)
    )
}

pub fn thematic_analysis(topic: &str, analyses: &[(&ArticleRecord, &str)]) -> String {
    format!(
        "You are a qualitative researcher. Group the article analyses below on \"{topic}\" \
         into recurring themes. For each theme give a short name, a description and the \
         bracketed numbers of the supporting articles.\n\n{}",
        evidence_block(analyses)
    )
}

/// One requested proposal section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSection {
    pub title: String,
    pub instructions: Option<String>,
}

impl ProposalSection {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), instructions: None }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn instructions_or_default(&self) -> &str {
        self.instructions.as_deref().unwrap_or(DEFAULT_SECTION_INSTRUCTIONS)
    }
}

/// Parses `Title` or `Title:instructions`.
impl FromStr for ProposalSection {
    type Err = PubsynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (title, instructions) = match s.split_once(':') {
            Some((t, i)) => (t.trim(), Some(i.trim()).filter(|i| !i.is_empty())),
            None => (s.trim(), None),
        };
        if title.is_empty() {
            return Err(PubsynthError::InvalidInput(format!("proposal section has no title: {s:?}")));
        }
        Ok(Self {
            title: title.to_string(),
            instructions: instructions.map(str::to_string),
        })
    }
}

pub fn proposal(topic: &str, sections: &[ProposalSection]) -> String {
    let sections: Vec<String> = sections
        .iter()
        .map(|s| format!("- Section \"{}\": {}", s.title, s.instructions_or_default()))
        .collect();
    format!(
        "You are a professional academic writer. Your task is to write a detailed research proposal.\n\
         The main topic is: \"{topic}\".\n\
         The proposal must strictly follow this structure and instructions:\n\
         {}\n\n\
         Generate the content for each section. The output should be well-structured and academic. \
         Use Markdown for formatting (# for the main title, ## for section titles). \
         Start with the main title of the proposal.",
        sections.join("\n")
    )
}
