//! Exporters for a finished (or cancelled) batch.
//!
//!   csv   : `id,title,analysis`, one row per article in batch order
//!   json  : array of article records with their outcome
//!   bibtex: one `@article` entry per article

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use pubsynth_common::{AnalysisOutcome, AnalysisResult, BatchJob, PubsynthError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Bibtex,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Bibtex => "bib",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Bibtex => "bibtex",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = PubsynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            "bibtex" | "bib" => Ok(ExportFormat::Bibtex),
            other => Err(PubsynthError::InvalidInput(format!(
                "unknown export format '{other}' (expected csv, json or bibtex)"
            ))),
        }
    }
}

/// Write `job` to `out` in `format`.
pub fn export<W: Write>(job: &BatchJob, format: ExportFormat, mut out: W) -> Result<(), ExportError> {
    match format {
        ExportFormat::Csv => write_csv(job, out),
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut out, &json_records(job))?;
            writeln!(out)?;
            Ok(())
        }
        ExportFormat::Bibtex => {
            out.write_all(to_bibtex(job).as_bytes())?;
            Ok(())
        }
    }
}

/// Analysis column text: the analysis itself, or why there is none.
fn analysis_cell(result: Option<&AnalysisResult>) -> String {
    match result.map(|r| &r.outcome) {
        Some(AnalysisOutcome::Success { text }) => text.clone(),
        Some(AnalysisOutcome::Skipped { reason }) => format!("SKIPPED: {reason}"),
        Some(AnalysisOutcome::Failed { error }) => format!("FAILED: {error}"),
        None => String::new(),
    }
}

pub fn write_csv<W: Write>(job: &BatchJob, out: W) -> Result<(), ExportError> {
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    wtr.write_record(["id", "title", "analysis"])?;
    for (article, result) in job.rows() {
        wtr.write_record([article.id.as_str(), article.title.as_str(), analysis_cell(result).as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ExportRecord<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub authors: &'a [String],
    pub journal: Option<&'a str>,
    pub year: Option<&'a str>,
    /// `None` for articles left unresolved by a cancelled batch.
    pub outcome: Option<&'a AnalysisOutcome>,
}

pub fn json_records(job: &BatchJob) -> Vec<ExportRecord<'_>> {
    job.rows()
        .map(|(article, result)| ExportRecord {
            id: &article.id,
            title: &article.title,
            authors: &article.authors,
            journal: article.journal.as_deref(),
            year: article.year.as_deref(),
            outcome: result.map(|r| &r.outcome),
        })
        .collect()
}

/// Braces would unbalance the entry, so they are removed outright.
fn strip_braces(s: &str) -> String {
    s.chars().filter(|c| *c != '{' && *c != '}').collect()
}

pub fn to_bibtex(job: &BatchJob) -> String {
    let mut entries = Vec::with_capacity(job.articles.len());
    for article in &job.articles {
        let mut fields: Vec<(&str, String)> = Vec::new();
        if !article.authors.is_empty() {
            fields.push(("author", article.authors.join(" and ")));
        }
        fields.push(("title", article.title.clone()));
        if let Some(journal) = &article.journal {
            fields.push(("journal", journal.clone()));
        }
        if let Some(year) = &article.year {
            fields.push(("year", year.clone()));
        }
        fields.push(("pmid", article.id.clone()));

        let body: Vec<String> = fields
            .iter()
            .map(|(name, value)| format!("  {} = {{{}}}", name, strip_braces(value)))
            .collect();
        let key: String = strip_braces(&article.id).chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
        entries.push(format!("@article{{pmid{},\n{}\n}}\n", key, body.join(",\n")));
    }
    entries.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{article, bare_article};
    use pubsynth_common::AnalysisResult;

    fn sample_job() -> BatchJob {
        let mut first = article("101", "Sleep {and} memory, revisited", "abs");
        first.authors = vec!["Jane Smith".into(), "K Lee".into()];
        first.journal = Some("J {Sleep} Res".into());
        first.year = Some("2021".into());
        let second = bare_article("102", "No abstract here");
        let third = article("103", "Quota victim", "abs");

        let mut job = BatchJob::new("sleep", vec![first, second, third]);
        job.record(AnalysisResult::success("101", "Line one\nline \"two\""));
        job.record(AnalysisResult::skipped("102", "Missing abstract"));
        job.record(AnalysisResult::failed("103", "Model error [429]: quota"));
        job
    }

    #[test]
    fn test_csv_rows_in_batch_order() {
        let mut out = Vec::new();
        write_csv(&sample_job(), &mut out).unwrap();

        let mut rdr = csv::Reader::from_reader(out.as_slice());
        assert_eq!(rdr.headers().unwrap(), vec!["id", "title", "analysis"]);
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][1], "Sleep {and} memory, revisited");
        assert_eq!(&rows[0][2], "Line one\nline \"two\"");
        assert_eq!(&rows[1][2], "SKIPPED: Missing abstract");
        assert_eq!(&rows[2][2], "FAILED: Model error [429]: quota");
    }

    #[test]
    fn test_json_records_carry_outcome() {
        let mut out = Vec::new();
        export(&sample_job(), ExportFormat::Json, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value.as_array().unwrap().len(), 3);
        assert_eq!(value[0]["authors"][1], "K Lee");
        assert_eq!(value[0]["outcome"]["status"], "success");
        assert_eq!(value[1]["outcome"]["reason"], "Missing abstract");
        assert!(value[1]["journal"].is_null());
    }

    #[test]
    fn test_unresolved_articles_export_empty() {
        let job = BatchJob::new("q", vec![article("1", "Pending", "abs")]);
        assert_eq!(analysis_cell(job.results.get("1")), "");
        assert!(json_records(&job)[0].outcome.is_none());
    }

    #[test]
    fn test_bibtex_strips_braces_and_omits_absent_fields() {
        let bib = to_bibtex(&sample_job());
        let expected_first = "@article{pmid101,\n  author = {Jane Smith and K Lee},\n  title = {Sleep and memory, revisited},\n  journal = {J Sleep Res},\n  year = {2021},\n  pmid = {101}\n}\n";
        assert!(bib.starts_with(expected_first), "{bib}");
        assert!(bib.contains("@article{pmid102,\n  title = {No abstract here},\n  pmid = {102}\n}"));
        assert_eq!(bib.matches("@article{").count(), 3);

        let opens = bib.matches('{').count();
        let closes = bib.matches('}').count();
        assert_eq!(opens, closes);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("bib".parse::<ExportFormat>().unwrap(), ExportFormat::Bibtex);
        assert!("xlsx".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Bibtex.extension(), "bib");
    }
}
