//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi  (JSON id list)
//!   efetch:   https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi   (XML full records)
//!   esummary: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esummary.fcgi (JSON summaries)
//!
//! Every HTTP attempt waits on the shared rate limiter; each logical call is
//! retried on transient failures; whole searches are cached by query.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pubsynth_common::cache::{CacheKey, ResponseCache};
use pubsynth_common::http::ScopedClient as Client;
use pubsynth_common::{ArticleRecord, PubsynthError, Result, RetryPolicy};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::LiteratureSource;
use crate::rate_limit::SlidingWindowLimiter;

pub const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Separator placed between abstract fragments of one record.
pub const ABSTRACT_SEPARATOR: &str = "\n";

pub struct PubMedClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<SlidingWindowLimiter>,
    retry: RetryPolicy,
    cache: Option<Arc<ResponseCache<Vec<ArticleRecord>>>>,
}

impl PubMedClient {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: Client::new()?,
            base_url: EUTILS_BASE_URL.to_string(),
            api_key,
            limiter: Arc::new(SlidingWindowLimiter::pubmed_default()),
            retry: RetryPolicy::default(),
            cache: None,
        })
    }

    /// Point at an E-utilities mirror or proxy.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.client.allow_url(base_url)?;
        self.base_url = base_url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn with_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache<Vec<ArticleRecord>>>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn endpoint(&self, utility: &str) -> String {
        format!("{}/{}.fcgi", self.base_url, utility)
    }

    fn params(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string())];
        params.extend_from_slice(extra);
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// One logical GET: retried as a unit, rate-limited per attempt.
    async fn get_text(&self, call: &'static str, url: &str, params: &[(&'static str, String)]) -> Result<String> {
        let this = self;
        self.retry
            .run(call, move || async move {
                this.limiter.acquire().await;
                let resp = this.client.get(url)?.query(params).send().await?;
                let status = resp.status().as_u16();
                if !resp.status().is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(status_error(status, &body));
                }
                Ok::<_, PubsynthError>(resp.text().await?)
            })
            .await
    }

    /// Resolve up to `max` PMIDs ranked by relevance.
    #[instrument(skip(self))]
    async fn esearch(&self, query: &str, max: usize) -> Result<Vec<String>> {
        let params = self.params(&[
            ("term", query.to_string()),
            ("retmax", max.to_string()),
            ("retmode", "json".to_string()),
            ("sort", "relevance".to_string()),
        ]);
        let body = self.get_text("esearch", &self.endpoint("esearch"), &params).await?;
        let ids = parse_esearch_json(&body)?;
        debug!(?ids, "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    /// Fetch full records (with abstracts) for `pmids` in one call.
    #[instrument(skip(self, pmids), fields(n = pmids.len()))]
    async fn efetch(&self, pmids: &[String]) -> Result<Vec<ArticleRecord>> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }
        let params = self.params(&[
            ("id", pmids.join(",")),
            ("rettype", "abstract".to_string()),
            ("retmode", "xml".to_string()),
        ]);
        let xml = self.get_text("efetch", &self.endpoint("efetch"), &params).await?;
        let records = parse_pubmed_xml(&xml)?;
        Ok(order_by_ids(records, pmids))
    }

    /// Lightweight metadata (no abstracts) for `pmids`, via ESummary JSON.
    #[instrument(skip(self, pmids), fields(n = pmids.len()))]
    pub async fn summaries(&self, pmids: &[String]) -> Result<Vec<ArticleRecord>> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }
        let params = self.params(&[
            ("id", pmids.join(",")),
            ("retmode", "json".to_string()),
        ]);
        let body = self.get_text("esummary", &self.endpoint("esummary"), &params).await?;
        parse_esummary_json(&body)
    }

    /// Search returning summaries only (one esearch + one esummary call).
    pub async fn search_brief(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        let query = validate_query(query)?;
        let pmids = self.esearch(query, max_results).await?;
        self.summaries(&pmids).await
    }

    async fn search_uncached(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        let pmids = self.esearch(query, max_results).await?;
        if pmids.is_empty() {
            info!(query, "PubMed reported zero matches");
            return Ok(vec![]);
        }
        let records = self.efetch(&pmids).await?;
        info!(query, found = records.len(), "PubMed search complete");
        Ok(records)
    }
}

#[async_trait]
impl LiteratureSource for PubMedClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        let query = validate_query(query)?;
        if max_results == 0 {
            return Ok(vec![]);
        }
        match &self.cache {
            Some(cache) => {
                let key = CacheKey::new("search", &format!("{query}\u{1f}{max_results}"), self.name());
                cache.get_or_compute(key, || self.search_uncached(query, max_results)).await
            }
            None => self.search_uncached(query, max_results).await,
        }
    }

    fn name(&self) -> &'static str {
        "pubmed"
    }
}

/// PubMed search that returns ESummary metadata only, no abstracts.
pub struct PubMedSummaries(pub PubMedClient);

#[async_trait]
impl LiteratureSource for PubMedSummaries {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ArticleRecord>> {
        self.0.search_brief(query, max_results).await
    }

    fn name(&self) -> &'static str {
        "pubmed-summary"
    }
}

fn validate_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PubsynthError::InvalidInput("search query is empty".to_string()));
    }
    Ok(query)
}

/// NCBI answers 429 when over its rate limit; that and 5xx are worth retrying.
fn status_error(status: u16, body: &str) -> PubsynthError {
    let snippet: String = body.chars().take(200).collect();
    if status == 429 || status >= 500 {
        PubsynthError::Network(format!("PubMed returned {status}: {snippet}"))
    } else {
        PubsynthError::InvalidInput(format!("PubMed rejected request ({status}): {snippet}"))
    }
}

/// efetch does not promise esearch's order; restore relevance ranking.
fn order_by_ids(mut records: Vec<ArticleRecord>, ids: &[String]) -> Vec<ArticleRecord> {
    let rank: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    records.sort_by_key(|r| rank.get(r.id.as_str()).copied().unwrap_or(usize::MAX));
    records
}

// ── ESearch / ESummary JSON ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

fn parse_esearch_json(body: &str) -> Result<Vec<String>> {
    let resp: ESearchResponse = serde_json::from_str(body)
        .map_err(|e| PubsynthError::Parse(format!("esearch response: {e}")))?;
    if let Some(err) = resp.esearchresult.error {
        if resp.esearchresult.idlist.is_empty() {
            return Err(PubsynthError::Parse(format!("esearch error: {err}")));
        }
    }
    Ok(resp.esearchresult.idlist)
}

#[derive(Debug, Deserialize)]
struct ESummaryResponse {
    result: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DocSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: Vec<SummaryAuthor>,
    fulljournalname: Option<String>,
    source: Option<String>,
    pubdate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryAuthor {
    name: Option<String>,
}

fn parse_esummary_json(body: &str) -> Result<Vec<ArticleRecord>> {
    let mut resp: ESummaryResponse = serde_json::from_str(body)
        .map_err(|e| PubsynthError::Parse(format!("esummary response: {e}")))?;
    let uids: Vec<String> = resp
        .result
        .remove("uids")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| PubsynthError::Parse(format!("esummary uids: {e}")))?
        .unwrap_or_default();

    let mut records = Vec::with_capacity(uids.len());
    for uid in uids {
        let Some(raw) = resp.result.remove(&uid) else {
            warn!(%uid, "esummary listed a uid without a document summary");
            continue;
        };
        let doc: DocSummary = match serde_json::from_value(raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%uid, error = %e, "Skipping malformed document summary");
                continue;
            }
        };
        let title = non_empty(collapse_whitespace(&doc.title)).unwrap_or_else(|| placeholder_title(&uid));
        records.push(ArticleRecord {
            title,
            abstract_text: None,
            authors: doc.authors.into_iter().filter_map(|a| a.name.and_then(non_empty)).collect(),
            journal: doc.fulljournalname.or(doc.source).and_then(non_empty),
            year: doc.pubdate.as_deref().and_then(leading_year),
            id: uid,
        });
    }
    Ok(records)
}

// ── EFetch XML ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordBuilder {
    pmid: Option<String>,
    title: String,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    journal: Option<String>,
    year: Option<String>,
}

impl RecordBuilder {
    fn build(self) -> Option<ArticleRecord> {
        let id = self.pmid?;
        let abstract_text = if self.abstract_parts.is_empty() {
            None
        } else {
            Some(self.abstract_parts.join(ABSTRACT_SEPARATOR))
        };
        Some(ArticleRecord {
            title: non_empty(self.title).unwrap_or_else(|| placeholder_title(&id)),
            abstract_text,
            authors: self.authors,
            journal: self.journal,
            year: self.year,
            id,
        })
    }
}

#[derive(Default)]
struct AuthorBuilder {
    last: Option<String>,
    fore: Option<String>,
    initials: Option<String>,
    collective: Option<String>,
}

impl AuthorBuilder {
    /// `None` when the entry has no usable name element.
    fn display_name(self) -> Option<String> {
        match (self.last, self.collective) {
            (Some(last), _) => match self.fore.or(self.initials) {
                Some(first) => Some(format!("{} {}", first, last)),
                None => Some(last),
            },
            (None, Some(collective)) => Some(collective),
            (None, None) => None,
        }
    }
}

/// Parse efetch XML (`<PubmedArticleSet>`) into article records.
///
/// Element context is tracked with a path stack so that e.g. the `PMID`s
/// inside `CommentsCorrections` never overwrite the record's own PMID.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<ArticleRecord>> {
    if !xml.contains("<PubmedArticleSet") {
        return Err(PubsynthError::Parse("efetch response is not a PubmedArticleSet".to_string()));
    }

    let mut records = Vec::new();
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<RecordBuilder> = None;
    let mut author: Option<AuthorBuilder> = None;
    let mut label: Option<String> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| PubsynthError::Parse(format!("efetch XML at {}: {e}", reader.buffer_position())))?
        {
            Event::Start(ref e) => {
                let name = e.name().as_ref().to_vec();
                let parent = path.last().map(Vec::as_slice);
                match (name.as_slice(), parent) {
                    (b"PubmedArticle", _) => current = Some(RecordBuilder::default()),
                    (b"Author", Some(b"AuthorList")) => author = Some(AuthorBuilder::default()),
                    (b"AbstractText", Some(b"Abstract")) => {
                        label = e
                            .try_get_attribute("Label")
                            .ok()
                            .flatten()
                            .and_then(|a| a.unescape_value().ok())
                            .map(|v| v.trim().to_string())
                            .filter(|v| !v.is_empty());
                        text.clear();
                    }
                    (b"PMID", _) | (b"ArticleTitle", _) | (b"LastName", _) | (b"ForeName", _)
                    | (b"Initials", _) | (b"CollectiveName", _) | (b"Title", _) | (b"Year", _)
                    | (b"MedlineDate", _) => text.clear(),
                    _ => {}
                }
                path.push(name);
            }
            Event::Text(ref e) => {
                let chunk = e
                    .unescape()
                    .map_err(|err| PubsynthError::Parse(format!("efetch XML text: {err}")))?;
                text.push_str(&chunk);
            }
            Event::CData(ref e) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
            // `<br/>` and similar inside an abstract still separate words.
            Event::Empty(_) if path.iter().any(|p| p.as_slice() == b"AbstractText") => text.push(' '),
            Event::End(ref e) => {
                path.pop();
                let parent = path.last().map(Vec::as_slice);
                let value = || collapse_whitespace(&text);
                match (e.name().as_ref(), parent) {
                    (b"PubmedArticle", _) => {
                        match current.take().and_then(RecordBuilder::build) {
                            Some(record) => records.push(record),
                            None => warn!("Skipping PubmedArticle without a PMID"),
                        }
                    }
                    (b"PMID", Some(b"MedlineCitation")) => {
                        if let Some(rec) = current.as_mut() {
                            rec.pmid = non_empty(value());
                        }
                    }
                    (b"ArticleTitle", Some(b"Article")) => {
                        if let Some(rec) = current.as_mut() {
                            rec.title = value();
                        }
                    }
                    (b"AbstractText", Some(b"Abstract")) => {
                        if let (Some(rec), Some(body)) = (current.as_mut(), non_empty(value())) {
                            let part = match label.take() {
                                Some(l) => format!("{}: {}", l, body),
                                None => body,
                            };
                            rec.abstract_parts.push(part);
                        }
                    }
                    (b"LastName", Some(b"Author")) => {
                        if let Some(a) = author.as_mut() { a.last = non_empty(value()); }
                    }
                    (b"ForeName", Some(b"Author")) => {
                        if let Some(a) = author.as_mut() { a.fore = non_empty(value()); }
                    }
                    (b"Initials", Some(b"Author")) => {
                        if let Some(a) = author.as_mut() { a.initials = non_empty(value()); }
                    }
                    (b"CollectiveName", Some(b"Author")) => {
                        if let Some(a) = author.as_mut() { a.collective = non_empty(value()); }
                    }
                    (b"Author", Some(b"AuthorList")) => {
                        if let (Some(rec), Some(a)) = (current.as_mut(), author.take()) {
                            match a.display_name() {
                                Some(name) => rec.authors.push(name),
                                None => debug!("Omitting author entry without a name"),
                            }
                        }
                    }
                    (b"Title", Some(b"Journal")) => {
                        if let Some(rec) = current.as_mut() {
                            rec.journal = non_empty(value());
                        }
                    }
                    (b"Year", Some(b"PubDate")) => {
                        if let Some(rec) = current.as_mut() {
                            rec.year = non_empty(value());
                        }
                    }
                    (b"MedlineDate", Some(b"PubDate")) => {
                        if let Some(rec) = current.as_mut() {
                            if rec.year.is_none() {
                                rec.year = leading_year(&value());
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(PubsynthError::Parse("efetch XML ended inside an element".to_string()));
    }
    Ok(records)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}

fn placeholder_title(id: &str) -> String {
    format!("PMID: {}", id)
}

/// First run of four digits, e.g. "1998 Dec-1999 Jan" -> "1998".
fn leading_year(date: &str) -> Option<String> {
    let bytes = date.as_bytes();
    bytes
        .windows(4)
        .position(|w| w.iter().all(u8::is_ascii_digit))
        .map(|i| date[i..i + 4].to_string())
}
