//! Batch analysis orchestrator.
//!
//! Drives one generation call per article:
//!   1. Collapse duplicate article ids (first occurrence wins)
//!   2. Resolve articles without an abstract as `Skipped` with no call
//!   3. Dispatch the rest in parallel (bounded) or sequentially (fixed delay)
//!   4. Convert every per-item error into a `Failed` result
//!   5. Emit progress events as items resolve; `Finished` exactly once
//!
//! Generation calls run in spawned tasks. Cancelling a batch stops dispatch
//! immediately; calls already in flight finish on their own and their
//! results are dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use pubsynth_common::{AnalysisOutcome, AnalysisResult, ArticleRecord, BatchJob};
use pubsynth_llm::{prompts, GenerationClient};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const MISSING_ABSTRACT: &str = "Missing abstract";
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_SEQUENTIAL_DELAY: Duration = Duration::from_millis(500);

// ── Scheduling ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Up to `concurrency` generation calls in flight at once.
    Parallel { concurrency: usize },
    /// One call at a time with `delay` between consecutive calls.
    Sequential { delay: Duration },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Parallel { concurrency: DEFAULT_CONCURRENCY }
    }
}

impl Schedule {
    pub fn parallel(concurrency: usize) -> Self {
        Schedule::Parallel { concurrency: concurrency.max(1) }
    }

    pub fn sequential(delay: Duration) -> Self {
        Schedule::Sequential { delay }
    }

    fn normalised(self) -> Self {
        match self {
            Schedule::Parallel { concurrency } => Schedule::parallel(concurrency),
            other => other,
        }
    }
}

// ── Progress events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started { job_id: Uuid, total: usize },
    ItemCompleted { result: AnalysisResult, progress: Progress },
    Finished { progress: Progress, cancelled: bool },
}

// ── Result summary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub job: BatchJob,
    /// Set when the caller abandoned the batch; `job.results` then holds
    /// only the items resolved before cancellation.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&AnalysisOutcome) -> bool) -> usize {
        self.job.results.values().filter(|r| pred(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, AnalysisOutcome::Success { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, AnalysisOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AnalysisOutcome::Failed { .. }))
    }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancels the batch when the owning handle goes away.
struct CancelOnDrop(Arc<CancelToken>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A batch running in the background.
pub struct BatchHandle {
    job_id: Uuid,
    total: usize,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    completed: Arc<AtomicUsize>,
    guard: CancelOnDrop,
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn progress(&self) -> Progress {
        Progress { completed: self.completed.load(Ordering::SeqCst), total: self.total }
    }

    /// Next progress event; `None` once the batch has finished.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Stop dispatching new items. In-flight calls are not aborted.
    pub fn cancel(&self) {
        info!(job_id = %self.job_id, "batch cancellation requested");
        self.guard.0.cancel();
    }

    /// Wait for the batch to finish and return its report.
    pub async fn join(self) -> Result<BatchReport, JoinError> {
        let BatchHandle { task, guard, .. } = self;
        let report = task.await;
        drop(guard);
        report
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

struct BatchRun {
    job: BatchJob,
    total: usize,
    completed: Arc<AtomicUsize>,
    events: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl BatchRun {
    fn progress(&self) -> Progress {
        Progress { completed: self.completed.load(Ordering::SeqCst), total: self.total }
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn record(&mut self, result: AnalysisResult) {
        self.job.record(result.clone());
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            article_id = %result.article_id,
            status = result.outcome.as_str(),
            completed,
            total = self.total,
            "article resolved"
        );
        self.emit(BatchEvent::ItemCompleted {
            result,
            progress: Progress { completed, total: self.total },
        });
    }
}

#[derive(Clone)]
pub struct BatchAnalyzer {
    client: Arc<GenerationClient>,
    model: String,
    schedule: Schedule,
}

impl BatchAnalyzer {
    /// Analyzer using the client's default model and the default schedule.
    pub fn new(client: Arc<GenerationClient>) -> Self {
        let model = client.default_model().to_string();
        Self { client, model, schedule: Schedule::default() }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule.normalised();
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn client(&self) -> &Arc<GenerationClient> {
        &self.client
    }

    /// Analyse `articles` for `query` and wait for every item to resolve.
    /// Progress events are sent on `events` if provided.
    pub async fn analyze_batch(
        &self,
        query: &str,
        articles: Vec<ArticleRecord>,
        events: Option<mpsc::UnboundedSender<BatchEvent>>,
    ) -> BatchReport {
        let articles = dedupe(articles);
        let cancel = Arc::new(CancelToken::default());
        let completed = Arc::new(AtomicUsize::new(0));
        self.run(Uuid::new_v4(), query.to_string(), articles, events, cancel, completed).await
    }

    /// Run the batch in the background.
    pub fn spawn(&self, query: impl Into<String>, articles: Vec<ArticleRecord>) -> BatchHandle {
        let articles = dedupe(articles);
        let job_id = Uuid::new_v4();
        let total = articles.len();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(CancelToken::default());
        let completed = Arc::new(AtomicUsize::new(0));

        let this = self.clone();
        let query = query.into();
        let task = tokio::spawn({
            let cancel = Arc::clone(&cancel);
            let completed = Arc::clone(&completed);
            async move { this.run(job_id, query, articles, Some(tx), cancel, completed).await }
        });

        BatchHandle { job_id, total, events: rx, completed, guard: CancelOnDrop(cancel), task }
    }

    #[instrument(skip_all, fields(job_id = %job_id, total = articles.len()))]
    async fn run(
        &self,
        job_id: Uuid,
        query: String,
        articles: Vec<ArticleRecord>,
        events: Option<mpsc::UnboundedSender<BatchEvent>>,
        cancel: Arc<CancelToken>,
        completed: Arc<AtomicUsize>,
    ) -> BatchReport {
        let started_at = Utc::now();
        let t0 = tokio::time::Instant::now();
        let total = articles.len();
        info!(query = %query, total, schedule = ?self.schedule, model = %self.model, "Starting batch analysis");

        let mut batch = BatchRun {
            job: BatchJob::new(query, articles.clone()),
            total,
            completed,
            events,
        };
        batch.emit(BatchEvent::Started { job_id, total });

        let (pending, missing): (Vec<_>, Vec<_>) =
            articles.into_iter().partition(|a| a.usable_abstract().is_some());
        for article in missing {
            debug!(article_id = %article.id, "no abstract, skipping generation");
            batch.record(AnalysisResult::skipped(article.id, MISSING_ABSTRACT));
        }

        let cancelled = match self.schedule {
            Schedule::Parallel { concurrency } => {
                self.dispatch_parallel(pending, concurrency, &mut batch, &cancel).await
            }
            Schedule::Sequential { delay } => {
                self.dispatch_sequential(pending, delay, &mut batch, &cancel).await
            }
        };

        let progress = batch.progress();
        batch.emit(BatchEvent::Finished { progress, cancelled });

        let report = BatchReport {
            job_id,
            job: batch.job,
            cancelled,
            started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
        };
        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            cancelled,
            duration_ms = report.duration_ms,
            "Batch analysis finished"
        );
        report
    }

    /// Returns `true` if the batch was cancelled before every item resolved.
    async fn dispatch_parallel(
        &self,
        pending: Vec<ArticleRecord>,
        concurrency: usize,
        batch: &mut BatchRun,
        cancel: &CancelToken,
    ) -> bool {
        let topic = batch.job.query.clone();
        let mut in_flight = stream::iter(pending)
            .map(|article| {
                let id = article.id.clone();
                let handle = self.spawn_analysis(&topic, article);
                async move { settle(id, handle.await) }
            })
            .buffer_unordered(concurrency.max(1));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                next = in_flight.next() => match next {
                    Some(result) => batch.record(result),
                    None => return false,
                },
            }
        }
    }

    async fn dispatch_sequential(
        &self,
        pending: Vec<ArticleRecord>,
        delay: Duration,
        batch: &mut BatchRun,
        cancel: &CancelToken,
    ) -> bool {
        let topic = batch.job.query.clone();
        for (i, article) in pending.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return true,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return true;
            }
            let id = article.id.clone();
            let handle = self.spawn_analysis(&topic, article);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                joined = handle => batch.record(settle(id, joined)),
            }
        }
        false
    }

    fn spawn_analysis(&self, topic: &str, article: ArticleRecord) -> JoinHandle<AnalysisResult> {
        let client = Arc::clone(&self.client);
        let model = self.model.clone();
        let prompt = prompts::article_analysis(
            topic,
            &article.title,
            article.usable_abstract().unwrap_or_default(),
        );
        tokio::spawn(async move {
            match client.generate(&prompt, &model).await {
                Ok(text) => AnalysisResult::success(article.id, text),
                Err(e) => {
                    warn!(
                        article_id = %article.id,
                        call = "generate",
                        category = e.category(),
                        error = %e,
                        "article analysis failed"
                    );
                    AnalysisResult::failed(article.id, e.to_string())
                }
            }
        })
    }
}

fn settle(article_id: String, joined: Result<AnalysisResult, JoinError>) -> AnalysisResult {
    joined.unwrap_or_else(|e| {
        warn!(article_id = %article_id, error = %e, "analysis task did not complete");
        AnalysisResult::failed(article_id, format!("analysis task aborted: {e}"))
    })
}

fn dedupe(articles: Vec<ArticleRecord>) -> Vec<ArticleRecord> {
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| {
            let first = seen.insert(a.id.clone());
            if !first {
                warn!(article_id = %a.id, "duplicate article in batch, keeping first occurrence");
            }
            first
        })
        .collect()
}
