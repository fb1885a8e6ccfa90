//! Pubsynth: PubMed search with LLM analysis of the retrieved abstracts.

mod config;
mod credentials;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pubsynth_analysis::export::{self, ExportFormat};
use pubsynth_analysis::{
    search_source, BatchAnalyzer, BatchEvent, BatchReport, ResearchSession, Schedule, SynthesisTask, Synthesizer,
};
use pubsynth_common::{AnalysisOutcome, ArticleRecord, ResponseCache, RetryPolicy};
use pubsynth_ingestion::{LiteratureSource, PubMedClient, PubMedSummaries, SlidingWindowLimiter};
use pubsynth_llm::prompts::ProposalSection;
use pubsynth_llm::{GeminiBackend, GenerationClient, LlmBackend, OpenAiCompatibleBackend};
use secrecy::ExposeSecret;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Provider};
use crate::credentials::Credentials;

#[derive(Parser)]
#[command(name = "pubsynth", version, about = "Search PubMed and analyse abstracts with an LLM")]
struct Cli {
    /// Path to pubsynth.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// LLM API key, taking precedence over the secret store and environment
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Generation model, overriding the configured one
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search PubMed and print the matching articles
    Search {
        query: String,
        #[arg(long)]
        max: Option<usize>,
        /// Titles and citation data only, no abstracts
        #[arg(long)]
        brief: bool,
    },
    /// Search, then analyse every abstract
    Analyze {
        query: String,
        #[arg(long)]
        max: Option<usize>,
        /// One article at a time with a fixed delay between calls
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        delay_ms: Option<u64>,
        /// csv, json or bibtex
        #[arg(long)]
        export: Option<ExportFormat>,
        /// Export destination (stdout when omitted)
        #[arg(long, requires = "export")]
        out: Option<PathBuf>,
    },
    /// Analyse a search, then synthesise across the successful analyses
    Synthesize {
        query: String,
        /// gaps, review or themes
        #[arg(long)]
        task: SynthesisTask,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Draft a research proposal
    Proposal {
        topic: String,
        /// "Title" or "Title:instructions", repeatable
        #[arg(long = "section", required = true)]
        sections: Vec<ProposalSection>,
    },
    /// Validate the configured LLM credential with one minimal call
    CheckKey,
}

/// Long-lived components shared by every command.
struct App {
    config: Config,
    credentials: Credentials,
    model_override: Option<String>,
    retry: RetryPolicy,
    limiter: Arc<SlidingWindowLimiter>,
    search_cache: Option<Arc<ResponseCache<Vec<ArticleRecord>>>>,
    generation_cache: Option<Arc<ResponseCache<String>>>,
}

impl App {
    fn new(config: Config, credentials: Credentials, model_override: Option<String>) -> Self {
        let retry = config.retry.policy();
        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.pubmed.requests_per_window,
            Duration::from_millis(config.pubmed.window_ms),
        ));
        let (search_cache, generation_cache) = if config.cache.enabled {
            (
                Some(Arc::new(ResponseCache::new(config.cache.search_ttl()))),
                Some(Arc::new(ResponseCache::new(config.cache.generation_ttl()))),
            )
        } else {
            (None, None)
        };
        Self { config, credentials, model_override, retry, limiter, search_cache, generation_cache }
    }

    fn model(&self) -> &str {
        self.model_override.as_deref().unwrap_or(self.config.llm.model())
    }

    fn pubmed(&self) -> anyhow::Result<PubMedClient> {
        let api_key = self.credentials.ncbi.key.as_ref().map(|k| k.expose_secret().to_string());
        let mut client = PubMedClient::new(api_key)?
            .with_base_url(&self.config.pubmed.base_url)?
            .with_limiter(self.limiter.clone())
            .with_retry(self.retry);
        if let Some(cache) = &self.search_cache {
            client = client.with_cache(cache.clone());
        }
        Ok(client)
    }

    /// Fails with the "not configured" message before any network call.
    fn backend(&self) -> anyhow::Result<Arc<dyn LlmBackend>> {
        let llm = &self.config.llm;
        let model = self.model().to_string();
        let backend: Arc<dyn LlmBackend> = match llm.provider {
            Provider::Gemini => {
                let mut backend = GeminiBackend::new(self.credentials.llm_key()?, model)?;
                if let Some(url) = &llm.base_url {
                    backend = backend.with_base_url(url)?;
                }
                Arc::new(backend.with_timeout(llm.timeout()))
            }
            Provider::Openrouter => {
                let backend = match &llm.base_url {
                    Some(url) => OpenAiCompatibleBackend::new(url, model, Some(self.credentials.llm_key()?))?,
                    None => OpenAiCompatibleBackend::openrouter(self.credentials.llm_key()?, model)?,
                };
                Arc::new(backend.with_timeout(llm.timeout()))
            }
            Provider::OpenaiCompatible => {
                let url = llm.base_url.as_deref().context("llm.base_url is not set")?;
                let key = self.credentials.llm_key().ok();
                if key.is_none() {
                    warn!("no API key for openai_compatible endpoint, sending unauthenticated requests");
                }
                Arc::new(OpenAiCompatibleBackend::new(url, model, key)?.with_timeout(llm.timeout()))
            }
        };
        Ok(backend)
    }

    fn generation_client(&self) -> anyhow::Result<Arc<GenerationClient>> {
        let mut client = GenerationClient::new(self.backend()?).with_retry(self.retry);
        if let Some(cache) = &self.generation_cache {
            client = client.with_cache(cache.clone());
        }
        Ok(Arc::new(client))
    }

    fn session(&self, schedule: Schedule) -> anyhow::Result<ResearchSession> {
        let analyzer = BatchAnalyzer::new(self.generation_client()?)
            .with_model(self.model())
            .with_schedule(schedule);
        let source: Arc<dyn LiteratureSource> = Arc::new(self.pubmed()?);
        Ok(ResearchSession::new(source, analyzer))
    }

    fn max_results(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.config.pubmed.max_results)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pubsynth=debug,info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref())?;
    let credentials = Credentials::resolve(&config, cli.api_key.as_deref())?;
    let app = App::new(config, credentials, cli.model);

    match cli.command {
        Command::Search { query, max, brief } => search(&app, &query, app.max_results(max), brief).await,
        Command::Analyze { query, max, sequential, concurrency, delay_ms, export, out } => {
            let mut schedule = app.config.batch.schedule();
            if sequential {
                let delay = delay_ms.unwrap_or(app.config.batch.delay_ms);
                schedule = Schedule::sequential(Duration::from_millis(delay));
            } else if let Some(n) = concurrency {
                schedule = Schedule::parallel(n);
            } else if let (Schedule::Sequential { .. }, Some(delay)) = (schedule, delay_ms) {
                schedule = Schedule::sequential(Duration::from_millis(delay));
            }
            let report = analyze(&app, &query, app.max_results(max), schedule).await?;
            if let Some(format) = export {
                write_export(&report, format, out.as_deref())?;
            }
            Ok(())
        }
        Command::Synthesize { query, task, max } => {
            let report = analyze(&app, &query, app.max_results(max), app.config.batch.schedule()).await?;
            let synthesizer = Synthesizer::new(app.generation_client()?).with_model(app.model());
            let text = synthesizer.run(task, &report.job).await?;
            println!("\n{text}");
            Ok(())
        }
        Command::Proposal { topic, sections } => {
            let synthesizer = Synthesizer::new(app.generation_client()?).with_model(app.model());
            println!("{}", synthesizer.proposal(&topic, &sections).await?);
            Ok(())
        }
        Command::CheckKey => check_key(&app).await,
    }
}

async fn search(app: &App, query: &str, max: usize, brief: bool) -> anyhow::Result<()> {
    let client = app.pubmed()?;
    let articles = if brief {
        search_source(&PubMedSummaries(client), query, max).await?
    } else {
        search_source(&client, query, max).await?
    };
    if articles.is_empty() {
        println!("No articles found for \"{query}\"");
        return Ok(());
    }
    for (i, article) in articles.iter().enumerate() {
        let year = article.year.as_deref().unwrap_or("n.d.");
        println!("{:>3}. [{}] {} ({})", i + 1, article.id, article.title, year);
        if !article.authors.is_empty() {
            println!("     {}", article.authors.join(", "));
        }
        if let Some(journal) = &article.journal {
            println!("     {journal}");
        }
        if !brief {
            if let Some(text) = article.usable_abstract() {
                println!("\n     {text}\n");
            }
        }
    }
    Ok(())
}

/// Runs the batch in the background, driving a progress bar from its events.
/// Ctrl-C stops dispatching new articles.
async fn analyze(app: &App, query: &str, max: usize, schedule: Schedule) -> anyhow::Result<BatchReport> {
    let session = app.session(schedule)?;
    let mut handle = session.start(query, max).await?;

    let bar = ProgressBar::new(handle.progress().total as u64);
    bar.set_style(ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")?.progress_chars("=> "));

    let mut cancelling = false;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(BatchEvent::ItemCompleted { result, progress }) => {
                    bar.set_position(progress.completed as u64);
                    bar.set_message(format!("{} {}", result.article_id, result.outcome.as_str()));
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                bar.println("Cancelling, waiting for in-flight analyses...");
                handle.cancel();
            }
        }
    }
    bar.finish_and_clear();

    let report = handle.join().await.context("batch task panicked")?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &BatchReport) {
    for (article, result) in report.job.rows() {
        println!("\n[{}] {}", article.id, article.title);
        match result {
            Some(r) => match &r.outcome {
                AnalysisOutcome::Success { text } => println!("{text}"),
                AnalysisOutcome::Skipped { reason } => println!("SKIPPED: {reason}"),
                AnalysisOutcome::Failed { error } => println!("FAILED: {error}"),
            },
            None => println!("(not analysed)"),
        }
    }
    println!(
        "\n{} articles: {} analysed, {} skipped, {} failed{} in {:.1}s",
        report.job.articles.len(),
        report.succeeded(),
        report.skipped(),
        report.failed(),
        if report.cancelled { " (cancelled)" } else { "" },
        report.duration_ms as f64 / 1000.0,
    );
}

fn write_export(report: &BatchReport, format: ExportFormat, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            export::export(&report.job, format, &mut writer)?;
            writer.flush()?;
            info!(path = %path.display(), %format, "export written");
        }
        None => export::export(&report.job, format, io::stdout().lock())?,
    }
    Ok(())
}

async fn check_key(app: &App) -> anyhow::Result<()> {
    println!("Credential source: {}", app.credentials.llm.source);
    let client = app.generation_client()?;
    match client.validate_credentials(app.model()).await {
        Ok(()) => {
            println!("{} key is valid for model {}", client.provider(), app.model());
            Ok(())
        }
        Err(e) => anyhow::bail!("{} key check failed ({}): {e}", client.provider(), e.category()),
    }
}
