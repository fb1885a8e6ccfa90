//! PubMedClient against a local E-utilities mock: retries under the rate
//! limiter, status classification, and request parameters on the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pubsynth_common::{PubsynthError, RetryPolicy};
use pubsynth_ingestion::{LiteratureSource, PubMedClient, PubMedSummaries, SlidingWindowLimiter};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const ONE_ARTICLE: &str = "<?xml version=\"1.0\"?>\
<PubmedArticleSet><PubmedArticle><MedlineCitation><PMID Version=\"1\">1</PMID><Article>\
<ArticleTitle>Circadian rhythm and memory.</ArticleTitle>\
<Abstract><AbstractText>Short abstract.</AbstractText></Abstract>\
</Article></MedlineCitation></PubmedArticle></PubmedArticleSet>";

fn idlist(ids: &[&str]) -> serde_json::Value {
    serde_json::json!({ "esearchresult": { "count": ids.len().to_string(), "idlist": ids } })
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    }
}

fn client(server: &MockServer, limiter: SlidingWindowLimiter, retry: RetryPolicy) -> PubMedClient {
    PubMedClient::new(None)
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap()
        .with_limiter(Arc::new(limiter))
        .with_retry(retry)
}

/// Fails the first `failures` requests with 503, then serves `body`.
struct FlakyEsearch {
    failures: usize,
    seen: AtomicUsize,
    body: serde_json::Value,
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl Respond for FlakyEsearch {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
            ResponseTemplate::new(503).set_body_string("Service Temporarily Unavailable")
        } else {
            ResponseTemplate::new(200).set_body_json(&self.body)
        }
    }
}

#[tokio::test]
async fn test_retries_503_within_rate_window() {
    let server = MockServer::start().await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .and(query_param("db", "pubmed"))
        .and(query_param("term", "sleep memory"))
        .and(query_param("retmode", "json"))
        .respond_with(FlakyEsearch {
            failures: 2,
            seen: AtomicUsize::new(0),
            body: idlist(&["1"]),
            arrivals: arrivals.clone(),
        })
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("id", "1"))
        .and(query_param("retmode", "xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ONE_ARTICLE))
        .expect(1)
        .mount(&server)
        .await;

    let window = Duration::from_millis(150);
    let pubmed = client(&server, SlidingWindowLimiter::new(1, window), fast_retry(3));
    let records = pubmed.search("sleep memory", 5).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "1");
    assert_eq!(records[0].abstract_text.as_deref(), Some("Short abstract."));

    // One call per window even though the retry backoff is 1ms.
    let arrivals = arrivals.lock().unwrap().clone();
    assert_eq!(arrivals.len(), 3);
    for pair in arrivals.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(120), "gap {:?}", pair[1] - pair[0]);
    }
}

#[tokio::test]
async fn test_empty_idlist_skips_efetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(idlist(&[])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ONE_ARTICLE))
        .expect(0)
        .mount(&server)
        .await;

    let pubmed = client(&server, SlidingWindowLimiter::new(10, Duration::from_millis(10)), fast_retry(3));
    assert!(pubmed.search("zzzx nonexistent", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_error_is_invalid_input_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid query syntax"))
        .expect(1)
        .mount(&server)
        .await;

    let pubmed = client(&server, SlidingWindowLimiter::new(10, Duration::from_millis(10)), fast_retry(3));
    let err = pubmed.search("((", 5).await.unwrap_err();
    assert!(matches!(err, PubsynthError::InvalidInput(ref m) if m.contains("400")), "{err}");
}

#[tokio::test]
async fn test_throttled_is_network_after_every_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(429).set_body_string("API rate limit exceeded"))
        .expect(2)
        .mount(&server)
        .await;

    let pubmed = client(&server, SlidingWindowLimiter::new(10, Duration::from_millis(10)), fast_retry(2));
    let err = pubmed.search("sleep", 5).await.unwrap_err();
    assert!(matches!(err, PubsynthError::Network(ref m) if m.contains("429")), "{err}");
}

#[tokio::test]
async fn test_api_key_sent_as_query_param() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .and(query_param("api_key", "ncbi-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(idlist(&["1"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("api_key", "ncbi-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ONE_ARTICLE))
        .expect(1)
        .mount(&server)
        .await;

    let pubmed = PubMedClient::new(Some("ncbi-secret".to_string()))
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap()
        .with_retry(fast_retry(1));
    assert_eq!(pubmed.search("sleep", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_summary_search_uses_esummary() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(idlist(&["7"])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/esummary.fcgi"))
        .and(query_param("id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let limiter = SlidingWindowLimiter::new(10, Duration::from_millis(10));
    let brief = PubMedSummaries(client(&server, limiter, fast_retry(1)));
    assert_eq!(brief.name(), "pubmed-summary");
    assert!(matches!(brief.search("sleep", 3).await, Err(PubsynthError::Parse(_))));

    // The full search fails the same way on an unreadable efetch body.
    assert!(matches!(brief.0.search("sleep", 3).await, Err(PubsynthError::Parse(_))));
}
