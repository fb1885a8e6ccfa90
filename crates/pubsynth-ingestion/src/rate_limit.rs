//! Sliding-window rate limiter for outbound database calls.
//!
//! At most `max_calls` calls start within any rolling `window`. Callers over
//! the cap wait (they are never rejected) until the oldest call in the window
//! ages out. One limiter is built at start-up and shared by every client that
//! talks to the same provider.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub const PUBMED_CALLS_PER_WINDOW: usize = 3;
pub const PUBMED_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_calls: usize,
    window: Duration,
    started: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            window,
            started: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// NCBI's limit for clients without an API key: 3 requests per second.
    pub fn pubmed_default() -> Self {
        Self::new(PUBMED_CALLS_PER_WINDOW, PUBMED_WINDOW)
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a call may start, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut started = self.started.lock().await;
                let now = Instant::now();
                while started
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    started.pop_front();
                }
                match started.front() {
                    Some(oldest) if started.len() >= self.max_calls => *oldest + self.window,
                    _ => {
                        started.push_back(now);
                        return;
                    }
                }
            };
            debug!(
                wait_ms = wait_until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "rate limit reached, waiting for window"
            );
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_window_respected(stamps: &[Instant], max_calls: usize, window: Duration) {
        for pair in stamps.windows(max_calls + 1) {
            let span = pair[max_calls].duration_since(pair[0]);
            assert!(span >= window, "{} calls started within {:?}", max_calls + 1, span);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_over_cap_wait_for_window() {
        let limiter = SlidingWindowLimiter::pubmed_default();
        let t0 = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..7 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }

        assert_window_respected(&stamps, 3, PUBMED_WINDOW);
        let offsets: Vec<u64> = stamps.iter().map(|t| t.duration_since(t0).as_millis() as u64).collect();
        assert_eq!(offsets, vec![0, 0, 0, 1000, 1000, 1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_cap() {
        let limiter = Arc::new(SlidingWindowLimiter::new(2, Duration::from_millis(500)));
        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }
        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap());
        }
        stamps.sort();
        assert_window_respected(&stamps, 2, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_window_does_not_delay() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now(), before);
    }

    #[test]
    fn test_zero_cap_is_normalised() {
        assert_eq!(SlidingWindowLimiter::new(0, Duration::from_secs(1)).max_calls(), 1);
    }
}
