//! Generation stats side-channel with bounded exponential backoff.
//!
//! OpenRouter reports latency, generation time and cost for a completion on
//! a separate endpoint, keyed by the completion id. That endpoint is
//! eventually consistent: for a few hundred milliseconds after the
//! completion returns it answers 404. [`fetch_stats`] retries through that
//! window and gives up quietly. Stats only enrich [`crate::StageMetrics`],
//! so every failure here ends as `None`, never as a pipeline error.
//!
//! ## Backoff
//!
//! Attempts are zero-based. After a failed attempt `n` (404 or transport
//! error), and only if another attempt remains, the fetcher sleeps
//!
//! ```text
//! base * 2^n  +  uniform(0, 0.1 * base * 2^n)
//! ```
//!
//! With the defaults (base 0.5 s, 3 attempts) that is ~0.5 s then ~1 s.

use crate::error::ApiError;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The payload of a successful stats lookup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationStats {
    /// Time to first token, in milliseconds.
    #[serde(default)]
    pub latency: Option<f64>,
    /// Total generation time, in milliseconds.
    #[serde(default)]
    pub generation_time: Option<f64>,
    /// Cost in US dollars.
    #[serde(default, rename = "usage")]
    pub cost: Option<f64>,
}

/// Result of one lookup attempt that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsLookup {
    /// HTTP 200.
    Ready(GenerationStats),
    /// HTTP 404: not populated yet.
    Pending,
    /// Any other status. Not retried.
    Rejected(u16),
}

/// One stats lookup by generation id.
#[async_trait]
pub trait StatsEndpoint: Send + Sync {
    async fn lookup(&self, generation_id: &str) -> Result<StatsLookup, ApiError>;
}

/// Delay before the attempt following `attempt`.
pub fn backoff_delay<R: Rng + ?Sized>(base: Duration, attempt: u32, rng: &mut R) -> Duration {
    let delay = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let jitter = rng.gen_range(0.0..=delay * 0.1);
    Duration::from_secs_f64(delay + jitter)
}

/// Look up stats for `generation_id`, retrying 404s and transport errors.
///
/// Returns `None` when attempts run out, on any non-404 error status, or as
/// soon as `cancel` fires (including mid-sleep).
pub async fn fetch_stats(
    endpoint: &dyn StatsEndpoint,
    generation_id: &str,
    max_attempts: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
) -> Option<GenerationStats> {
    for attempt in 0..max_attempts {
        let lookup = tokio::select! {
            _ = cancel.cancelled() => return None,
            r = endpoint.lookup(generation_id) => r,
        };

        match lookup {
            Ok(StatsLookup::Ready(stats)) => {
                debug!("Stats for {generation_id} ready after {} attempt(s)", attempt + 1);
                return Some(stats);
            }
            Ok(StatsLookup::Rejected(status)) => {
                warn!("Stats lookup for {generation_id} rejected with HTTP {status}");
                return None;
            }
            Ok(StatsLookup::Pending) => {
                debug!("Stats for {generation_id} not ready (attempt {})", attempt + 1);
            }
            Err(e) => {
                debug!("Stats lookup for {generation_id} failed (attempt {}): {e}", attempt + 1);
            }
        }

        if attempt + 1 < max_attempts {
            let delay = backoff_delay(base_delay, attempt, &mut rand::thread_rng());
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    warn!("Stats for {generation_id} unavailable after {max_attempts} attempt(s)");
    None
}

/// `GET {base_url}{generation_path}?id=...` against OpenRouter.
pub struct HttpStatsEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct StatsEnvelope {
    #[serde(default)]
    data: Option<GenerationStats>,
}

impl HttpStatsEndpoint {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StatsEndpoint for HttpStatsEndpoint {
    async fn lookup(&self, generation_id: &str) -> Result<StatsLookup, ApiError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("id", generation_id)])
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let envelope: StatsEnvelope = response.json().await?;
                Ok(StatsLookup::Ready(envelope.data.unwrap_or_default()))
            }
            StatusCode::NOT_FOUND => Ok(StatsLookup::Pending),
            other => Ok(StatsLookup::Rejected(other.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const TICK: Duration = Duration::from_millis(1);

    enum Step {
        Ok(StatsLookup),
        Fail,
    }

    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatsEndpoint for Scripted {
        async fn lookup(&self, _id: &str) -> Result<StatsLookup, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.steps.lock().unwrap().pop_front() {
                Some(Step::Ok(l)) => Ok(l),
                Some(Step::Fail) => Err(ApiError::Network("connection reset".into())),
                None => Ok(StatsLookup::Pending),
            }
        }
    }

    fn ready() -> GenerationStats {
        GenerationStats {
            latency: Some(310.0),
            generation_time: Some(1200.0),
            cost: Some(0.00042),
        }
    }

    #[tokio::test]
    async fn three_404s_then_ready() {
        let ep = Scripted::new(vec![
            Step::Ok(StatsLookup::Pending),
            Step::Ok(StatsLookup::Pending),
            Step::Ok(StatsLookup::Pending),
            Step::Ok(StatsLookup::Ready(ready())),
        ]);
        let got = fetch_stats(&ep, "gen-1", 4, TICK, &CancellationToken::new()).await;
        assert_eq!(got, Some(ready()));
        assert_eq!(ep.calls(), 4);
    }

    #[tokio::test]
    async fn exhausted_404s_is_none() {
        let ep = Scripted::new(vec![]);
        let got = fetch_stats(&ep, "gen-1", 4, TICK, &CancellationToken::new()).await;
        assert_eq!(got, None);
        assert_eq!(ep.calls(), 4);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let ep = Scripted::new(vec![Step::Fail, Step::Ok(StatsLookup::Ready(ready()))]);
        let got = fetch_stats(&ep, "gen-1", 3, TICK, &CancellationToken::new()).await;
        assert!(got.is_some());
        assert_eq!(ep.calls(), 2);
    }

    #[tokio::test]
    async fn other_status_stops_immediately() {
        let ep = Scripted::new(vec![
            Step::Ok(StatsLookup::Rejected(401)),
            Step::Ok(StatsLookup::Ready(ready())),
        ]);
        let got = fetch_stats(&ep, "gen-1", 4, TICK, &CancellationToken::new()).await;
        assert_eq!(got, None);
        assert_eq!(ep.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let ep = Scripted::new(vec![Step::Ok(StatsLookup::Ready(ready()))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(fetch_stats(&ep, "gen-1", 4, TICK, &cancel).await, None);
    }

    #[tokio::test]
    async fn cancelled_during_backoff_sleep() {
        let ep = Scripted::new(vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let got = fetch_stats(&ep, "gen-1", 5, Duration::from_secs(30), &cancel).await;
        assert_eq!(got, None);
        assert_eq!(ep.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(500);
        for attempt in 0..4u32 {
            let floor = 0.5 * 2f64.powi(attempt as i32);
            let d = backoff_delay(base, attempt, &mut rng).as_secs_f64();
            assert!(d >= floor - 1e-9, "attempt {attempt}: {d} < {floor}");
            assert!(d <= floor * 1.1 + 1e-9, "attempt {attempt}: {d} > {}", floor * 1.1);
        }
    }

    #[test]
    fn zero_base_means_no_wait() {
        let d = backoff_delay(Duration::ZERO, 3, &mut rand::thread_rng());
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn stats_payload_decodes() {
        let env: StatsEnvelope = serde_json::from_str(
            r#"{"data": {"id": "gen-1", "latency": 250, "generation_time": 900, "usage": 0.0003}}"#,
        )
        .unwrap();
        let s = env.data.unwrap();
        assert_eq!(s.latency, Some(250.0));
        assert_eq!(s.cost, Some(0.0003));
    }
}
