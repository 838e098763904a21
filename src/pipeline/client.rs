//! Model API client: one chat completion per pipeline stage.
//!
//! [`OpenRouterClient`] speaks the OpenAI-compatible chat-completions API
//! directly over `reqwest`. Each call sends a single user message holding
//! the prompt and the image as a base64 data URI, asks for a JSON object
//! response, and optionally pins an upstream provider.
//!
//! After a successful completion the client looks up the generation stats
//! (see [`super::stats`]) and folds latency, generation time, cost and
//! throughput into the returned [`StageMetrics`]. A missing stats record
//! leaves those fields `None`; it never fails the call.
//!
//! The client does not retry the completion itself. A failed call surfaces
//! as an [`ApiError`] and the orchestrator reports it for that stage.

use crate::config::ApiConfig;
use crate::error::{ApiError, ExtractError};
use crate::output::{StageMetrics, StageUsage};
use crate::pipeline::image::PreparedImage;
use crate::pipeline::stats::{fetch_stats, GenerationStats, HttpStatsEndpoint, StatsEndpoint};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Environment variable holding the OpenRouter API key.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Error bodies longer than this are cut in [`ApiError::Http`].
const MAX_ERROR_BODY: usize = 2000;

/// Everything one model call needs.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub image: &'a PreparedImage,
    pub prompt: &'a str,
    pub max_tokens: u32,
    /// Aborts the stats lookup that follows the completion.
    pub cancel: &'a CancellationToken,
}

/// A successful model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    /// Message text. Never empty.
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<StageUsage>,
    pub metrics: StageMetrics,
    pub generation_id: Option<String>,
}

/// Sends one prompt + image to a vision model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ApiError>;
}

/// OpenRouter chat-completions client.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    completions_url: String,
    model: String,
    provider: Option<String>,
    temperature: f32,
    response_format_type: String,
    stats: Arc<dyn StatsEndpoint>,
    stats_attempts: u32,
    stats_base_delay: Duration,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("completions_url", &self.completions_url)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OpenRouterClient {
    /// Build a client for `config` authenticating with `api_key`.
    pub fn new(api_key: impl Into<String>, config: &ApiConfig) -> Result<Self, ExtractError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ExtractError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExtractError::HttpClient(e.to_string()))?;

        let base = config.openrouter.base_url.trim_end_matches('/');
        let stats = HttpStatsEndpoint::new(
            http.clone(),
            format!("{base}{}", config.openrouter.generation_path),
            api_key.clone(),
            Duration::from_secs(config.stats_timeout_secs),
        );
        debug!("OpenRouter client: model={}, provider={:?}", config.model, config.provider);

        Ok(Self {
            completions_url: format!("{base}/chat/completions"),
            http,
            api_key,
            model: config.model.clone(),
            provider: config.provider.clone(),
            temperature: config.temperature,
            response_format_type: config.openrouter.response_format_type.clone(),
            stats: Arc::new(stats),
            stats_attempts: config.max_retries,
            stats_base_delay: config.stats_base_delay(),
        })
    }

    /// Like [`OpenRouterClient::new`], reading the key from `OPENROUTER_API_KEY`.
    pub fn from_env(config: &ApiConfig) -> Result<Self, ExtractError> {
        let key = std::env::var(API_KEY_ENV).map_err(|_| ExtractError::MissingApiKey)?;
        Self::new(key, config)
    }

    /// Replace the stats side-channel.
    pub fn with_stats_endpoint(mut self, stats: Arc<dyn StatsEndpoint>) -> Self {
        self.stats = stats;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": request.prompt },
                    { "type": "image_url", "image_url": { "url": request.image.to_data_uri() } }
                ]
            }],
            "temperature": self.temperature,
            "max_tokens": request.max_tokens,
            "response_format": { "type": self.response_format_type },
        });
        if let Some(provider) = &self.provider {
            body["provider"] = json!({ "order": [provider] });
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ApiError> {
        debug!(
            "Calling {} ({} image bytes, max_tokens={})",
            self.model,
            request.image.bytes.len(),
            request.max_tokens
        );
        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Model call failed with HTTP {}", status.as_u16());
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let completion: ChatCompletion = response.json().await?;
        let mut out = read_completion(completion)?;
        debug!("Model answer (first 500 chars): {}", truncate(&out.content, 500));

        if let Some(id) = out.generation_id.as_deref() {
            let stats = fetch_stats(
                self.stats.as_ref(),
                id,
                self.stats_attempts,
                self.stats_base_delay,
                request.cancel,
            )
            .await;
            if let Some(stats) = stats {
                apply_stats(&mut out.metrics, &stats, out.usage.as_ref());
            }
        }
        Ok(out)
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<StageUsage>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

fn read_completion(completion: ChatCompletion) -> Result<ModelResponse, ApiError> {
    if let Some(err) = completion.error {
        return Err(ApiError::InvalidResponse(err.message));
    }
    let choice = completion.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
    let content = choice
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|c| !c.is_empty())
        .ok_or(ApiError::EmptyContent)?;

    Ok(ModelResponse {
        content,
        model: completion.model,
        usage: completion.usage,
        metrics: StageMetrics {
            finish_reason,
            ..Default::default()
        },
        generation_id: completion.id,
    })
}

/// Merge a stats record into `metrics`.
///
/// Throughput is completion tokens per second of generation time, set only
/// when both are positive.
pub fn apply_stats(metrics: &mut StageMetrics, stats: &GenerationStats, usage: Option<&StageUsage>) {
    if let Some(latency) = stats.latency {
        metrics.first_token_latency_ms = Some(latency.max(0.0) as u64);
    }
    if let Some(gen) = stats.generation_time {
        metrics.generation_time_ms = Some(gen.max(0.0) as u64);
    }
    if let Some(cost) = stats.cost {
        metrics.cost = Some(cost);
    }
    if let (Some(ms), Some(usage)) = (metrics.generation_time_ms, usage) {
        if ms > 0 && usage.completion_tokens > 0 {
            metrics.throughput = Some(usage.completion_tokens as f64 / (ms as f64 / 1000.0));
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stats::StatsLookup;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn image() -> PreparedImage {
        PreparedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/jpeg".into(),
        }
    }

    fn client(provider: Option<&str>) -> OpenRouterClient {
        let config = ApiConfig {
            provider: provider.map(str::to_string),
            ..ApiConfig::default()
        };
        OpenRouterClient::new("sk-test", &config).unwrap()
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = OpenRouterClient::new("  ", &ApiConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractError::MissingApiKey));
    }

    #[test]
    fn request_body_shape() {
        let img = image();
        let cancel = CancellationToken::new();
        let req = ModelRequest {
            image: &img,
            prompt: "read this",
            max_tokens: 100,
            cancel: &cancel,
        };
        let body = client(Some("groq")).build_request(&req);
        assert_eq!(body["model"], "meta-llama/llama-4-scout");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["provider"]["order"][0], "groq");
        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0]["text"], "read this");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AQID");

        let body = client(None).build_request(&req);
        assert!(body.get("provider").is_none());
    }

    #[test]
    fn completion_decoding() {
        let c: ChatCompletion = serde_json::from_str(
            r#"{"id": "gen-42", "model": "meta-llama/llama-4-scout",
                "choices": [{"message": {"role": "assistant", "content": "{\"is_receipt\": true}"},
                             "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 900, "completion_tokens": 20, "total_tokens": 920}}"#,
        )
        .unwrap();
        let r = read_completion(c).unwrap();
        assert_eq!(r.generation_id.as_deref(), Some("gen-42"));
        assert_eq!(r.usage.unwrap().total_tokens, 920);
        assert_eq!(r.metrics.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn missing_content_is_an_error() {
        let c: ChatCompletion =
            serde_json::from_str(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap();
        assert!(matches!(read_completion(c), Err(ApiError::EmptyContent)));
        let c: ChatCompletion = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(read_completion(c), Err(ApiError::EmptyContent)));
    }

    #[test]
    fn in_band_error_is_invalid_response() {
        let c: ChatCompletion =
            serde_json::from_str(r#"{"error": {"message": "Provider returned error", "code": 502}}"#)
                .unwrap();
        let err = read_completion(c).unwrap_err();
        assert!(err.to_string().contains("Provider returned error"));
    }

    #[test]
    fn stats_merge_and_throughput() {
        let mut m = StageMetrics::default();
        let usage = StageUsage {
            prompt_tokens: 1000,
            completion_tokens: 300,
            total_tokens: 1300,
        };
        apply_stats(
            &mut m,
            &GenerationStats {
                latency: Some(412.7),
                generation_time: Some(1500.0),
                cost: Some(0.0012),
            },
            Some(&usage),
        );
        assert_eq!(m.first_token_latency_ms, Some(412));
        assert_eq!(m.generation_time_ms, Some(1500));
        assert_eq!(m.cost, Some(0.0012));
        assert_eq!(m.throughput, Some(200.0));
    }

    #[test]
    fn no_throughput_without_generation_time() {
        let mut m = StageMetrics::default();
        apply_stats(
            &mut m,
            &GenerationStats {
                generation_time: Some(0.0),
                ..Default::default()
            },
            Some(&StageUsage::default()),
        );
        assert_eq!(m.throughput, None);
    }

    #[test]
    fn truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("abc", 10), "abc");
    }

    // ── Loopback HTTP ────────────────────────────────────────────────────

    /// Serve canned `(status, body)` responses, one connection each.
    async fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                read_request(&mut sock).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        format!("http://{addr}")
    }

    async fn read_request(sock: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    struct CountingStats(AtomicUsize);

    #[async_trait]
    impl StatsEndpoint for CountingStats {
        async fn lookup(&self, _id: &str) -> Result<StatsLookup, ApiError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StatsLookup::Ready(GenerationStats {
                latency: Some(100.0),
                generation_time: Some(500.0),
                cost: Some(0.001),
            }))
        }
    }

    fn loopback_config(base_url: String) -> ApiConfig {
        let mut config = ApiConfig::default();
        config.openrouter.base_url = base_url;
        config.delay_secs = 0.001;
        config
    }

    #[tokio::test]
    async fn http_call_merges_stats() {
        let base = serve(vec![(
            200,
            r#"{"id": "gen-7", "model": "m", "choices": [{"message": {"content": "{}"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 50, "total_tokens": 60}}"#
                .to_string(),
        )])
        .await;
        let stats = Arc::new(CountingStats(AtomicUsize::new(0)));
        let client = OpenRouterClient::new("sk-test", &loopback_config(base))
            .unwrap()
            .with_stats_endpoint(stats.clone());
        let img = image();
        let cancel = CancellationToken::new();
        let r = client
            .call(ModelRequest {
                image: &img,
                prompt: "p",
                max_tokens: 10,
                cancel: &cancel,
            })
            .await
            .unwrap();
        assert_eq!(r.content, "{}");
        assert_eq!(stats.0.load(Ordering::SeqCst), 1);
        assert_eq!(r.metrics.generation_time_ms, Some(500));
        assert_eq!(r.metrics.throughput, Some(100.0));
    }

    #[tokio::test]
    async fn http_error_status() {
        let base = serve(vec![(429, r#"{"error": "rate limited"}"#.to_string())]).await;
        let client = OpenRouterClient::new("sk-test", &loopback_config(base)).unwrap();
        let img = image();
        let cancel = CancellationToken::new();
        let err = client
            .call(ModelRequest {
                image: &img,
                prompt: "p",
                max_tokens: 10,
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        match err {
            ApiError::Http { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limited"));
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_stats_endpoint_statuses() {
        let base = serve(vec![
            (404, "{}".to_string()),
            (200, r#"{"data": {"latency": 80, "generation_time": 640, "usage": 0.0002}}"#.to_string()),
            (500, "oops".to_string()),
        ])
        .await;
        let ep = HttpStatsEndpoint::new(
            reqwest::Client::new(),
            format!("{base}/generation"),
            "sk-test",
            Duration::from_secs(5),
        );
        assert_eq!(ep.lookup("gen-1").await.unwrap(), StatsLookup::Pending);
        match ep.lookup("gen-1").await.unwrap() {
            StatsLookup::Ready(s) => assert_eq!(s.generation_time, Some(640.0)),
            other => panic!("expected Ready, got {other:?}"),
        }
        assert_eq!(ep.lookup("gen-1").await.unwrap(), StatsLookup::Rejected(500));
    }
}
