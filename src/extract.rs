//! The extraction orchestrator.
//!
//! [`Extractor`] drives one image through the pipeline:
//!
//! ```text
//! image ref ─▶ ImageSource ─▶ ModelClient ─▶ span ─▶ schema ─▶ PipelineResult
//! ```
//!
//! ## Modes
//!
//! * **One-shot**: one call with the combined prompt (validation rules and
//!   extraction format together) and the large token budget.
//! * **Two-step**: a cheap validation call first. A "not a receipt" verdict
//!   ends the run right there, so the expensive extraction call is never
//!   made. Otherwise the extraction-only prompt follows, and usage and
//!   metrics are reported per stage.
//!
//! Every stage error becomes a [`Failure`] tagged with the stage that
//! produced it; the first failure ends the run. The public entry points
//! always return a [`PipelineResult`], never `Err`.

use crate::config::ExtractionConfig;
use crate::error::{ExtractError, Failure, Stage};
use crate::output::{Extraction, Metrics, PipelineResult, Usage};
use crate::pipeline::client::{ModelClient, ModelRequest, ModelResponse, OpenRouterClient};
use crate::pipeline::image::{ImageProcessor, ImageSource, PreparedImage};
use crate::pipeline::schema::{parse_receipt, parse_verdict};
use crate::pipeline::span::extract_json_span;
use crate::progress::ProgressCallback;
use crate::prompts::{DefaultPrompts, PromptBuilder};
use crate::receipt::{NotAReceipt, ReceiptOutcome};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reason reported when the validation call says "no" without saying why.
pub const DEFAULT_REJECTION_REASON: &str = "not identified as a receipt";

/// Runs the receipt pipeline against injected collaborators.
pub struct Extractor {
    images: Arc<dyn ImageSource>,
    client: Arc<dyn ModelClient>,
    prompts: Arc<dyn PromptBuilder>,
    config: ExtractionConfig,
    progress: Option<ProgressCallback>,
}

impl Extractor {
    pub fn new(
        images: Arc<dyn ImageSource>,
        client: Arc<dyn ModelClient>,
        prompts: Arc<dyn PromptBuilder>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            images,
            client,
            prompts,
            config,
            progress: None,
        }
    }

    /// The standard stack: [`ImageProcessor`], [`OpenRouterClient`], [`DefaultPrompts`].
    pub fn from_config(
        config: ExtractionConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, ExtractError> {
        let client = OpenRouterClient::new(api_key, &config.api)?;
        Ok(Self::new(
            Arc::new(ImageProcessor::new(config.image.clone())),
            Arc::new(client),
            Arc::new(DefaultPrompts),
            config,
        ))
    }

    /// [`Extractor::from_config`] with the key from `OPENROUTER_API_KEY`.
    pub fn from_env(config: ExtractionConfig) -> Result<Self, ExtractError> {
        let client = OpenRouterClient::from_env(&config.api)?;
        Ok(Self::new(
            Arc::new(ImageProcessor::new(config.image.clone())),
            Arc::new(client),
            Arc::new(DefaultPrompts),
            config,
        ))
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run the pipeline for one image.
    pub async fn extract(&self, image_ref: &str, optimize: bool, two_step: bool) -> PipelineResult {
        self.extract_with_cancel(image_ref, optimize, two_step, &CancellationToken::new())
            .await
    }

    /// Run the pipeline for one image, aborting when `cancel` fires.
    ///
    /// A cancelled run returns a `Cancelled` failure naming the stage it
    /// was in.
    pub async fn extract_with_cancel(
        &self,
        image_ref: &str,
        optimize: bool,
        two_step: bool,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let start = Instant::now();
        info!(
            "Extracting {image_ref} ({}, optimize={optimize})",
            if two_step { "two-step" } else { "one-shot" }
        );

        match self.run(image_ref, optimize, two_step, cancel).await {
            Ok(extraction) => {
                info!(
                    "{image_ref}: {} in {}ms, {} tokens",
                    if extraction.outcome.is_receipt() { "receipt" } else { "not a receipt" },
                    start.elapsed().as_millis(),
                    extraction.usage.total_tokens()
                );
                PipelineResult::Success(extraction)
            }
            Err(failure) => {
                warn!("{image_ref}: {failure}");
                PipelineResult::Failure(failure)
            }
        }
    }

    /// Run independent pipelines for `image_refs`, at most `concurrency` at
    /// a time. Results come back in input order.
    pub async fn extract_batch(
        &self,
        image_refs: &[String],
        optimize: bool,
        two_step: bool,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<(String, PipelineResult)> {
        let total = image_refs.len();
        if let Some(cb) = &self.progress {
            cb.on_batch_start(total);
        }

        let mut results: Vec<(usize, PipelineResult)> =
            stream::iter(image_refs.iter().enumerate().map(|(index, image_ref)| async move {
                if let Some(cb) = &self.progress {
                    cb.on_image_start(index, total, image_ref);
                }
                let result = self
                    .extract_with_cancel(image_ref, optimize, two_step, cancel)
                    .await;
                if let Some(cb) = &self.progress {
                    match &result {
                        PipelineResult::Success(e) => {
                            cb.on_image_complete(index, total, image_ref, e.outcome.is_receipt())
                        }
                        PipelineResult::Failure(f) => {
                            cb.on_image_error(index, total, image_ref, &f.to_string())
                        }
                    }
                }
                (index, result)
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        let success_count = results.iter().filter(|(_, r)| r.is_success()).count();
        if let Some(cb) = &self.progress {
            cb.on_batch_complete(total, success_count);
        }
        debug!("Batch done: {success_count}/{total} succeeded");

        results
            .into_iter()
            .map(|(index, result)| (image_refs[index].clone(), result))
            .collect()
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    async fn run(
        &self,
        image_ref: &str,
        optimize: bool,
        two_step: bool,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let image = cancellable(cancel, None, self.images.prepare(image_ref, optimize))
            .await?
            .map_err(Failure::image)?;
        debug!("Prepared {image_ref}: {} bytes {}", image.bytes.len(), image.mime_type);

        if two_step {
            self.two_step(&image, cancel).await
        } else {
            self.one_shot(&image, cancel).await
        }
    }

    async fn one_shot(
        &self,
        image: &PreparedImage,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let prompt = self.prompts.extraction_prompt(true);
        let max_tokens = self.config.api.one_shot_max_tokens;
        let response = self
            .call(Stage::OneShot, image, &prompt, max_tokens, cancel)
            .await?;
        let outcome = self.parse_receipt(Stage::OneShot, &response.content)?;

        Ok(Extraction {
            outcome,
            usage: Usage::Single(response.usage),
            metrics: Metrics::Single(response.metrics),
            raw_response: response.content,
        })
    }

    async fn two_step(
        &self,
        image: &PreparedImage,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let prompt = self.prompts.validation_prompt();
        let max_tokens = self.config.api.validation_max_tokens;
        let validation = self
            .call(Stage::Validation, image, &prompt, max_tokens, cancel)
            .await?;

        let raw = validation.content.as_str();
        let verdict = extract_json_span(raw)
            .map_err(|e| Failure::validation_parse(e.to_string(), raw))
            .and_then(|span| {
                parse_verdict(span).map_err(|e| Failure::validation_parse(e.to_string(), raw))
            })?;

        if !verdict.is_receipt {
            let reason = verdict
                .reason
                .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string());
            debug!("Validation rejected the image: {reason}");
            return Ok(Extraction {
                outcome: ReceiptOutcome::NotAReceipt(NotAReceipt { reason }),
                usage: Usage::Single(validation.usage),
                metrics: Metrics::Single(validation.metrics),
                raw_response: validation.content,
            });
        }

        let prompt = self.prompts.extraction_prompt(false);
        let max_tokens = self.config.api.extraction_max_tokens;
        let extraction = self
            .call(Stage::Extraction, image, &prompt, max_tokens, cancel)
            .await?;
        let outcome = self.parse_receipt(Stage::Extraction, &extraction.content)?;

        Ok(Extraction {
            outcome,
            usage: Usage::combined(validation.usage, extraction.usage),
            metrics: Metrics::Combined {
                validation: validation.metrics,
                extraction: extraction.metrics,
            },
            raw_response: extraction.content,
        })
    }

    async fn call(
        &self,
        stage: Stage,
        image: &PreparedImage,
        prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, Failure> {
        let request = ModelRequest {
            image,
            prompt,
            max_tokens,
            cancel,
        };
        let start = Instant::now();
        let response = cancellable(cancel, Some(stage), self.client.call(request))
            .await?
            .map_err(|e| Failure::transport(stage, e))?;
        debug!(
            "{stage} call: {}ms, usage {:?}",
            start.elapsed().as_millis(),
            response.usage
        );
        Ok(response)
    }

    fn parse_receipt(&self, stage: Stage, raw: &str) -> Result<ReceiptOutcome, Failure> {
        let span = extract_json_span(raw).map_err(|e| Failure::no_json(stage, e))?;
        parse_receipt(span, self.config.total_tolerance).map_err(|e| Failure::schema(stage, e, raw))
    }
}

/// Race `fut` against `cancel`. Cancellation wins ties.
async fn cancellable<T>(
    cancel: &CancellationToken,
    stage: Option<Stage>,
    fut: impl Future<Output = T>,
) -> Result<T, Failure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Failure::cancelled(stage)),
        out = fut => Ok(out),
    }
}
