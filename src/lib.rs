//! # receipt2json
//!
//! Extract structured receipt data from photos using Vision Language Models.
//!
//! A VLM is asked to return the receipt as JSON. What comes back is usually
//! close: wrapped in a code fence, preceded by a friendly sentence, or with
//! a total that does not add up. This crate turns that answer into a typed
//! [`ReceiptRecord`] (or an explicit [`NotAReceipt`] verdict), with token
//! usage and timing/cost metrics for every call it made.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image
//!  │
//!  ├─ 1. Prepare  validate, downscale, re-encode (spawn_blocking)
//!  ├─ 2. Call     one-shot, or validation then extraction (two-step)
//!  ├─ 3. Span     locate the JSON document in the model's text
//!  ├─ 4. Schema   typed record, category check, totals reconciliation
//!  └─ 5. Result   PipelineResult with usage + metrics per stage
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use receipt2json::{ExtractionConfig, Extractor, PipelineResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads OPENROUTER_API_KEY
//!     let extractor = Extractor::from_env(ExtractionConfig::default())?;
//!     match extractor.extract("receipt.jpg", true, false).await {
//!         PipelineResult::Success(e) => println!("{}", serde_json::to_string_pretty(&e.outcome)?),
//!         PipelineResult::Failure(f) => eprintln!("{f}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## One-shot vs two-step
//!
//! | Mode | Calls | Cost on a non-receipt | Cost on a receipt |
//! |------|-------|-----------------------|-------------------|
//! | one-shot (default) | 1 | full extraction budget | full extraction budget |
//! | two-step | 1–2 | validation budget only | validation + extraction |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `receipt2json` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod categories;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod receipt;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use categories::ExpenseCategory;
pub use config::{ApiConfig, ExtractionConfig, ExtractionConfigBuilder, ImageConfig, OpenRouterConfig};
pub use error::{ApiError, ExtractError, Failure, FailureKind, ImageError, SchemaError, SpanError, Stage};
pub use extract::Extractor;
pub use output::{Extraction, Metrics, PipelineResult, StageMetrics, StageUsage, Usage};
pub use pipeline::client::{ModelClient, ModelRequest, ModelResponse, OpenRouterClient};
pub use pipeline::image::{ImageProcessor, ImageSource, PreparedImage};
pub use pipeline::schema::{parse_receipt, parse_verdict, ValidationVerdict};
pub use pipeline::span::extract_json_span;
pub use pipeline::stats::{fetch_stats, GenerationStats, HttpStatsEndpoint, StatsEndpoint, StatsLookup};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::{DefaultPrompts, PromptBuilder};
pub use receipt::{LineItem, Merchant, NotAReceipt, ReceiptOutcome, ReceiptRecord, Totals, Transaction};
pub use tokio_util::sync::CancellationToken;
