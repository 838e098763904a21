//! Error types for the receipt2json library.
//!
//! Two distinct layers reflect two distinct failure modes:
//!
//! * [`ExtractError`] — **Fatal**: the extractor cannot be built at all
//!   (missing API key, unreadable config file, invalid settings). Returned as
//!   `Err(ExtractError)` from constructors and config loaders.
//!
//! * [`Failure`] — **Per-image**: one pipeline run failed at a known
//!   [`Stage`]. Stored inside [`crate::output::PipelineResult::Failure`] so a
//!   bad image never aborts a batch and the pipeline boundary never panics or
//!   returns `Err`.
//!
//! The stage-level error enums ([`ImageError`], [`ApiError`], [`SpanError`],
//! [`SchemaError`]) are what each stage returns internally. The orchestrator
//! converts each one to a [`Failure`] at exactly one call site, tagging it
//! with the stage that produced it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the receipt2json library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The config file exists but could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`crate::config::ExtractionConfig`].
    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ── Client errors ─────────────────────────────────────────────────────
    /// No API key was supplied and none was found in the environment.
    #[error("OpenRouter API key is missing.\nSet OPENROUTER_API_KEY or pass the key explicitly.")]
    MissingApiKey,

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Image preparation failed: unreadable, oversized, or unsupported input.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("file not found: '{path}'")]
    NotFound { path: PathBuf },

    #[error("unsupported extension '{extension}'. Accepted formats: {accepted}")]
    UnsupportedExtension { extension: String, accepted: String },

    #[error("file too large: {size_mb:.2}MB (max: {max_mb}MB)")]
    TooLarge { size_mb: f64, max_mb: u64 },

    #[error("unsupported image format: {format}")]
    UnsupportedFormat { format: String },

    #[error("cannot decode image: {0}")]
    Decode(String),

    #[error("cannot encode image: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image worker failed: {0}")]
    Worker(String),
}

/// The model API call itself failed.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never completed (DNS, TLS, timeout, connection reset).
    #[error("network error: {0}")]
    Network(String),

    /// The API answered 2xx but the body is not a chat completion.
    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    /// The completion carried no message content.
    #[error("empty response from model")]
    EmptyContent,
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// The span extractor could not isolate a JSON document.
#[derive(Debug, Error)]
pub enum SpanError {
    /// Carries the full response text for diagnostics.
    #[error("no complete and valid JSON object or array found in the response")]
    NoJsonFound { text: String },
}

/// The schema validator rejected the extracted JSON.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The span did not decode as JSON at all.
    #[error("Invalid JSON: {0}")]
    MalformedJson(String),

    /// Category outside the closed expense enumeration.
    #[error("Invalid category: {value}. Valid categories: {valid}")]
    InvalidCategory { value: String, valid: String },

    /// Decoding into the typed record failed (missing field, wrong type).
    #[error("{0}")]
    Invalid(String),
}

// ── Pipeline failures (data, not control flow) ───────────────────────────

/// The pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The single combined call of one-shot mode.
    OneShot,
    /// The cheap "is this a receipt?" call of two-step mode.
    Validation,
    /// The full extraction call of two-step mode.
    Extraction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::OneShot => "one-shot",
            Stage::Validation => "validation",
            Stage::Extraction => "extraction",
        })
    }
}

/// Every way a pipeline run can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ImagePreparation,
    Transport,
    NoJsonFound,
    MalformedJson,
    Schema,
    ValidationParse,
    Cancelled,
}

/// A failed pipeline run.
///
/// `raw_response` is set only when the model answered but the answer could
/// not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub stage: Option<Stage>,
    pub message: String,
    pub raw_response: Option<String>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match (self.kind, self.stage) {
            (FailureKind::ImagePreparation, _) => "Image processing error",
            (FailureKind::Transport, Some(Stage::Validation)) => "API validation error",
            (FailureKind::Transport, Some(Stage::Extraction)) => "API extraction error",
            (FailureKind::Transport, _) => "API error",
            (FailureKind::ValidationParse, _) => "Validation error",
            (FailureKind::Cancelled, _) => "Cancelled",
            (FailureKind::NoJsonFound | FailureKind::MalformedJson | FailureKind::Schema, _) => {
                "Parsing error"
            }
        };
        write!(f, "{label}: {}", self.message)
    }
}

impl std::error::Error for Failure {}

impl Failure {
    pub fn image(err: ImageError) -> Self {
        Self {
            kind: FailureKind::ImagePreparation,
            stage: None,
            message: err.to_string(),
            raw_response: None,
        }
    }

    pub fn transport(stage: Stage, err: ApiError) -> Self {
        Self {
            kind: FailureKind::Transport,
            stage: Some(stage),
            message: err.to_string(),
            raw_response: None,
        }
    }

    pub fn no_json(stage: Stage, err: SpanError) -> Self {
        let message = err.to_string();
        let SpanError::NoJsonFound { text } = err;
        Self {
            kind: FailureKind::NoJsonFound,
            stage: Some(stage),
            message,
            raw_response: Some(text),
        }
    }

    pub fn schema(stage: Stage, err: SchemaError, raw: &str) -> Self {
        let kind = match err {
            SchemaError::MalformedJson(_) => FailureKind::MalformedJson,
            SchemaError::InvalidCategory { .. } | SchemaError::Invalid(_) => FailureKind::Schema,
        };
        Self {
            kind,
            stage: Some(stage),
            message: err.to_string(),
            raw_response: Some(raw.to_string()),
        }
    }

    /// Any parse problem on the validation call of two-step mode.
    pub fn validation_parse(message: impl Into<String>, raw: &str) -> Self {
        Self {
            kind: FailureKind::ValidationParse,
            stage: Some(Stage::Validation),
            message: message.into(),
            raw_response: Some(raw.to_string()),
        }
    }

    pub fn cancelled(stage: Option<Stage>) -> Self {
        let message = match stage {
            Some(s) => format!("pipeline cancelled during the {s} call"),
            None => "pipeline cancelled during image preparation".to_string(),
        };
        Self {
            kind: FailureKind::Cancelled,
            stage,
            message,
            raw_response: None,
        }
    }
}
