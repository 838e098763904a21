//! Pipeline result types and their wire shape.
//!
//! [`PipelineResult`] is what [`crate::Extractor::extract`] always returns.
//! Its JSON form is what a presentation layer sends on:
//!
//! ```json
//! {"success": true,  "data": {...}, "is_receipt": true, "usage": {...}, "metrics": {...}}
//! {"success": false, "data": null,  "is_receipt": null, "usage": null, "metrics": null,
//!  "error": "Parsing error: ...", "error_kind": "no_json_found", "stage": "one_shot",
//!  "raw_response": "..."}
//! ```
//!
//! `raw_response` appears only when a model answer arrived but could not be
//! parsed.

use crate::error::Failure;
use crate::receipt::ReceiptOutcome;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Token counts for one API call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Timing and cost for one API call.
///
/// All fields are optional: the stats side-channel may never answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub first_token_latency_ms: Option<u64>,
    pub generation_time_ms: Option<u64>,
    /// Completion tokens per second of generation time.
    pub throughput: Option<f64>,
    /// In US dollars.
    pub cost: Option<f64>,
    pub finish_reason: Option<String>,
}

/// Usage for a whole pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Usage {
    /// One-shot mode, or two-step mode stopped after validation.
    Single(Option<StageUsage>),
    /// Two-step mode with both calls made.
    Combined {
        validation: Option<StageUsage>,
        extraction: Option<StageUsage>,
        total_tokens: u64,
    },
}

impl Usage {
    pub fn combined(validation: Option<StageUsage>, extraction: Option<StageUsage>) -> Self {
        let total_tokens = [validation, extraction]
            .iter()
            .flatten()
            .map(|u| u.total_tokens)
            .sum();
        Usage::Combined {
            validation,
            extraction,
            total_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        match self {
            Usage::Single(u) => u.map(|u| u.total_tokens).unwrap_or(0),
            Usage::Combined { total_tokens, .. } => *total_tokens,
        }
    }
}

/// Metrics for a whole pipeline run. Two-step runs keep one record per
/// stage; latencies of different calls are never summed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Metrics {
    Single(StageMetrics),
    Combined {
        validation: StageMetrics,
        extraction: StageMetrics,
    },
}

impl Metrics {
    /// The metrics of the call that produced the data.
    pub fn primary(&self) -> &StageMetrics {
        match self {
            Metrics::Single(m) => m,
            Metrics::Combined { extraction, .. } => extraction,
        }
    }
}

/// A successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub outcome: ReceiptOutcome,
    pub usage: Usage,
    pub metrics: Metrics,
    /// Text of the call that produced `outcome`.
    pub raw_response: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Success(Extraction),
    Failure(Failure),
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success(_))
    }

    pub fn extraction(&self) -> Option<&Extraction> {
        match self {
            PipelineResult::Success(e) => Some(e),
            PipelineResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PipelineResult::Success(_) => None,
            PipelineResult::Failure(f) => Some(f),
        }
    }
}

impl Serialize for PipelineResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PipelineResult::Success(e) => {
                let mut map = serializer.serialize_map(Some(5))?;
                map.serialize_entry("success", &true)?;
                map.serialize_entry("data", &e.outcome)?;
                map.serialize_entry("is_receipt", &e.outcome.is_receipt())?;
                map.serialize_entry("usage", &e.usage)?;
                map.serialize_entry("metrics", &e.metrics)?;
                map.end()
            }
            PipelineResult::Failure(f) => {
                let len = if f.raw_response.is_some() { 9 } else { 8 };
                let mut map = serializer.serialize_map(Some(len))?;
                map.serialize_entry("success", &false)?;
                map.serialize_entry("data", &None::<()>)?;
                map.serialize_entry("is_receipt", &None::<bool>)?;
                map.serialize_entry("usage", &None::<()>)?;
                map.serialize_entry("metrics", &None::<()>)?;
                map.serialize_entry("error", &f.to_string())?;
                map.serialize_entry("error_kind", &f.kind)?;
                map.serialize_entry("stage", &f.stage)?;
                if let Some(raw) = &f.raw_response {
                    map.serialize_entry("raw_response", raw)?;
                }
                map.end()
            }
        }
    }
}
