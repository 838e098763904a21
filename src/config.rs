//! Configuration types for receipt extraction.
//!
//! Everything the pipeline can be tuned with lives in [`ExtractionConfig`],
//! built via its [`ExtractionConfigBuilder`] or loaded from a JSON file with
//! the same shape as the service's `config.json`:
//!
//! ```json
//! {
//!   "api":   { "model": "meta-llama/llama-4-scout", "max_retries": 3,
//!              "openrouter": { "base_url": "https://openrouter.ai/api/v1" } },
//!   "image": { "max_width": 2048, "jpeg_quality": 85 }
//! }
//! ```
//!
//! Every field has a default, so a partial file (or none at all) is fine.

use crate::error::ExtractError;
use crate::receipt::DEFAULT_TOTAL_TOLERANCE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// File consulted by [`ExtractionConfig::load`] when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Top-level configuration for an [`crate::Extractor`].
///
/// # Example
/// ```rust
/// use receipt2json::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .model("meta-llama/llama-4-scout")
///     .provider("groq")
///     .max_width(1600)
///     .build()
///     .unwrap();
/// assert_eq!(config.api.provider.as_deref(), Some("groq"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub api: ApiConfig,
    pub image: ImageConfig,

    /// Allowed gap, in currency units, between a stated total and the sum of
    /// line items before `total_matches` turns false. Default: 0.01.
    pub total_tolerance: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            image: ImageConfig::default(),
            total_tolerance: DEFAULT_TOTAL_TOLERANCE,
        }
    }
}

/// Model call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Model identifier sent to the API. Default: `meta-llama/llama-4-scout`.
    pub model: String,

    /// Upstream provider to pin (OpenRouter `provider.order`), e.g. `"groq"`.
    pub provider: Option<String>,

    /// Attempts made against the generation-stats endpoint. Default: 3.
    ///
    /// Stats lag the completion by a few hundred milliseconds, so the first
    /// lookup usually 404s.
    pub max_retries: u32,

    /// Base delay in seconds for the stats backoff. Default: 0.5.
    ///
    /// Doubles per attempt with up to 10 % jitter: 0.5 s → 1 s → 2 s.
    #[serde(alias = "delay")]
    pub delay_secs: f64,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Token budget for the combined call of one-shot mode. Default: 2000.
    pub one_shot_max_tokens: u32,

    /// Token budget for the "is this a receipt?" call. Default: 100.
    pub validation_max_tokens: u32,

    /// Token budget for the extraction call of two-step mode. Default: 2000.
    pub extraction_max_tokens: u32,

    /// Timeout for one chat-completion request, in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Timeout for one stats lookup, in seconds. Default: 5.
    pub stats_timeout_secs: u64,

    pub openrouter: OpenRouterConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            model: "meta-llama/llama-4-scout".to_string(),
            provider: None,
            max_retries: 3,
            delay_secs: 0.5,
            temperature: 0.1,
            one_shot_max_tokens: 2000,
            validation_max_tokens: 100,
            extraction_max_tokens: 2000,
            request_timeout_secs: 60,
            stats_timeout_secs: 5,
            openrouter: OpenRouterConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn stats_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs.max(0.0))
    }
}

/// Endpoint layout of the OpenRouter-compatible API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub base_url: String,
    /// Path of the generation-stats lookup, appended to `base_url`.
    pub generation_path: String,
    /// Value of `response_format.type` in chat requests.
    pub response_format_type: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            generation_path: "/generation".to_string(),
            response_format_type: "json_object".to_string(),
        }
    }
}

/// Image preparation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Larger images are downscaled, keeping aspect ratio. Default: 2048.
    pub max_width: u32,
    pub max_height: u32,

    /// Files above this size are rejected before decoding. Default: 4.
    pub max_file_size_mb: u64,

    /// JPEG quality (1–100) when re-encoding. Default: 85.
    pub jpeg_quality: u8,

    /// Accepted file extensions, dot-prefixed and lower-case.
    pub supported_formats: Vec<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_width: 2048,
            max_height: 2048,
            max_file_size_mb: 4,
            jpeg_quality: 85,
            supported_formats: [".jpg", ".jpeg", ".png", ".webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ExtractError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| ExtractError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise `./config.json` if it exists,
    /// otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ExtractError> {
        match path {
            Some(p) => Self::from_file(p),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(DEFAULT_CONFIG_FILE)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ExtractError> {
        let invalid = |msg: String| Err(ExtractError::InvalidConfig(msg));
        if self.api.model.trim().is_empty() {
            return invalid("api.model must not be empty".into());
        }
        if self.api.max_retries == 0 {
            return invalid("api.max_retries must be ≥ 1".into());
        }
        if !self.api.delay_secs.is_finite() || self.api.delay_secs < 0.0 {
            return invalid(format!(
                "api.delay_secs must be a non-negative number, got {}",
                self.api.delay_secs
            ));
        }
        for (name, n) in [
            ("one_shot_max_tokens", self.api.one_shot_max_tokens),
            ("validation_max_tokens", self.api.validation_max_tokens),
            ("extraction_max_tokens", self.api.extraction_max_tokens),
        ] {
            if n == 0 {
                return invalid(format!("api.{name} must be ≥ 1"));
            }
        }
        if self.image.max_width == 0 || self.image.max_height == 0 {
            return invalid("image.max_width and image.max_height must be ≥ 1".into());
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            return invalid(format!(
                "image.jpeg_quality must be 1–100, got {}",
                self.image.jpeg_quality
            ));
        }
        if self.image.supported_formats.is_empty() {
            return invalid("image.supported_formats must not be empty".into());
        }
        if !self.total_tolerance.is_finite() || self.total_tolerance < 0.0 {
            return invalid(format!(
                "total_tolerance must be a non-negative number, got {}",
                self.total_tolerance
            ));
        }
        Ok(())
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.api.model = model.into();
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.config.api.provider = Some(provider.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.openrouter.base_url = url.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.api.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.api.max_retries = n.max(1);
        self
    }

    pub fn delay_secs(mut self, secs: f64) -> Self {
        self.config.api.delay_secs = secs.max(0.0);
        self
    }

    pub fn one_shot_max_tokens(mut self, n: u32) -> Self {
        self.config.api.one_shot_max_tokens = n;
        self
    }

    pub fn validation_max_tokens(mut self, n: u32) -> Self {
        self.config.api.validation_max_tokens = n;
        self
    }

    pub fn extraction_max_tokens(mut self, n: u32) -> Self {
        self.config.api.extraction_max_tokens = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api.request_timeout_secs = secs.max(1);
        self
    }

    pub fn max_width(mut self, px: u32) -> Self {
        self.config.image.max_width = px.max(1);
        self
    }

    pub fn max_height(mut self, px: u32) -> Self {
        self.config.image.max_height = px.max(1);
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.image.max_file_size_mb = mb;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.image.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn total_tolerance(mut self, tol: f64) -> Self {
        self.config.total_tolerance = tol;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.api.model, "meta-llama/llama-4-scout");
        assert_eq!(c.api.max_retries, 3);
        assert_eq!(c.api.validation_max_tokens, 100);
        assert_eq!(c.api.openrouter.generation_path, "/generation");
        assert_eq!(c.image.max_file_size_mb, 4);
        assert_eq!(c.image.supported_formats.len(), 4);
        assert_eq!(c.total_tolerance, 0.01);
        assert_eq!(c.api.stats_base_delay(), Duration::from_millis(500));
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .temperature(9.0)
            .jpeg_quality(0)
            .max_retries(0)
            .build()
            .unwrap();
        assert_eq!(c.api.temperature, 2.0);
        assert_eq!(c.image.jpeg_quality, 1);
        assert_eq!(c.api.max_retries, 1);
    }

    #[test]
    fn builder_rejects_zero_budget() {
        let err = ExtractionConfig::builder()
            .validation_max_tokens(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("validation_max_tokens"), "got: {err}");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"api": {{"provider": "groq", "delay": 0.25, "openrouter": {{"base_url": "http://localhost:9"}}}},
                "image": {{"jpeg_quality": 70}}}}"#
        )
        .unwrap();
        let c = ExtractionConfig::from_file(f.path()).unwrap();
        assert_eq!(c.api.provider.as_deref(), Some("groq"));
        assert_eq!(c.api.delay_secs, 0.25);
        assert_eq!(c.api.openrouter.base_url, "http://localhost:9");
        assert_eq!(c.api.openrouter.response_format_type, "json_object");
        assert_eq!(c.image.jpeg_quality, 70);
        assert_eq!(c.image.max_width, 2048);
    }

    #[test]
    fn bad_file_is_a_parse_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        let err = ExtractionConfig::from_file(f.path()).unwrap_err();
        assert!(matches!(err, ExtractError::ConfigParse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = ExtractionConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ExtractError::ConfigRead { .. }));
    }

    #[test]
    fn invalid_values_in_file_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"total_tolerance": -1}}"#).unwrap();
        let err = ExtractionConfig::from_file(f.path()).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidConfig(_)));
    }
}
