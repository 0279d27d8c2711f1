//! Configuration types for job execution.
//!
//! All engine behaviour is controlled through [`EngineConfig`], built via its
//! [`EngineConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share configs across the batch and realtime engines, serialise them for
//! logging, and diff two runs to understand why their outputs differ.

use crate::error::MoraqmanError;
use serde::{Deserialize, Serialize};

/// Configuration shared by the batch and realtime execution engines.
///
/// Built via [`EngineConfig::builder()`] or using [`EngineConfig::default()`].
///
/// # Example
/// ```rust
/// use moraqman::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .batch_size(25)
///     .model("gpt-5.1")
///     .dict_filter("aami_faseeh")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Vision model identifier. Default: "gpt-5.1".
    pub model: String,

    /// Jobs claimed per batch submission. Default: 50.
    ///
    /// Each job contributes `context_pages + 1` rendered images to the JSONL
    /// upload, so very large batches inflate the upload far faster than the
    /// job count suggests.
    pub batch_size: usize,

    /// Only claim jobs belonging to this dictionary folder, if set.
    pub dict_filter: Option<String>,

    /// Seconds between batch status polls. Default: 30.
    pub poll_interval_secs: u64,

    /// Maximum seconds to wait for one batch before leaving it to a later
    /// resume pass. Default: 3600.
    pub max_wait_secs: u64,

    /// Concurrent API calls in realtime mode. Default: 4.
    pub concurrency: usize,

    /// Maximum jobs to claim in one realtime run. None means batch_size.
    pub max_jobs: Option<usize>,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    ///
    /// Page sizes vary wildly across scanned volumes. Capping the longest
    /// edge keeps memory bounded and matches the image-size sweet spot for
    /// GPT-class vision models.
    pub max_rendered_pixels: u32,

    /// Sampling temperature. Default: 1.0.
    pub temperature: f32,

    /// Maximum completion tokens per page. Default: 4096.
    ///
    /// Dense dictionary pages can exceed 2 000 output tokens. Setting this
    /// too low silently truncates the JSON mid-entry.
    pub max_completion_tokens: u32,

    /// Reasoning effort hint sent with each request. Default: Some("low").
    pub reasoning_effort: Option<String>,

    /// Per-call HTTP timeout in seconds (realtime mode). Default: 120.
    pub api_timeout_secs: u64,

    /// Linear backoff step for transient realtime failures, in seconds.
    /// Wait is `retry_base_secs * attempt`, capped at [`Self::retry_max_secs`].
    /// Default: 30.
    pub retry_base_secs: u64,

    /// Backoff ceiling in seconds. Default: 300.
    pub retry_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5.1".to_string(),
            batch_size: 50,
            dict_filter: None,
            poll_interval_secs: 30,
            max_wait_secs: 3600,
            concurrency: 4,
            max_jobs: None,
            max_rendered_pixels: 2000,
            temperature: 1.0,
            max_completion_tokens: 4096,
            reasoning_effort: Some("low".to_string()),
            api_timeout_secs: 120,
            retry_base_secs: 30,
            retry_max_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Backoff duration before retrying a transient failure.
    ///
    /// `attempt` is 1-based: the first retry waits `retry_base_secs`.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        (self.retry_base_secs * attempt as u64).min(self.retry_max_secs)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn dict_filter(mut self, folder: impl Into<String>) -> Self {
        self.config.dict_filter = Some(folder.into());
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs.max(1);
        self
    }

    pub fn max_wait_secs(mut self, secs: u64) -> Self {
        self.config.max_wait_secs = secs;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_jobs(mut self, n: usize) -> Self {
        self.config.max_jobs = Some(n);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_completion_tokens(mut self, n: u32) -> Self {
        self.config.max_completion_tokens = n;
        self
    }

    pub fn reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.config.reasoning_effort = Some(effort.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn retry_base_secs(mut self, secs: u64) -> Self {
        self.config.retry_base_secs = secs;
        self
    }

    pub fn retry_max_secs(mut self, secs: u64) -> Self {
        self.config.retry_max_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, MoraqmanError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(MoraqmanError::InvalidConfig("batch_size must be ≥ 1".into()));
        }
        if c.concurrency == 0 {
            return Err(MoraqmanError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if c.model.is_empty() {
            return Err(MoraqmanError::InvalidConfig("model must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.model, "gpt-5.1");
        assert_eq!(c.batch_size, 50);
        assert_eq!(c.poll_interval_secs, 30);
        assert_eq!(c.max_wait_secs, 3600);
        assert_eq!(c.reasoning_effort.as_deref(), Some("low"));
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let c = EngineConfig::default();
        assert_eq!(c.backoff_secs(1), 30);
        assert_eq!(c.backoff_secs(5), 150);
        assert_eq!(c.backoff_secs(10), 300);
        assert_eq!(c.backoff_secs(100), 300);
    }

    #[test]
    fn builder_clamps_zero_concurrency() {
        let c = EngineConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn empty_model_rejected() {
        let err = EngineConfig::builder().model("").build();
        assert!(err.is_err());
    }
}
