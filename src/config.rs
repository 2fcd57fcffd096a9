//! Configuration for batch extraction runs.
//!
//! All runtime behaviour is controlled through [`BatchConfig`], built via
//! its [`BatchConfigBuilder`]. Keeping every knob in one immutable struct
//! makes it trivial to share across concurrent document pipelines,
//! serialise for logging, and diff two runs to understand why their
//! outcomes differ. The config is constructed once at batch submission and
//! threaded through every component — nothing re-reads ambient environment
//! mid-run.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest; `build()` rejects invalid combinations
//! before any work is admitted.

use crate::error::BatchError;
use serde::{Deserialize, Serialize};

/// Configuration for one batch run.
///
/// Built via [`BatchConfig::builder()`] or [`BatchConfig::default()`].
///
/// # Example
/// ```rust
/// use docbatch::BatchConfig;
///
/// let config = BatchConfig::builder()
///     .max_concurrent_documents(4)
///     .requests_per_minute(120)
///     .page_concurrency(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of document pipelines allowed to run at once. Default: 4.
    ///
    /// This is the batch-level admission gate, not the API throttle. Each
    /// running pipeline fans out over its own pages, so the effective call
    /// pressure is roughly `max_concurrent_documents * page_concurrency`,
    /// all of it still funnelled through the shared rate limiter.
    pub max_concurrent_documents: usize,

    /// Pages of one document processed concurrently. Default: host CPU count.
    ///
    /// Orthogonal to the rate limiter: this bounds how many pages are in
    /// flight, while the limiter independently throttles the call rate
    /// regardless of how many pages are waiting.
    pub page_concurrency: usize,

    /// Rasterisation worker count. Default: host CPU count.
    ///
    /// The rasteriser is CPU-bound and not safe to share across concurrent
    /// calls, so each worker opens its own handle on the document.
    pub render_workers: usize,

    /// Generator/embedder calls admitted per minute. Default: 60.
    ///
    /// Feeds the token bucket's refill rate. Must be positive — a zero rate
    /// would starve every waiter forever, so `build()` rejects it.
    pub requests_per_minute: u32,

    /// Token-bucket burst capacity. Default: 10.
    ///
    /// How far the bucket can fill during idle periods. A larger burst lets
    /// a freshly submitted batch start several calls immediately before
    /// settling into the steady refill rate.
    pub burst_capacity: u32,

    /// Per generator/embedder call timeout in seconds. Default: 60.
    ///
    /// A timeout surfaces as a classified `exception` page failure, never
    /// as a silent empty result.
    pub call_timeout_secs: u64,

    /// Guardrail: maximum accumulated characters per stream. Default: 50_000.
    pub guardrail_max_chars: usize,

    /// Guardrail: sliding-window size in characters. Default: 200.
    ///
    /// The window over which the dominant-character and escaped-newline
    /// ratios are computed. Small enough to catch a loop quickly, large
    /// enough that legitimate short runs (table rules, padding) pass.
    pub guardrail_window: usize,

    /// Guardrail: dominant-character ratio that triggers an abort. Default: 0.8.
    pub repetition_threshold: f64,

    /// Guardrail: consecutive literal newlines that trigger an abort. Default: 100.
    pub max_consecutive_newlines: usize,

    /// Chunk size in characters. Default: 1500.
    pub chunk_size: usize,

    /// Overlap between adjacent chunks in characters. Default: 200.
    ///
    /// Must be smaller than `chunk_size`, otherwise chunking cannot make
    /// forward progress; `build()` rejects the combination.
    pub chunk_overlap: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_concurrent_documents: 4,
            page_concurrency: cpus,
            render_workers: cpus,
            requests_per_minute: 60,
            burst_capacity: 10,
            call_timeout_secs: 60,
            guardrail_max_chars: 50_000,
            guardrail_window: 200,
            repetition_threshold: 0.8,
            max_consecutive_newlines: 100,
            chunk_size: 1500,
            chunk_overlap: 200,
        }
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn max_concurrent_documents(mut self, n: usize) -> Self {
        self.config.max_concurrent_documents = n.max(1);
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn render_workers(mut self, n: usize) -> Self {
        self.config.render_workers = n.max(1);
        self
    }

    pub fn requests_per_minute(mut self, n: u32) -> Self {
        self.config.requests_per_minute = n;
        self
    }

    pub fn burst_capacity(mut self, n: u32) -> Self {
        self.config.burst_capacity = n.max(1);
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs.max(1);
        self
    }

    pub fn guardrail_max_chars(mut self, n: usize) -> Self {
        self.config.guardrail_max_chars = n.max(1);
        self
    }

    pub fn guardrail_window(mut self, n: usize) -> Self {
        self.config.guardrail_window = n.max(10);
        self
    }

    pub fn repetition_threshold(mut self, r: f64) -> Self {
        self.config.repetition_threshold = r.clamp(0.1, 1.0);
        self
    }

    pub fn max_consecutive_newlines(mut self, n: usize) -> Self {
        self.config.max_consecutive_newlines = n.max(1);
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(100);
        self
    }

    pub fn chunk_overlap(mut self, n: usize) -> Self {
        self.config.chunk_overlap = n;
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Configuration errors are the one class of failure this crate raises
    /// eagerly: they are detected here, before any work is admitted, rather
    /// than deferred into job state.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.requests_per_minute == 0 {
            return Err(BatchError::InvalidConfig(
                "requests_per_minute must be > 0 (a zero rate starves every waiter)".into(),
            ));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(BatchError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&c.repetition_threshold) {
            return Err(BatchError::InvalidConfig(format!(
                "repetition_threshold must be within 0–1, got {}",
                c.repetition_threshold
            )));
        }
        Ok(self.config)
    }
}
