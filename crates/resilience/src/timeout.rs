//! Timeout Controller Implementation
//!
//! Computes an adaptive deadline from request complexity, races the
//! operation against it, and learns from observed durations. A deadline
//! expiry is an outcome, not an error: the pending operation is abandoned
//! (best-effort cancellation) and the caller gets `timed_out = true`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::LogContext;

/// Samples kept per complexity signature for adaptive estimation
const MAX_SAMPLES_PER_SIGNATURE: usize = 10;

/// Distinct signatures tracked before insertion-order eviction kicks in
const MAX_SIGNATURES: usize = 256;

/// Configuration for timeout management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Baseline timeout before complexity factors
    pub default_timeout: Duration,

    /// Lower clamp for any computed timeout
    pub min_timeout: Duration,

    /// Upper clamp for any computed timeout
    pub max_timeout: Duration,

    /// Global scale applied to the baseline
    pub timeout_multiplier: f64,

    /// Blend computed timeouts with observed durations per signature
    pub enable_adaptive_timeout: bool,

    /// How long an abandoned operation may keep running after its deadline
    pub grace_period: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(300),
            timeout_multiplier: 1.0,
            enable_adaptive_timeout: true,
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Capability class of the model behind the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelClass {
    /// Small, fast models
    Lightweight,
    /// Default tier
    Standard,
    /// Large reasoning models, noticeably slower
    Advanced,
}

impl Default for ModelClass {
    fn default() -> Self {
        Self::Standard
    }
}

impl ModelClass {
    fn timeout_factor(&self) -> f64 {
        match self {
            ModelClass::Lightweight => 0.75,
            ModelClass::Standard => 1.0,
            ModelClass::Advanced => 1.5,
        }
    }
}

/// Per-request complexity signals driving the timeout computation
#[derive(Debug, Clone, Default)]
pub struct ComplexityHints {
    /// Characters of request content
    pub content_length: usize,
    /// Request embeds images or other media
    pub has_media: bool,
    /// Request embeds code
    pub has_code: bool,
    /// Messages already in the conversation
    pub conversation_length: usize,
    pub model_class: ModelClass,
}

impl ComplexityHints {
    pub fn with_content_length(mut self, content_length: usize) -> Self {
        self.content_length = content_length;
        self
    }

    pub fn with_media(mut self, has_media: bool) -> Self {
        self.has_media = has_media;
        self
    }

    pub fn with_code(mut self, has_code: bool) -> Self {
        self.has_code = has_code;
        self
    }

    pub fn with_conversation_length(mut self, conversation_length: usize) -> Self {
        self.conversation_length = conversation_length;
        self
    }

    pub fn with_model_class(mut self, model_class: ModelClass) -> Self {
        self.model_class = model_class;
        self
    }
}

/// Bucketed key grouping requests of similar complexity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ComplexitySignature {
    has_media: bool,
    has_code: bool,
    model_class: ModelClass,
    content_bucket: usize,
    conversation_bucket: usize,
}

impl ComplexitySignature {
    fn for_hints(hints: &ComplexityHints) -> Self {
        Self {
            has_media: hints.has_media,
            has_code: hints.has_code,
            model_class: hints.model_class,
            content_bucket: hints.content_length / 500,
            conversation_bucket: hints.conversation_length / 5,
        }
    }
}

/// Outcome of a timed execution
#[derive(Debug)]
pub struct TimeoutOutcome<T> {
    /// The operation's output, absent when the deadline expired first
    pub result: Option<T>,
    pub timed_out: bool,
    /// Wall time spent waiting
    pub duration: Duration,
    /// The deadline that was applied
    pub timeout_used: Duration,
}

/// Statistics for timeout operations
#[derive(Debug, Clone, Default)]
pub struct TimeoutStats {
    pub total_operations: u64,
    pub completed_operations: u64,
    pub timed_out_operations: u64,
    pub total_execution_time: Duration,
    pub min_execution_time: Duration,
    pub max_execution_time: Duration,
    /// Distinct complexity signatures currently tracked
    pub tracked_signatures: usize,
}

impl TimeoutStats {
    pub fn timeout_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.timed_out_operations as f64 / self.total_operations as f64
        }
    }

    pub fn average_execution_time(&self) -> Duration {
        if self.total_operations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(
                (self.total_execution_time.as_nanos() / self.total_operations as u128) as u64,
            )
        }
    }
}

/// Timeout controller with adaptive deadline estimation
#[derive(Debug)]
pub struct TimeoutController {
    config: TimeoutConfig,
    samples: DashMap<ComplexitySignature, VecDeque<Duration>>,
    insertion_order: Mutex<VecDeque<ComplexitySignature>>,
    stats: Mutex<TimeoutStats>,
}

impl TimeoutController {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            samples: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            stats: Mutex::new(TimeoutStats::default()),
        }
    }

    /// Compute the deadline for a request without executing anything.
    ///
    /// Base × global multiplier, scaled by content length (up to 10x),
    /// media (3x), code (2x), conversation length (up to 5x) and model
    /// class, optionally blended 30/70 with the observed mean for the same
    /// complexity signature, then clamped to the configured bounds.
    pub fn compute_timeout(&self, hints: &ComplexityHints) -> Duration {
        let mut seconds = self.config.default_timeout.as_secs_f64() * self.config.timeout_multiplier;

        let content_factor = (hints.content_length as f64 / 1000.0).max(1.0).min(10.0);
        seconds *= content_factor;
        if hints.has_media {
            seconds *= 3.0;
        }
        if hints.has_code {
            seconds *= 2.0;
        }
        let conversation_factor = (hints.conversation_length as f64 / 10.0).max(1.0).min(5.0);
        seconds *= conversation_factor;
        seconds *= hints.model_class.timeout_factor();

        if self.config.enable_adaptive_timeout {
            let signature = ComplexitySignature::for_hints(hints);
            if let Some(observed) = self.observed_mean(&signature) {
                seconds = 0.3 * seconds + 0.7 * observed.as_secs_f64();
            }
        }

        let clamped = seconds
            .min(self.config.max_timeout.as_secs_f64())
            .max(self.config.min_timeout.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// Race an operation against its computed deadline.
    ///
    /// When the deadline fires first the optional `cancellation` token is
    /// cancelled, the orphaned future gets `grace_period` to settle in the
    /// background (its output is discarded), and the call returns
    /// immediately with `timed_out = true`.
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &LogContext,
        hints: &ComplexityHints,
        cancellation: Option<CancellationToken>,
        operation: F,
    ) -> TimeoutOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let timeout_used = self.compute_timeout(hints);
        debug!(
            correlation_id = %ctx.correlation_id,
            timeout_ms = timeout_used.as_millis() as u64,
            adaptive = self.config.enable_adaptive_timeout,
            "Starting operation with computed timeout"
        );

        let mut fut = Box::pin(operation());
        let started = Instant::now();

        tokio::select! {
            output = &mut fut => {
                let duration = started.elapsed();
                self.record_duration(ComplexitySignature::for_hints(hints), duration);
                self.record_stats(duration, false);
                debug!(
                    correlation_id = %ctx.correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    "Operation completed within deadline"
                );
                TimeoutOutcome {
                    result: Some(output),
                    timed_out: false,
                    duration,
                    timeout_used,
                }
            }
            _ = tokio::time::sleep(timeout_used) => {
                let duration = started.elapsed();
                self.record_stats(duration, true);
                warn!(
                    correlation_id = %ctx.correlation_id,
                    timeout_ms = timeout_used.as_millis() as u64,
                    "Operation timed out, abandoning"
                );
                if let Some(token) = cancellation {
                    token.cancel();
                }
                let grace = self.config.grace_period;
                if !grace.is_zero() {
                    // Let the orphan settle off to the side, then drop it
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(grace, fut).await;
                    });
                }
                TimeoutOutcome {
                    result: None,
                    timed_out: true,
                    duration,
                    timeout_used,
                }
            }
        }
    }

    /// Enforce the signature cap; called by the periodic maintenance task.
    pub fn prune_signatures(&self) {
        let excess: Vec<ComplexitySignature> = {
            let mut order = self.insertion_order.lock();
            let mut excess = Vec::new();
            while order.len() > MAX_SIGNATURES {
                if let Some(signature) = order.pop_front() {
                    excess.push(signature);
                }
            }
            excess
        };
        for signature in excess {
            self.samples.remove(&signature);
        }
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> TimeoutStats {
        let mut stats = self.stats.lock().clone();
        stats.tracked_signatures = self.samples.len();
        stats
    }

    /// Get configuration
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    fn observed_mean(&self, signature: &ComplexitySignature) -> Option<Duration> {
        let buf = self.samples.get(signature)?;
        if buf.is_empty() {
            return None;
        }
        let total: Duration = buf.iter().sum();
        Some(total / buf.len() as u32)
    }

    fn record_duration(&self, signature: ComplexitySignature, duration: Duration) {
        let is_new = !self.samples.contains_key(&signature);
        {
            let mut buf = self.samples.entry(signature.clone()).or_default();
            if buf.len() >= MAX_SAMPLES_PER_SIGNATURE {
                buf.pop_front();
            }
            buf.push_back(duration);
        }
        if is_new {
            let evicted = {
                let mut order = self.insertion_order.lock();
                if !order.contains(&signature) {
                    order.push_back(signature);
                }
                if order.len() > MAX_SIGNATURES {
                    order.pop_front()
                } else {
                    None
                }
            };
            if let Some(old) = evicted {
                self.samples.remove(&old);
            }
        }
    }

    fn record_stats(&self, duration: Duration, timed_out: bool) {
        let mut stats = self.stats.lock();
        stats.total_operations += 1;
        if timed_out {
            stats.timed_out_operations += 1;
        } else {
            stats.completed_operations += 1;
        }
        stats.total_execution_time += duration;
        if stats.total_operations == 1 {
            stats.min_execution_time = duration;
            stats.max_execution_time = duration;
        } else {
            stats.min_execution_time = stats.min_execution_time.min(duration);
            stats.max_execution_time = stats.max_execution_time.max(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TimeoutConfig {
        TimeoutConfig {
            default_timeout: Duration::from_secs(10),
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(600),
            timeout_multiplier: 1.0,
            enable_adaptive_timeout: false,
            grace_period: Duration::ZERO,
        }
    }

    #[test]
    fn test_compute_timeout_baseline() {
        let controller = TimeoutController::new(base_config());
        let hints = ComplexityHints::default();
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(10));
    }

    #[test]
    fn test_content_length_scales_timeout() {
        let controller = TimeoutController::new(base_config());

        let hints = ComplexityHints::default().with_content_length(5000);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(50));

        // capped at 10x
        let hints = ComplexityHints::default().with_content_length(50_000);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(100));
    }

    #[test]
    fn test_media_code_and_model_factors() {
        let controller = TimeoutController::new(base_config());

        let hints = ComplexityHints::default().with_media(true);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(30));

        let hints = ComplexityHints::default().with_code(true);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(20));

        let hints = ComplexityHints::default().with_model_class(ModelClass::Advanced);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(15));

        let hints = ComplexityHints::default()
            .with_content_length(2000)
            .with_code(true);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(40));
    }

    #[test]
    fn test_conversation_length_factor() {
        let controller = TimeoutController::new(base_config());

        let hints = ComplexityHints::default().with_conversation_length(20);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(20));

        // capped at 5x
        let hints = ComplexityHints::default().with_conversation_length(500);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(50));
    }

    #[test]
    fn test_clamping_to_bounds() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_secs(10),
            min_timeout: Duration::from_secs(15),
            max_timeout: Duration::from_secs(60),
            ..base_config()
        });

        // below the floor
        let hints = ComplexityHints::default().with_model_class(ModelClass::Lightweight);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(15));

        // above the ceiling
        let hints = ComplexityHints::default()
            .with_media(true)
            .with_content_length(10_000);
        assert_eq!(controller.compute_timeout(&hints), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_completion_within_deadline() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_millis(200),
            min_timeout: Duration::from_millis(10),
            ..base_config()
        });
        let ctx = LogContext::new();
        let hints = ComplexityHints::default();

        let outcome = controller
            .execute(&ctx, &hints, None, || async { 42 })
            .await;

        assert!(!outcome.timed_out);
        assert_eq!(outcome.result, Some(42));
        assert!(outcome.duration < outcome.timeout_used);
    }

    #[tokio::test]
    async fn test_deadline_expiry_returns_without_result() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_millis(50),
            min_timeout: Duration::from_millis(10),
            ..base_config()
        });
        let ctx = LogContext::new();
        let hints = ComplexityHints::default();

        let outcome = controller
            .execute(&ctx, &hints, None, || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                42
            })
            .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.timeout_used, Duration::from_millis(50));
        assert!(outcome.duration >= Duration::from_millis(45));
        assert!(outcome.duration <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_token_cancelled_on_deadline() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_millis(30),
            min_timeout: Duration::from_millis(10),
            ..base_config()
        });
        let ctx = LogContext::new();
        let hints = ComplexityHints::default();
        let token = CancellationToken::new();

        let outcome = controller
            .execute(&ctx, &hints, Some(token.clone()), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                1
            })
            .await;

        assert!(outcome.timed_out);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_adaptive_blending_learns_from_observations() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_millis(200),
            min_timeout: Duration::from_millis(10),
            enable_adaptive_timeout: true,
            ..base_config()
        });
        let ctx = LogContext::new();
        let hints = ComplexityHints::default();

        // No samples yet: pure computed value
        assert_eq!(
            controller.compute_timeout(&hints),
            Duration::from_millis(200)
        );

        for _ in 0..2 {
            let outcome = controller
                .execute(&ctx, &hints, None, || async {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                })
                .await;
            assert!(!outcome.timed_out);
        }

        // 0.3 * 200ms + 0.7 * ~40ms is roughly 90ms
        let blended = controller.compute_timeout(&hints);
        assert!(blended >= Duration::from_millis(70), "blended = {blended:?}");
        assert!(blended <= Duration::from_millis(140), "blended = {blended:?}");
    }

    #[tokio::test]
    async fn test_stats_track_completions_and_timeouts() {
        let controller = TimeoutController::new(TimeoutConfig {
            default_timeout: Duration::from_millis(50),
            min_timeout: Duration::from_millis(10),
            ..base_config()
        });
        let ctx = LogContext::new();
        let hints = ComplexityHints::default();

        let _ = controller.execute(&ctx, &hints, None, || async { 1 }).await;
        let _ = controller
            .execute(&ctx, &hints, None, || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                2
            })
            .await;

        let stats = controller.stats();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.completed_operations, 1);
        assert_eq!(stats.timed_out_operations, 1);
        assert!((stats.timeout_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_signature_bucketing() {
        let a = ComplexitySignature::for_hints(&ComplexityHints::default().with_content_length(100));
        let b = ComplexitySignature::for_hints(&ComplexityHints::default().with_content_length(400));
        let c = ComplexitySignature::for_hints(&ComplexityHints::default().with_content_length(600));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signature_cap_evicts_oldest() {
        let controller = TimeoutController::new(base_config());
        for i in 0..(MAX_SIGNATURES + 10) {
            let hints = ComplexityHints::default().with_content_length(i * 500);
            controller.record_duration(
                ComplexitySignature::for_hints(&hints),
                Duration::from_millis(10),
            );
        }
        assert!(controller.samples.len() <= MAX_SIGNATURES);

        // The very first signature is the one that was evicted
        let first = ComplexitySignature::for_hints(&ComplexityHints::default());
        assert!(controller.observed_mean(&first).is_none());
    }

    #[test]
    fn test_sample_ring_is_bounded() {
        let controller = TimeoutController::new(base_config());
        let signature = ComplexitySignature::for_hints(&ComplexityHints::default());
        for i in 0..50 {
            controller.record_duration(signature.clone(), Duration::from_millis(i));
        }
        let buf = controller.samples.get(&signature).unwrap();
        assert_eq!(buf.len(), MAX_SAMPLES_PER_SIGNATURE);
        // Oldest entries are gone
        assert_eq!(buf.front().copied(), Some(Duration::from_millis(40)));
    }
}
