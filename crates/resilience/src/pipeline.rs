//! Resilience Pipeline Implementation
//!
//! Composes the protection layers around one caller-supplied operation:
//! circuit breaker outermost, then the adaptive timeout, then retry with
//! backoff. The timeout budget is shared across all retry attempts of a
//! call, so total latency stays bounded. After the protected call settles,
//! history bookkeeping and response validation run outside the failure
//! layers and can only enrich the result, never fail it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::LogContext;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerState, CircuitBreakerStats,
};
use crate::config::ResilienceConfig;
use crate::error::{OperationError, PipelineError};
use crate::history::{HistoryManager, HistoryStats, Message};
use crate::retry::RetryExecutor;
use crate::timeout::{ComplexityHints, TimeoutController, TimeoutStats};
use crate::validation::ResponseValidator;

/// Per-call request envelope
///
/// Carries the correlation context, complexity hints for the timeout
/// computation and an optional cancellation token that is cancelled when
/// the deadline fires.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub ctx: LogContext,
    pub hints: ComplexityHints,
    pub cancellation: Option<CancellationToken>,
}

impl PipelineRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ctx(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_hints(mut self, hints: ComplexityHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Metadata attached to every pipeline result
#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    pub correlation_id: String,

    /// Wall time for the whole pipeline call
    pub duration: Duration,

    /// Operation invocations actually made, including ones abandoned by
    /// the deadline
    pub retry_count: u32,

    /// Breaker state observed after the call
    pub circuit_state: CircuitBreakerState,

    pub fallback_applied: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_strategy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_score: Option<u8>,

    /// Estimated tokens of the recorded response message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
}

/// One pipeline call's outcome
///
/// Classified failures never escape as errors; they land here as
/// `success = false` with the failure in `error`.
#[derive(Debug)]
pub struct EnhancedResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<PipelineError>,
    pub metadata: ResultMetadata,
}

impl<T> EnhancedResult<T> {
    /// Convert into a plain `Result`, dropping the metadata.
    pub fn into_result(self) -> Result<T, PipelineError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(PipelineError::Rejected {
                source: OperationError::new(
                    crate::error::ErrorKind::Unknown,
                    "Pipeline produced neither data nor error",
                ),
            }),
        }
    }
}

type MessageRecorder<T> = Arc<dyn Fn(&T) -> Option<Message> + Send + Sync>;

/// Connects a shared history manager to pipeline results
///
/// The recorder turns a successful response into the message to append;
/// returning `None` skips bookkeeping for that call.
pub struct HistoryBinding<T> {
    manager: Arc<HistoryManager>,
    recorder: MessageRecorder<T>,
}

impl<T> HistoryBinding<T> {
    pub fn new(
        manager: Arc<HistoryManager>,
        recorder: impl Fn(&T) -> Option<Message> + Send + Sync + 'static,
    ) -> Self {
        Self {
            manager,
            recorder: Arc::new(recorder),
        }
    }

    pub fn manager(&self) -> &Arc<HistoryManager> {
        &self.manager
    }
}

impl<T> Clone for HistoryBinding<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            recorder: Arc::clone(&self.recorder),
        }
    }
}

impl<T> fmt::Debug for HistoryBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryBinding")
            .field("messages", &self.manager.len())
            .finish()
    }
}

/// Aggregated statistics from every pipeline component
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub circuit_breaker: CircuitBreakerStats,
    pub timeout: TimeoutStats,
    pub history: Option<HistoryStats>,
}

/// Builder for [`ResiliencePipeline`]
pub struct PipelineBuilder<T> {
    config: ResilienceConfig,
    name: String,
    breaker: Option<Arc<CircuitBreaker>>,
    validator: Option<ResponseValidator<T>>,
    history: Option<HistoryBinding<T>>,
}

impl<T> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PipelineBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            name: "resilience".to_string(),
            breaker: None,
            validator: None,
            history: None,
        }
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used for the breaker constructed by `build`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Share one breaker across several pipelines protecting the same
    /// upstream.
    pub fn shared_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn validator(mut self, validator: ResponseValidator<T>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn history(mut self, binding: HistoryBinding<T>) -> Self {
        self.history = Some(binding);
        self
    }

    pub fn build(self) -> ResiliencePipeline<T> {
        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => Arc::new(CircuitBreaker::named(
                self.name,
                self.config.circuit_breaker.clone(),
            )),
        };

        ResiliencePipeline {
            retry: RetryExecutor::new(self.config.retry.clone()),
            timeout: Arc::new(TimeoutController::new(self.config.timeout.clone())),
            breaker,
            validator: self.validator.map(Arc::new),
            history: self.history,
            config: self.config,
        }
    }
}

/// Composable protection around an async operation
pub struct ResiliencePipeline<T> {
    config: ResilienceConfig,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    timeout: Arc<TimeoutController>,
    validator: Option<Arc<ResponseValidator<T>>>,
    history: Option<HistoryBinding<T>>,
}

impl<T> fmt::Debug for ResiliencePipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("breaker", &self.breaker.name())
            .field("validator", &self.validator.is_some())
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl<T> ResiliencePipeline<T> {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::new()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn history(&self) -> Option<&Arc<HistoryManager>> {
        self.history.as_ref().map(HistoryBinding::manager)
    }

    /// Statistics snapshot across all components
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            circuit_breaker: self.breaker.stats(),
            timeout: self.timeout.stats(),
            history: self
                .history
                .as_ref()
                .map(|binding| binding.manager().stats()),
        }
    }

    /// Spawn the periodic pruning task for the breaker window and the
    /// adaptive-timeout sample cache.
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let breaker = Arc::clone(&self.breaker);
        let timeout = Arc::clone(&self.timeout);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                breaker.prune_window();
                timeout.prune_signatures();
            }
        })
    }

    /// Run one operation through every protection layer.
    ///
    /// Always resolves to an [`EnhancedResult`]; classified failures are
    /// folded into it rather than returned as `Err`.
    pub async fn execute<F, Fut>(&self, request: PipelineRequest, operation: F) -> EnhancedResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let attempts = Arc::new(AtomicU32::new(0));

        let retry = self.retry.clone();
        let timeout = Arc::clone(&self.timeout);
        let ctx = request.ctx.clone();
        let hints = request.hints.clone();
        let cancellation = request.cancellation.clone();
        let counter = Arc::clone(&attempts);

        let composed = self
            .breaker
            .execute(&request.ctx, move || async move {
                let wrapped = move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    operation()
                };
                let retry_ctx = ctx.clone();
                let outcome = timeout
                    .execute(&ctx, &hints, cancellation, move || async move {
                        retry.execute(&retry_ctx, wrapped).await
                    })
                    .await;

                if outcome.timed_out {
                    return Err(PipelineError::TimedOut {
                        elapsed: outcome.duration,
                        timeout_used: outcome.timeout_used,
                    });
                }
                match outcome.result {
                    Some(Ok(success)) => Ok(success),
                    Some(Err(err)) => Err(PipelineError::from(err)),
                    // the race either completes or times out
                    None => Err(PipelineError::TimedOut {
                        elapsed: outcome.duration,
                        timeout_used: outcome.timeout_used,
                    }),
                }
            })
            .await;

        let (data, error) = match composed {
            Ok(outcome) => (Some(outcome.value), None),
            Err(CircuitBreakerError::Open { retry_in }) => {
                (None, Some(PipelineError::CircuitOpen { retry_in }))
            }
            Err(CircuitBreakerError::Operation(err)) => (None, Some(err)),
        };

        let mut fallback_applied = false;
        let mut fallback_strategy = None;
        let mut validation_score = None;
        let mut tokens_used = None;

        let data = match data {
            Some(value) => {
                let value = match &self.validator {
                    Some(validator) if self.config.enable_validation => {
                        let (value, recovery) = validator.validate_and_recover(
                            value,
                            &request.ctx,
                            self.config.enable_fallbacks,
                        );
                        fallback_applied = recovery.recovered;
                        fallback_strategy = recovery.strategy;
                        validation_score = Some(recovery.validation.score);
                        value
                    }
                    _ => value,
                };

                // the conversation records what the caller actually receives
                if let Some(binding) = &self.history {
                    if let Some(message) = (binding.recorder)(&value) {
                        let estimator = binding.manager.config().token_estimator;
                        tokens_used = Some(estimator.estimate(&message.content));
                        if let Some(truncation) = binding.manager.add_message(message) {
                            debug!(
                                correlation_id = %request.ctx.correlation_id,
                                removed = truncation.removed_messages,
                                "History truncated after response append"
                            );
                        }
                    }
                }
                Some(value)
            }
            None => None,
        };

        let metadata = ResultMetadata {
            correlation_id: request.ctx.correlation_id.clone(),
            duration: started.elapsed(),
            retry_count: attempts.load(Ordering::SeqCst),
            circuit_state: self.breaker.state(),
            fallback_applied,
            fallback_strategy,
            validation_score,
            tokens_used,
        };

        match &error {
            None => info!(
                correlation_id = %metadata.correlation_id,
                duration_ms = metadata.duration.as_millis() as u64,
                retry_count = metadata.retry_count,
                fallback_applied = metadata.fallback_applied,
                "Pipeline call succeeded"
            ),
            Some(err) => warn!(
                correlation_id = %metadata.correlation_id,
                duration_ms = metadata.duration.as_millis() as u64,
                retry_count = metadata.retry_count,
                circuit_state = %metadata.circuit_state,
                error = %err,
                "Pipeline call failed"
            ),
        }

        EnhancedResult {
            success: error.is_none(),
            data,
            error,
            metadata,
        }
    }
}
