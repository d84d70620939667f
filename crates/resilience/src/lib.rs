//! Resilience Pipeline for Async Remote Operations
//!
//! Wraps an arbitrary asynchronous operation (an LLM API call, an HTTP
//! upstream, anything awaitable that can fail) with layered protection:
//!
//! - **CircuitBreaker**: fails fast while an upstream is struggling
//! - **RetryExecutor**: exponential backoff with jitter for transient failures
//! - **TimeoutController**: computed deadlines that adapt to request shape
//! - **HistoryManager**: bounded conversation buffer with token accounting
//! - **ResponseValidator**: rule checks with fallback recovery
//! - **ResiliencePipeline**: composes all of the above around one call
//!
//! # Usage
//!
//! ```no_run
//! use resilience::{OperationError, PipelineRequest, ResilienceConfig, ResiliencePipeline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline: ResiliencePipeline<String> =
//!         ResiliencePipeline::new(ResilienceConfig::production());
//!
//!     let result = pipeline
//!         .execute(PipelineRequest::new(), || async {
//!             // call the real upstream here
//!             Ok::<_, OperationError>("hello".to_string())
//!         })
//!         .await;
//!
//!     if result.success {
//!         println!("{}", result.data.unwrap_or_default());
//!     }
//! }
//! ```
//!
//! Components are usable on their own; the pipeline is just the composition
//! most callers want.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod retry;
pub mod timeout;
pub mod validation;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerState,
    CircuitBreakerStats,
};
pub use config::{ProfileError, ResilienceConfig};
pub use error::{ErrorKind, OperationError, PipelineError};
pub use history::{
    HistoryConfig, HistoryManager, HistoryStats, Message, MessageRole, TokenCount, TokenEstimator,
    TruncationResult, TruncationStrategy,
};
pub use pipeline::{
    EnhancedResult, HistoryBinding, PipelineBuilder, PipelineRequest, PipelineStats,
    ResiliencePipeline, ResultMetadata,
};
pub use retry::{RetryError, RetryExecutor, RetryOutcome, RetryPolicy};
pub use timeout::{
    ComplexityHints, ModelClass, TimeoutConfig, TimeoutController, TimeoutOutcome, TimeoutStats,
};
pub use validation::{
    FallbackStrategy, RecoveryResult, ResponseValidator, Severity, ValidationIssue,
    ValidationResult, ValidationRule,
};
