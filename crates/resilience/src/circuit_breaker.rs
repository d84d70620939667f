//! Circuit Breaker Implementation
//!
//! Gates a remote operation behind a three-state machine so a failing
//! dependency gets room to recover instead of being hammered by every
//! caller at once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use common::LogContext;

/// Circuit breaker errors
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected fast, the operation was never invoked
    #[error("Circuit breaker is open - retry in {retry_in:?}")]
    Open { retry_in: Duration },

    /// The operation ran and failed; the failure was recorded
    #[error("Operation failed: {0}")]
    Operation(E),
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Circuit is closed, requests flow through normally
    Closed,

    /// Circuit is open, requests are rejected
    Open,

    /// Circuit is half-open, probing whether the service recovered
    HalfOpen,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time to wait in open state before probing recovery
    pub recovery_timeout: Duration,

    /// Window for the rolling failure-rate metric
    pub monitoring_period: Duration,

    /// Consecutive successes needed to close the circuit from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// Statistics snapshot for circuit breaker operations
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    /// Consecutive failures in the current closed period
    pub failure_count: u32,
    /// Consecutive successes in the current half-open period
    pub success_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub state_transitions: u64,
    /// Failure rate over the monitoring window, 0.0 when the window is empty
    pub failure_rate: f64,
    /// Outcomes currently inside the monitoring window
    pub window_requests: usize,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub time_in_state: Duration,
}

/// Request outcome kept in the rolling window
#[derive(Debug, Clone, Copy)]
struct RequestOutcome {
    timestamp: Instant,
    success: bool,
}

/// Mutable breaker state, always mutated as one critical section
#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    state_transitions: u64,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    last_state_change: Instant,
    next_attempt_at: Option<Instant>,
    window: VecDeque<RequestOutcome>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            state_transitions: 0,
            last_failure_at: None,
            last_success_at: None,
            last_state_change: Instant::now(),
            next_attempt_at: None,
            window: VecDeque::new(),
        }
    }
}

/// Circuit breaker implementation
///
/// One instance is expected to live for the process lifetime and be shared
/// (via `Arc`) across every in-flight call that targets the same dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::named("default", config)
    }

    /// Create a named circuit breaker, the name shows up in every log record
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Execute an operation under the breaker.
    ///
    /// An open circuit rejects the call without invoking the operation;
    /// otherwise the outcome is recorded and drives the state machine.
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &LogContext,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_in) = self.acquire() {
            warn!(
                breaker = %self.name,
                correlation_id = %ctx.correlation_id,
                retry_in_ms = retry_in.as_millis() as u64,
                "Circuit breaker rejected call"
            );
            return Err(CircuitBreakerError::Open { retry_in });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(ctx),
            Err(_) => self.record_failure(ctx),
        }
        result.map_err(CircuitBreakerError::Operation)
    }

    /// Check whether the breaker currently admits a call.
    ///
    /// Counts the check as a request, exactly like `execute` does. Intended
    /// for callers running the manual `can_execute` / `record_*` protocol.
    pub fn can_execute(&self) -> bool {
        self.acquire().is_ok()
    }

    /// Gate check. Performs the lazy open -> half-open transition.
    fn acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.prune_locked(&mut inner, now);

        if inner.state == CircuitBreakerState::Open {
            let ready = inner.next_attempt_at.map(|at| now >= at).unwrap_or(true);
            if ready {
                self.transition(&mut inner, CircuitBreakerState::HalfOpen, now);
            } else {
                let retry_in = inner
                    .next_attempt_at
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or(self.config.recovery_timeout);
                inner.total_requests += 1;
                inner.rejected_requests += 1;
                return Err(retry_in);
            }
        }

        inner.total_requests += 1;
        Ok(())
    }

    /// Record a successful operation
    pub fn record_success(&self, ctx: &LogContext) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.window.push_back(RequestOutcome {
            timestamp: now,
            success: true,
        });
        self.prune_locked(&mut inner, now);
        inner.successful_requests += 1;
        inner.last_success_at = Some(now);

        match inner.state {
            CircuitBreakerState::Closed => {
                // A success interrupts the failure streak
                inner.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    breaker = %self.name,
                    correlation_id = %ctx.correlation_id,
                    successes = inner.success_count,
                    needed = self.config.success_threshold,
                    "Recovery probe succeeded"
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Closed, now);
                }
            }
            CircuitBreakerState::Open => {
                // Possible when a slow call settles after the circuit tripped
                warn!(
                    breaker = %self.name,
                    correlation_id = %ctx.correlation_id,
                    "Recorded success while circuit is open"
                );
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self, ctx: &LogContext) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.window.push_back(RequestOutcome {
            timestamp: now,
            success: false,
        });
        self.prune_locked(&mut inner, now);
        inner.failed_requests += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count += 1;
                debug!(
                    breaker = %self.name,
                    correlation_id = %ctx.correlation_id,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "Recorded failed operation"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open, now);
                }
            }
            CircuitBreakerState::HalfOpen => {
                // One failed probe sends the circuit straight back to open
                self.transition(&mut inner, CircuitBreakerState::Open, now);
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Get the current state without touching the state machine
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Force the circuit open; it recovers through the normal timeout path
    pub fn force_open(&self) {
        info!(breaker = %self.name, "Forcing circuit breaker open");
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.transition(&mut inner, CircuitBreakerState::Open, now);
    }

    /// Force the circuit closed
    pub fn force_close(&self) {
        info!(breaker = %self.name, "Forcing circuit breaker closed");
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.transition(&mut inner, CircuitBreakerState::Closed, now);
    }

    /// Reset to closed with all counters and the window cleared
    pub fn reset(&self) {
        debug!(breaker = %self.name, "Resetting circuit breaker");
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
    }

    /// Drop window entries older than the monitoring period.
    ///
    /// The per-call paths prune inline; this entry point exists for the
    /// periodic maintenance task so an idle breaker does not report a stale
    /// failure rate.
    pub fn prune_window(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.prune_locked(&mut inner, now);
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.prune_locked(&mut inner, now);

        let window_requests = inner.window.len();
        let failures_in_window = inner.window.iter().filter(|o| !o.success).count();
        let failure_rate = if window_requests == 0 {
            0.0
        } else {
            failures_in_window as f64 / window_requests as f64
        };

        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            rejected_requests: inner.rejected_requests,
            state_transitions: inner.state_transitions,
            failure_rate,
            window_requests,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            time_in_state: now.saturating_duration_since(inner.last_state_change),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker name as it appears in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitBreakerState, now: Instant) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        inner.state_transitions += 1;
        inner.last_state_change = now;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt_at = match next {
            CircuitBreakerState::Open => Some(now + self.config.recovery_timeout),
            _ => None,
        };

        match next {
            CircuitBreakerState::Open => warn!(
                breaker = %self.name,
                from = %previous,
                "Circuit breaker opened - rejecting requests"
            ),
            CircuitBreakerState::HalfOpen => info!(
                breaker = %self.name,
                from = %previous,
                "Circuit breaker half-open - probing recovery"
            ),
            CircuitBreakerState::Closed => info!(
                breaker = %self.name,
                from = %previous,
                "Circuit breaker closed - service recovered"
            ),
        }
    }

    fn prune_locked(&self, inner: &mut BreakerInner, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.config.monitoring_period) {
            while inner
                .window
                .front()
                .map_or(false, |o| o.timestamp < cutoff)
            {
                inner.window.pop_front();
            }
        }
    }
}
