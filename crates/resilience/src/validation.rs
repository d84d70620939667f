//! Response Validation and Recovery Implementation
//!
//! Runs registered rules against an operation's result and, when the result
//! is invalid, substitutes a fallback value from the highest-priority
//! matching strategy. Validation issues are data, not errors; nothing here
//! makes a call fail.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use common::LogContext;

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

/// One failed rule
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// Name of the rule that produced this issue
    pub rule: String,
    pub message: String,
    pub severity: Severity,
}

/// Outcome of running every registered rule
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// True exactly when no error-severity issues were found
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// 100 minus 20 per error and 5 per warning, floored at 0
    pub score: u8,
}

impl ValidationResult {
    fn from_issues(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        let penalty = errors.len() as u32 * 20 + warnings.len() as u32 * 5;
        let score = 100u32.saturating_sub(penalty) as u8;
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            score,
        }
    }
}

type RuleCheck<R> = Arc<dyn Fn(&R) -> anyhow::Result<bool> + Send + Sync>;

/// A named predicate over the response
pub struct ValidationRule<R> {
    pub name: String,
    pub message: String,
    pub severity: Severity,
    check: RuleCheck<R>,
}

impl<R> ValidationRule<R> {
    pub fn new(
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        check: impl Fn(&R) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            severity,
            check: Arc::new(check),
        }
    }

    /// Rule whose failure makes the response invalid
    pub fn error(
        name: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&R) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, Severity::Error, message, check)
    }

    /// Rule whose failure only lowers the score
    pub fn warning(
        name: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&R) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, Severity::Warning, message, check)
    }
}

impl<R> Clone for ValidationRule<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            message: self.message.clone(),
            severity: self.severity,
            check: Arc::clone(&self.check),
        }
    }
}

impl<R> fmt::Debug for ValidationRule<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish()
    }
}

type FallbackCondition<R> = Arc<dyn Fn(&R, &[ValidationIssue]) -> bool + Send + Sync>;
type FallbackGenerate<R> = Arc<dyn Fn(&R, &LogContext) -> anyhow::Result<R> + Send + Sync>;

/// A replacement-value generator tried when validation fails
pub struct FallbackStrategy<R> {
    pub name: String,
    /// Higher priority strategies are tried first
    pub priority: u32,
    condition: FallbackCondition<R>,
    generate: FallbackGenerate<R>,
}

impl<R> FallbackStrategy<R> {
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        condition: impl Fn(&R, &[ValidationIssue]) -> bool + Send + Sync + 'static,
        generate: impl Fn(&R, &LogContext) -> anyhow::Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            condition: Arc::new(condition),
            generate: Arc::new(generate),
        }
    }
}

impl<R> Clone for FallbackStrategy<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            priority: self.priority,
            condition: Arc::clone(&self.condition),
            generate: Arc::clone(&self.generate),
        }
    }
}

impl<R> fmt::Debug for FallbackStrategy<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// What recovery did to an invalid response
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// True when a fallback replaced the response
    pub recovered: bool,
    /// Name of the strategy that produced the replacement
    pub strategy: Option<String>,
    /// Validation of the response actually returned to the caller
    pub validation: ValidationResult,
    /// Fallback generations attempted, including failed ones
    pub attempts: u32,
}

/// Rule registry plus fallback strategies for one response type
pub struct ResponseValidator<R> {
    rules: Vec<ValidationRule<R>>,
    fallbacks: Vec<FallbackStrategy<R>>,
}

impl<R> Default for ResponseValidator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for ResponseValidator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseValidator")
            .field("rules", &self.rules.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl<R> ResponseValidator<R> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    /// Register a rule (builder style)
    pub fn rule(mut self, rule: ValidationRule<R>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Register a fallback strategy (builder style)
    pub fn fallback(mut self, strategy: FallbackStrategy<R>) -> Self {
        self.fallbacks.push(strategy);
        // keep descending priority, stable for equal priorities
        self.fallbacks.sort_by(|a, b| b.priority.cmp(&a.priority));
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn fallback_count(&self) -> usize {
        self.fallbacks.len()
    }

    /// Run every registered rule against the response.
    ///
    /// A rule that fails to evaluate counts as an error-severity issue.
    pub fn validate(&self, response: &R) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for rule in &self.rules {
            match (rule.check)(response) {
                Ok(true) => {}
                Ok(false) => {
                    let issue = ValidationIssue {
                        rule: rule.name.clone(),
                        message: rule.message.clone(),
                        severity: rule.severity,
                    };
                    match rule.severity {
                        Severity::Error => errors.push(issue),
                        Severity::Warning => warnings.push(issue),
                    }
                }
                Err(err) => {
                    errors.push(ValidationIssue {
                        rule: rule.name.clone(),
                        message: format!("Rule evaluation failed: {err}"),
                        severity: Severity::Error,
                    });
                }
            }
        }

        ValidationResult::from_issues(errors, warnings)
    }

    /// Validate and, when invalid, try to substitute a fallback response.
    ///
    /// Strategies run in descending priority order; the first whose condition
    /// matches and whose generator succeeds wins. A fallback is applied at
    /// most once per call, and its output is re-validated so the returned
    /// [`RecoveryResult`] describes the response the caller actually gets.
    pub fn validate_and_recover(
        &self,
        response: R,
        ctx: &LogContext,
        enable_fallbacks: bool,
    ) -> (R, RecoveryResult) {
        let validation = self.validate(&response);

        if validation.is_valid {
            debug!(
                correlation_id = %ctx.correlation_id,
                score = validation.score,
                "Response passed validation"
            );
            return (
                response,
                RecoveryResult {
                    recovered: false,
                    strategy: None,
                    validation,
                    attempts: 0,
                },
            );
        }

        warn!(
            correlation_id = %ctx.correlation_id,
            errors = validation.errors.len(),
            warnings = validation.warnings.len(),
            score = validation.score,
            "Response failed validation"
        );

        if !enable_fallbacks {
            return (
                response,
                RecoveryResult {
                    recovered: false,
                    strategy: None,
                    validation,
                    attempts: 0,
                },
            );
        }

        let mut attempts = 0u32;
        for strategy in &self.fallbacks {
            if !(strategy.condition)(&response, &validation.errors) {
                continue;
            }
            attempts += 1;
            match (strategy.generate)(&response, ctx) {
                Ok(replacement) => {
                    let revalidated = self.validate(&replacement);
                    info!(
                        correlation_id = %ctx.correlation_id,
                        strategy = %strategy.name,
                        score = revalidated.score,
                        "Fallback response applied"
                    );
                    return (
                        replacement,
                        RecoveryResult {
                            recovered: true,
                            strategy: Some(strategy.name.clone()),
                            validation: revalidated,
                            attempts,
                        },
                    );
                }
                Err(err) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        strategy = %strategy.name,
                        error = %err,
                        "Fallback generation failed, trying next strategy"
                    );
                }
            }
        }

        (
            response,
            RecoveryResult {
                recovered: false,
                strategy: None,
                validation,
                attempts,
            },
        )
    }
}
