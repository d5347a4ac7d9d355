// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the pipeline.
// Designed for:
// - Clear error categorization
// - Recovery strategy hints
// - Local recovery of per-record failures
// ============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use dashmap::DashMap;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Pipeline Errors
// ----------------------------------------------------------------------------

/// The main error type for the pipeline.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Per-record Processing Errors ----
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    // ---- Resource Pressure ----
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl PipelineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Config(_) => false,
            PipelineError::Processing(_) => true,
            PipelineError::Resource(e) => e.is_recoverable(),
            PipelineError::Io(_) => true,
            PipelineError::Internal(_) => false,
            PipelineError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Processing(_) => "processing",
            PipelineError::Resource(_) => "resource",
            PipelineError::Io(_) => "io",
            PipelineError::Internal(_) => "internal",
            PipelineError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PipelineError::Config(_) => RecoveryHint::FixConfiguration,
            PipelineError::Processing(e) => e.recovery_hint(),
            PipelineError::Resource(e) => e.recovery_hint(),
            PipelineError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Run the self-healing action sequence
    SelfHeal,
    /// Fix configuration and restart
    FixConfiguration,
    /// Pass the record through unmodified and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
/// Fatal at startup; never raised while records are flowing.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Invalid pattern '{name}': {message}")]
    InvalidPattern { name: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidRule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    pub fn invalid_pattern(name: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidPattern {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigError::ValidationFailed {
            message: errors.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Processing Errors
// ----------------------------------------------------------------------------

/// A single record failed to parse or evaluate. Always recovered locally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error("Malformed {dialect} plan: {message}")]
    MalformedPlan { dialect: &'static str, message: String },

    #[error("Plan payload of {size} bytes exceeds limit of {limit} bytes")]
    PlanTooLarge { size: usize, limit: usize },

    #[error("Plan parsing exceeded {timeout_ms}ms")]
    ParseTimeout { timeout_ms: u64 },

    #[error("Unsupported plan dialect: {dialect}")]
    UnsupportedDialect { dialect: String },

    #[error("Field '{field}' of {size} bytes exceeds scan limit")]
    FieldTooLarge { field: String, size: usize },

    #[error("Evaluation failed: {message}")]
    Evaluation { message: String },
}

impl ProcessingError {
    pub fn malformed_plan(dialect: &'static str, message: impl Into<String>) -> Self {
        ProcessingError::MalformedPlan {
            dialect,
            message: message.into(),
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::MalformedPlan { .. } => "malformed",
            ProcessingError::PlanTooLarge { .. } => "too_large",
            ProcessingError::ParseTimeout { .. } => "timeout",
            ProcessingError::UnsupportedDialect { .. } => "unsupported_dialect",
            ProcessingError::FieldTooLarge { .. } => "field_too_large",
            ProcessingError::Evaluation { .. } => "evaluation",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        RecoveryHint::Skip
    }
}

// ----------------------------------------------------------------------------
// Resource Errors
// ----------------------------------------------------------------------------

/// Resource pressure detected by health monitoring.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("Memory pressure: {used_percent:.1}% used (threshold {threshold:.1}%)")]
    MemoryPressure { used_percent: f64, threshold: f64 },

    #[error("CPU pressure: {used_percent:.1}% used (threshold {threshold:.1}%)")]
    CpuPressure { used_percent: f64, threshold: f64 },

    #[error("Recovery action '{action}' failed: {message}")]
    RecoveryActionFailed { action: String, message: String },

    #[error("Recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
}

impl ResourceError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ResourceError::RecoveryExhausted { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ResourceError::RecoveryExhausted { .. } => RecoveryHint::AlertOperator,
            ResourceError::RecoveryActionFailed { .. } => RecoveryHint::RetryWithBackoff,
            _ => RecoveryHint::SelfHeal,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ProcessingResult<T> = Result<T, ProcessingError>;

// ----------------------------------------------------------------------------
// Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    by_category: DashMap<&'static str, AtomicU64>,
    recoverable_count: AtomicU64,
    non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &PipelineError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories_and_hints() {
        let config: PipelineError = ConfigError::invalid_value("sampler.default_sample_rate", "out of range").into();
        assert!(!config.is_recoverable());
        assert_eq!(config.category(), "config");
        assert_eq!(config.recovery_hint(), RecoveryHint::FixConfiguration);

        let processing: PipelineError = ProcessingError::malformed_plan("postgresql", "eof").into();
        assert!(processing.is_recoverable());
        assert_eq!(processing.recovery_hint(), RecoveryHint::Skip);

        let exhausted: PipelineError = ResourceError::RecoveryExhausted { attempts: 3 }.into();
        assert!(!exhausted.is_recoverable());
        assert_eq!(exhausted.recovery_hint(), RecoveryHint::AlertOperator);
    }

    #[test]
    fn test_error_stats() {
        let stats = ErrorStats::new();
        stats.record(&ProcessingError::ParseTimeout { timeout_ms: 100 }.into());
        stats.record(&ProcessingError::ParseTimeout { timeout_ms: 100 }.into());
        stats.record(&ConfigError::missing_field("x").into());

        assert_eq!(stats.total_errors(), 3);
        assert_eq!(stats.count_by_category("processing"), 2);
        assert_eq!(stats.count_by_category("config"), 1);
        assert_eq!(stats.count_by_category("io"), 0);
    }
}
