// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Typed configuration for every stage with:
// - TOML file parsing
// - Environment variable overrides (DBINTEL_SECTION__FIELD)
// - Validation at load time (invalid values are fatal at startup)
// - Sensible defaults
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ConfigError, ConfigResult};
use crate::rules::Condition;
use crate::types::ValueKind;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "DBINTEL_";

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// General pipeline settings
    #[serde(default)]
    pub pipeline: GeneralConfig,

    /// Per-database circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Adaptive sampler with deduplication
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Query plan attribute extraction and regression detection
    #[serde(default)]
    pub plan_extractor: PlanExtractorConfig,

    /// Quality, PII, health, tuning and healing
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Load from a TOML string
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.pipeline.validate()?;
        self.circuit_breaker.validate()?;
        self.sampler.validate()?;
        self.plan_extractor.validate()?;
        self.verification.validate()?;
        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn require_positive(field: &str, value: f64) -> ConfigResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be positive, got {}", value)))
    }
}

fn require_fraction(field: &str, value: f64) -> ConfigResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be within [0, 1], got {}", value)))
    }
}

fn require_nonzero_duration(field: &str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        Err(ConfigError::invalid_value(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// General Pipeline Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// How long background tasks get to stop before being aborted
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace_period: Duration,

    /// Number of lock shards in the bounded caches
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_grace_period: default_shutdown_grace(),
            cache_shards: default_cache_shards(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.cache_shards == 0 || self.cache_shards > 1024 {
            return Err(ConfigError::invalid_value(
                "pipeline.cache_shards",
                "must be between 1 and 1024",
            ));
        }
        require_nonzero_duration("pipeline.shutdown_grace_period", self.shutdown_grace_period)
    }
}

fn default_instance_name() -> String {
    "dbintel".into()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_shards() -> usize {
    16
}

// ----------------------------------------------------------------------------
// Circuit Breaker Configuration
// ----------------------------------------------------------------------------

/// How a classified error affects a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorImpact {
    /// Opens the circuit immediately.
    Severe,
    /// Counts one failure toward the threshold.
    Counted,
    /// Logged only; never changes circuit state.
    Transient,
}

impl ErrorImpact {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorImpact::Severe => "severe",
            ErrorImpact::Counted => "counted",
            ErrorImpact::Transient => "transient",
        }
    }
}

/// One entry of the error classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPatternConfig {
    pub name: String,
    /// Case-insensitive substring matched against the error text
    pub pattern: String,
    pub impact: ErrorImpact,
}

impl ErrorPatternConfig {
    pub fn new(name: &str, pattern: &str, impact: ErrorImpact) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            impact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attribute naming the logical source a circuit is kept for
    #[serde(default = "default_key_attribute")]
    pub key_attribute: String,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,

    /// Failures older than this no longer count toward the threshold
    #[serde(default = "default_failure_window", with = "humantime_serde")]
    pub failure_window: Duration,

    #[serde(default = "default_open_state_timeout", with = "humantime_serde")]
    pub open_state_timeout: Duration,

    /// Upper bound for the adaptive open timeout
    #[serde(default = "default_max_open_timeout", with = "humantime_serde")]
    pub max_open_timeout: Duration,

    #[serde(default = "default_true")]
    pub adaptive_timeout: bool,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_recovery_multiplier")]
    pub recovery_multiplier: f64,

    /// Error rate above which a failed half-open trial lengthens the timeout
    #[serde(default = "default_high_error_rate")]
    pub high_error_rate: f64,

    /// Smoothing factor of the decaying error rate
    #[serde(default = "default_error_rate_alpha")]
    pub error_rate_alpha: f64,

    #[serde(default = "default_error_patterns")]
    pub error_patterns: Vec<ErrorPatternConfig>,

    #[serde(default)]
    pub resource: ResourceGuardConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_attribute: default_key_attribute(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            half_open_max_requests: default_half_open_max_requests(),
            failure_window: default_failure_window(),
            open_state_timeout: default_open_state_timeout(),
            max_open_timeout: default_max_open_timeout(),
            adaptive_timeout: true,
            backoff_multiplier: default_backoff_multiplier(),
            recovery_multiplier: default_recovery_multiplier(),
            high_error_rate: default_high_error_rate(),
            error_rate_alpha: default_error_rate_alpha(),
            error_patterns: default_error_patterns(),
            resource: ResourceGuardConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.key_attribute.is_empty() {
            return Err(ConfigError::missing_field("circuit_breaker.key_attribute"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.failure_threshold",
                "must be positive",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.success_threshold",
                "must be positive",
            ));
        }
        if self.half_open_max_requests == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.half_open_max_requests",
                "must be positive",
            ));
        }
        if self.half_open_max_requests < self.success_threshold {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.half_open_max_requests",
                "must be at least success_threshold",
            ));
        }
        require_nonzero_duration("circuit_breaker.failure_window", self.failure_window)?;
        require_nonzero_duration("circuit_breaker.open_state_timeout", self.open_state_timeout)?;
        if self.open_state_timeout > self.max_open_timeout {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.open_state_timeout",
                "must not exceed max_open_timeout",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if !(self.recovery_multiplier > 0.0 && self.recovery_multiplier <= 1.0) {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.recovery_multiplier",
                "must be within (0, 1]",
            ));
        }
        require_fraction("circuit_breaker.high_error_rate", self.high_error_rate)?;
        require_fraction("circuit_breaker.error_rate_alpha", self.error_rate_alpha)?;
        for pattern in &self.error_patterns {
            if pattern.name.is_empty() || pattern.pattern.is_empty() {
                return Err(ConfigError::invalid_pattern(
                    pattern.name.clone(),
                    "error patterns need a name and a non-empty pattern",
                ));
            }
        }
        Validate::validate(&self.resource)?;
        Ok(())
    }
}

/// Process-wide load shedding thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResourceGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_resource_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    #[validate(range(min = 1))]
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    #[validate(range(min = 1.0, max = 100.0))]
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f64,

    /// Shedding stops once readings fall below this share of the thresholds
    #[validate(range(min = 0.1, max = 1.0))]
    #[serde(default = "default_recovery_ratio")]
    pub recovery_ratio: f64,
}

impl Default for ResourceGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_resource_interval(),
            memory_threshold_mb: default_memory_threshold_mb(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
            recovery_ratio: default_recovery_ratio(),
        }
    }
}

fn default_key_attribute() -> String {
    "database_name".into()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_half_open_max_requests() -> u32 {
    3
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

fn default_open_state_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_open_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_recovery_multiplier() -> f64 {
    0.5
}

fn default_high_error_rate() -> f64 {
    0.5
}

fn default_error_rate_alpha() -> f64 {
    0.2
}

fn default_error_patterns() -> Vec<ErrorPatternConfig> {
    use ErrorImpact::*;
    vec![
        ErrorPatternConfig::new("cardinality", "cardinality", Severe),
        ErrorPatternConfig::new("integration_error", "NrIntegrationError", Severe),
        ErrorPatternConfig::new("api_key", "api-key", Severe),
        ErrorPatternConfig::new("permission", "permission denied", Severe),
        ErrorPatternConfig::new("quota", "quota exceeded", Severe),
        ErrorPatternConfig::new("unique_series", "unique time series", Severe),
        ErrorPatternConfig::new("rate_limit", "rate limit", Counted),
        ErrorPatternConfig::new("connection", "connection refused", Counted),
        ErrorPatternConfig::new("timeout", "context deadline exceeded", Transient),
        ErrorPatternConfig::new("not_found", "not found", Transient),
    ]
}

fn default_resource_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_memory_threshold_mb() -> u64 {
    512
}

fn default_cpu_threshold_percent() -> f64 {
    80.0
}

fn default_recovery_ratio() -> f64 {
    0.9
}

// ----------------------------------------------------------------------------
// Adaptive Sampler Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SamplingRuleConfig {
    #[validate(length(min = 1))]
    pub name: String,

    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Expression over record attributes; absent means "always"
    #[serde(default)]
    pub condition: Option<String>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub sample_rate: f64,

    /// Token-bucket cap on matches kept per minute
    #[serde(default)]
    pub max_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dedup_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub window: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Attributes that make a record eligible for dedup and feed the
    /// fingerprint; records carrying none of them are never deduplicated.
    /// Empty means all attributes.
    #[serde(default = "default_fingerprint_attributes")]
    pub fingerprint_attributes: Vec<String>,

    /// Mixed into the fingerprint when present, so one plan seen for two
    /// queries stays two entries. Never enough on their own.
    #[serde(default = "default_scope_attributes")]
    pub scope_attributes: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: default_dedup_cache_size(),
            window: default_dedup_window(),
            sweep_interval: default_sweep_interval(),
            fingerprint_attributes: default_fingerprint_attributes(),
            scope_attributes: default_scope_attributes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sample_rate")]
    pub default_sample_rate: f64,

    #[serde(default = "default_sampling_rules")]
    pub rules: Vec<SamplingRuleConfig>,

    #[serde(default)]
    pub dedup: DedupConfig,

    /// Add `sampled` and `rule_name` to kept records
    #[serde(default = "default_true")]
    pub annotate: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_sample_rate: default_sample_rate(),
            rules: default_sampling_rules(),
            dedup: DedupConfig::default(),
            annotate: true,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_fraction("sampler.default_sample_rate", self.default_sample_rate)?;
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            Validate::validate(rule)
                .map_err(|e| ConfigError::invalid_rule(rule.name.clone(), e.to_string()))?;
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::invalid_rule(rule.name.clone(), "duplicate rule name"));
            }
            if rule.max_per_minute == Some(0) {
                return Err(ConfigError::invalid_rule(
                    rule.name.clone(),
                    "max_per_minute must be positive when set",
                ));
            }
            Condition::compile(&rule.name, rule.condition.as_deref())?;
        }
        if self.dedup.cache_size == 0 {
            return Err(ConfigError::invalid_value("sampler.dedup.cache_size", "must be positive"));
        }
        require_nonzero_duration("sampler.dedup.window", self.dedup.window)?;
        require_nonzero_duration("sampler.dedup.sweep_interval", self.dedup.sweep_interval)?;
        Ok(())
    }
}

fn default_sample_rate() -> f64 {
    0.1
}

fn default_dedup_cache_size() -> usize {
    10_000
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_fingerprint_attributes() -> Vec<String> {
    vec!["db.query.plan.hash".into(), "plan_json".into(), "db.plan.text".into()]
}

fn default_scope_attributes() -> Vec<String> {
    vec!["query_id".into(), "database_name".into()]
}

fn default_sampling_rules() -> Vec<SamplingRuleConfig> {
    vec![
        SamplingRuleConfig {
            name: "critical_queries".into(),
            priority: 100,
            condition: Some("avg_duration_ms > 1000".into()),
            sample_rate: 1.0,
            max_per_minute: None,
        },
        SamplingRuleConfig {
            name: "missing_indexes".into(),
            priority: 90,
            condition: Some("db.query.plan.has_seq_scan == true && db.query.plan.rows > 10000".into()),
            sample_rate: 1.0,
            max_per_minute: None,
        },
        SamplingRuleConfig {
            name: "high_frequency".into(),
            priority: 50,
            condition: Some("execution_count > 1000".into()),
            sample_rate: 0.01,
            max_per_minute: Some(10),
        },
    ]
}

// ----------------------------------------------------------------------------
// Plan Extractor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionConfig {
    #[serde(default = "default_time_ratio")]
    pub time_ratio: f64,

    #[serde(default = "default_io_ratio")]
    pub io_ratio: f64,

    #[serde(default = "default_cost_ratio")]
    pub cost_ratio: f64,

    /// Largest-ratio cut points for medium / high / critical severity
    #[serde(default = "default_medium_cut")]
    pub medium_at: f64,

    #[serde(default = "default_high_cut")]
    pub high_at: f64,

    #[serde(default = "default_critical_cut")]
    pub critical_at: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            time_ratio: default_time_ratio(),
            io_ratio: default_io_ratio(),
            cost_ratio: default_cost_ratio(),
            medium_at: default_medium_cut(),
            high_at: default_high_cut(),
            critical_at: default_critical_cut(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attributes whose SQL text has literals replaced
    #[serde(default = "default_anonymize_attributes")]
    pub attributes: Vec<String>,

    #[serde(default = "default_fingerprint_attribute")]
    pub fingerprint_attribute: String,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attributes: default_anonymize_attributes(),
            fingerprint_attribute: default_fingerprint_attribute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExtractorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attributes that may carry a plan payload, checked in order
    #[serde(default = "default_plan_attributes")]
    pub plan_attributes: Vec<String>,

    /// Attribute naming the database system (`postgresql`, `mysql`)
    #[serde(default = "default_dialect_attribute")]
    pub dialect_attribute: String,

    #[serde(default = "default_query_id_attribute")]
    pub query_id_attribute: String,

    #[serde(default = "default_exec_time_attribute")]
    pub exec_time_attribute: String,

    #[serde(default = "default_io_attribute")]
    pub io_attribute: String,

    #[serde(default = "default_max_plan_bytes")]
    pub max_plan_bytes: usize,

    #[serde(default = "default_parse_timeout", with = "humantime_serde")]
    pub parse_timeout: Duration,

    /// Distinct plans retained per query
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Queries tracked in the history cache
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_history_ttl", with = "humantime_serde")]
    pub history_ttl: Duration,

    #[serde(default = "default_history_sweep", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Row estimate above which a sequential scan counts as expensive
    #[serde(default = "default_large_table_rows")]
    pub large_table_rows: f64,

    #[serde(default = "default_high_cost_threshold")]
    pub high_cost_threshold: f64,

    #[serde(default)]
    pub regression: RegressionConfig,

    #[serde(default)]
    pub anonymize: AnonymizeConfig,
}

impl Default for PlanExtractorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plan_attributes: default_plan_attributes(),
            dialect_attribute: default_dialect_attribute(),
            query_id_attribute: default_query_id_attribute(),
            exec_time_attribute: default_exec_time_attribute(),
            io_attribute: default_io_attribute(),
            max_plan_bytes: default_max_plan_bytes(),
            parse_timeout: default_parse_timeout(),
            history_size: default_history_size(),
            history_capacity: default_history_capacity(),
            history_ttl: default_history_ttl(),
            sweep_interval: default_history_sweep(),
            large_table_rows: default_large_table_rows(),
            high_cost_threshold: default_high_cost_threshold(),
            regression: RegressionConfig::default(),
            anonymize: AnonymizeConfig::default(),
        }
    }
}

impl PlanExtractorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.plan_attributes.is_empty() {
            return Err(ConfigError::missing_field("plan_extractor.plan_attributes"));
        }
        if self.max_plan_bytes == 0 {
            return Err(ConfigError::invalid_value("plan_extractor.max_plan_bytes", "must be positive"));
        }
        require_nonzero_duration("plan_extractor.parse_timeout", self.parse_timeout)?;
        if self.parse_timeout > Duration::from_secs(10) {
            return Err(ConfigError::invalid_value(
                "plan_extractor.parse_timeout",
                "must not exceed 10s",
            ));
        }
        if self.history_size < 2 {
            return Err(ConfigError::invalid_value(
                "plan_extractor.history_size",
                "must retain at least 2 plans",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid_value("plan_extractor.history_capacity", "must be positive"));
        }
        require_nonzero_duration("plan_extractor.history_ttl", self.history_ttl)?;
        require_nonzero_duration("plan_extractor.sweep_interval", self.sweep_interval)?;
        require_positive("plan_extractor.large_table_rows", self.large_table_rows)?;
        require_positive("plan_extractor.high_cost_threshold", self.high_cost_threshold)?;

        let r = &self.regression;
        for (field, value) in [
            ("plan_extractor.regression.time_ratio", r.time_ratio),
            ("plan_extractor.regression.io_ratio", r.io_ratio),
            ("plan_extractor.regression.cost_ratio", r.cost_ratio),
        ] {
            if value <= 1.0 {
                return Err(ConfigError::invalid_value(field, "regression ratios must exceed 1.0"));
            }
        }
        if !(r.medium_at <= r.high_at && r.high_at <= r.critical_at) {
            return Err(ConfigError::invalid_value(
                "plan_extractor.regression",
                "severity cut points must be ascending",
            ));
        }
        if self.anonymize.enabled && self.anonymize.fingerprint_attribute.is_empty() {
            return Err(ConfigError::missing_field("plan_extractor.anonymize.fingerprint_attribute"));
        }
        Ok(())
    }
}

fn default_time_ratio() -> f64 {
    1.5
}

fn default_io_ratio() -> f64 {
    2.0
}

fn default_cost_ratio() -> f64 {
    2.0
}

fn default_medium_cut() -> f64 {
    2.0
}

fn default_high_cut() -> f64 {
    3.0
}

fn default_critical_cut() -> f64 {
    5.0
}

fn default_anonymize_attributes() -> Vec<String> {
    vec!["query_text".into()]
}

fn default_fingerprint_attribute() -> String {
    "db.query.fingerprint".into()
}

fn default_plan_attributes() -> Vec<String> {
    vec!["plan_json".into(), "db.plan.text".into()]
}

fn default_dialect_attribute() -> String {
    "db.system".into()
}

fn default_query_id_attribute() -> String {
    "query_id".into()
}

fn default_exec_time_attribute() -> String {
    "mean_exec_time_ms".into()
}

fn default_io_attribute() -> String {
    "shared_blks_read".into()
}

fn default_max_plan_bytes() -> usize {
    64 * 1024
}

fn default_parse_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_history_size() -> usize {
    10
}

fn default_history_capacity() -> usize {
    10_000
}

fn default_history_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_history_sweep() -> Duration {
    Duration::from_secs(300)
}

fn default_large_table_rows() -> f64 {
    10_000.0
}

fn default_high_cost_threshold() -> f64 {
    10_000.0
}

// ----------------------------------------------------------------------------
// Verification Configuration
// ----------------------------------------------------------------------------

/// What happens to a record that trips a quality rule or PII pattern.
/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    Alert,
    Redact,
    Drop,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementAction::Alert => "alert",
            EnforcementAction::Redact => "redact",
            EnforcementAction::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRuleConfig {
    pub name: String,
    /// Expression that must hold for the record to be valid
    pub condition: String,
    #[serde(default = "default_alert")]
    pub action: EnforcementAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_required_attributes")]
    pub required_attributes: Vec<String>,

    #[serde(default = "default_type_rules")]
    pub type_rules: BTreeMap<String, ValueKind>,

    #[serde(default = "default_cardinality_limits")]
    pub cardinality_limits: BTreeMap<String, usize>,

    #[serde(default = "default_true")]
    pub duplicate_detection: bool,

    #[serde(default = "default_duplicate_window", with = "humantime_serde")]
    pub duplicate_window: Duration,

    #[serde(default = "default_duplicate_cache_size")]
    pub duplicate_cache_size: usize,

    /// Action for built-in checks
    #[serde(default = "default_alert")]
    pub on_violation: EnforcementAction,

    #[serde(default)]
    pub rules: Vec<QualityRuleConfig>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_attributes: default_required_attributes(),
            type_rules: default_type_rules(),
            cardinality_limits: default_cardinality_limits(),
            duplicate_detection: true,
            duplicate_window: default_duplicate_window(),
            duplicate_cache_size: default_duplicate_cache_size(),
            on_violation: EnforcementAction::Alert,
            rules: Vec::new(),
        }
    }
}

/// Built-in PII pattern families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiPatternKind {
    Email,
    Ssn,
    CreditCard,
    Phone,
    Ipv4,
    /// User supplied regex
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiPatternConfig {
    pub name: String,
    pub kind: PiiPatternKind,
    /// Required for `custom`; overrides the built-in expression otherwise
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default = "default_alert")]
    pub action: EnforcementAction,
}

impl PiiPatternConfig {
    pub fn builtin(name: &str, kind: PiiPatternKind, action: EnforcementAction) -> Self {
        Self {
            name: name.into(),
            kind,
            regex: None,
            action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Text attributes scanned for PII
    #[serde(default = "default_pii_fields")]
    pub fields: Vec<String>,

    /// Scan every string attribute instead of `fields`
    #[serde(default)]
    pub scan_all_string_fields: bool,

    #[serde(default = "default_pii_exclude")]
    pub exclude_fields: Vec<String>,

    #[serde(default = "default_pii_patterns")]
    pub patterns: Vec<PiiPatternConfig>,

    #[serde(default = "default_placeholder")]
    pub redaction_placeholder: String,

    /// Fields longer than this are not scanned and raise an alert instead
    #[serde(default = "default_max_scan_bytes")]
    pub max_scan_bytes: usize,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fields: default_pii_fields(),
            scan_all_string_fields: false,
            exclude_fields: default_pii_exclude(),
            patterns: default_pii_patterns(),
            redaction_placeholder: default_placeholder(),
            max_scan_bytes: default_max_scan_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    #[validate(range(min = 1.0, max = 100.0))]
    #[serde(default = "default_memory_percent")]
    pub memory_percent: f64,

    #[validate(range(min = 1.0, max = 100.0))]
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: f64,

    #[validate(range(min = 1.0, max = 100.0))]
    #[serde(default = "default_disk_percent")]
    pub disk_percent: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_health_interval(),
            memory_percent: default_memory_percent(),
            cpu_percent: default_cpu_percent(),
            disk_percent: default_disk_percent(),
            error_rate: default_error_rate_threshold(),
        }
    }
}

/// Initial value and bounds of one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunableBoundsConfig {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
}

impl TunableBoundsConfig {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if !(self.min <= self.initial && self.initial <= self.max) || self.min <= 0.0 {
            return Err(ConfigError::invalid_value(
                field,
                "bounds must satisfy 0 < min <= initial <= max",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TuningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Apply recommendations; otherwise only report them
    #[serde(default = "default_true")]
    pub auto_apply: bool,

    #[serde(default = "default_analysis_interval", with = "humantime_serde")]
    pub analysis_interval: Duration,

    /// Samples that must be collected before a decision
    #[validate(range(min = 2, max = 1000))]
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[validate(range(min = 0.5, max = 1.0))]
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    #[serde(default = "default_max_change_percent")]
    pub max_change_percent: f64,

    #[serde(default = "default_sampling_scale_bounds")]
    pub sampling_scale: TunableBoundsConfig,

    #[serde(default = "default_batch_size_bounds")]
    pub batch_size: TunableBoundsConfig,

    #[serde(default = "default_collection_interval_bounds")]
    pub collection_interval_ms: TunableBoundsConfig,

    /// Share of admitted-or-rejected records rejected by open circuits that counts as pressure
    #[serde(default = "default_pressure_circuit_rate")]
    pub pressure_circuit_open_rate: f64,

    /// Share of records introducing a new tracked attribute value that counts as pressure
    #[serde(default = "default_pressure_cardinality")]
    pub pressure_cardinality_growth: f64,

    #[serde(default = "default_error_rate_threshold")]
    pub pressure_error_rate: f64,

    #[serde(default = "default_pressure_memory")]
    pub pressure_memory_percent: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_apply: true,
            analysis_interval: default_analysis_interval(),
            window_size: default_window_size(),
            confidence_threshold: default_confidence_threshold(),
            max_change_percent: default_max_change_percent(),
            sampling_scale: default_sampling_scale_bounds(),
            batch_size: default_batch_size_bounds(),
            collection_interval_ms: default_collection_interval_bounds(),
            pressure_circuit_open_rate: default_pressure_circuit_rate(),
            pressure_cardinality_growth: default_pressure_cardinality(),
            pressure_error_rate: default_error_rate_threshold(),
            pressure_memory_percent: default_pressure_memory(),
        }
    }
}

/// Ordered recovery steps of the self-healer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Sweep expired cache entries and release spare allocations
    ReleaseMemory,
    /// Empty dedup, plan history and duplicate caches
    ClearCaches,
    /// Ask the host to drop stale database connections
    ResetConnections,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::ReleaseMemory => "release_memory",
            RecoveryAction::ClearCaches => "clear_caches",
            RecoveryAction::ResetConnections => "reset_connections",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive non-healthy snapshots before recovery starts
    #[validate(range(min = 1))]
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_recovery_actions")]
    pub actions: Vec<RecoveryAction>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff", with = "humantime_serde")]
    pub base_backoff: Duration,

    #[validate(range(min = 1.0, max = 10.0))]
    #[serde(default = "default_healing_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    #[serde(default = "default_healing_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    #[validate(range(min = 1))]
    #[serde(default = "default_healing_history")]
    pub history_size: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unhealthy_threshold: default_unhealthy_threshold(),
            actions: default_recovery_actions(),
            max_retries: default_max_retries(),
            base_backoff: default_base_backoff(),
            backoff_multiplier: default_healing_multiplier(),
            max_backoff: default_max_backoff(),
            check_interval: default_healing_interval(),
            history_size: default_healing_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub pii: PiiConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub tuning: TuningConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    /// Bounded feedback channel; events are dropped when full
    #[serde(default = "default_feedback_capacity")]
    pub feedback_channel_capacity: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: QualityConfig::default(),
            pii: PiiConfig::default(),
            health: HealthConfig::default(),
            tuning: TuningConfig::default(),
            healing: HealingConfig::default(),
            feedback_channel_capacity: default_feedback_capacity(),
        }
    }
}

impl VerificationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let quality = &self.quality;
        for (attr, limit) in &quality.cardinality_limits {
            if *limit == 0 {
                return Err(ConfigError::invalid_value(
                    format!("verification.quality.cardinality_limits.{}", attr),
                    "must be positive",
                ));
            }
        }
        if quality.duplicate_detection {
            require_nonzero_duration("verification.quality.duplicate_window", quality.duplicate_window)?;
            if quality.duplicate_cache_size == 0 {
                return Err(ConfigError::invalid_value(
                    "verification.quality.duplicate_cache_size",
                    "must be positive",
                ));
            }
        }
        for rule in &quality.rules {
            if rule.name.is_empty() {
                return Err(ConfigError::missing_field("verification.quality.rules.name"));
            }
            Condition::compile(&rule.name, Some(&rule.condition))?;
        }

        let pii = &self.pii;
        for pattern in &pii.patterns {
            if pattern.name.is_empty() {
                return Err(ConfigError::missing_field("verification.pii.patterns.name"));
            }
            match (&pattern.kind, &pattern.regex) {
                (PiiPatternKind::Custom, None) => {
                    return Err(ConfigError::invalid_pattern(
                        pattern.name.clone(),
                        "custom patterns require a regex",
                    ));
                }
                (_, Some(expr)) => {
                    Regex::new(expr)
                        .map_err(|e| ConfigError::invalid_pattern(pattern.name.clone(), e.to_string()))?;
                }
                _ => {}
            }
        }
        if pii.redaction_placeholder.is_empty() {
            return Err(ConfigError::missing_field("verification.pii.redaction_placeholder"));
        }
        if pii.max_scan_bytes == 0 {
            return Err(ConfigError::invalid_value("verification.pii.max_scan_bytes", "must be positive"));
        }

        Validate::validate(&self.health)?;
        require_nonzero_duration("verification.health.check_interval", self.health.check_interval)?;

        Validate::validate(&self.tuning)?;
        require_nonzero_duration("verification.tuning.analysis_interval", self.tuning.analysis_interval)?;
        self.tuning.sampling_scale.validate("verification.tuning.sampling_scale")?;
        self.tuning.batch_size.validate("verification.tuning.batch_size")?;
        self.tuning
            .collection_interval_ms
            .validate("verification.tuning.collection_interval_ms")?;

        Validate::validate(&self.healing)?;
        require_nonzero_duration("verification.healing.check_interval", self.healing.check_interval)?;
        require_nonzero_duration("verification.healing.base_backoff", self.healing.base_backoff)?;
        if self.healing.base_backoff > self.healing.max_backoff {
            return Err(ConfigError::invalid_value(
                "verification.healing.base_backoff",
                "must not exceed max_backoff",
            ));
        }

        if self.feedback_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "verification.feedback_channel_capacity",
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn default_alert() -> EnforcementAction {
    EnforcementAction::Alert
}

fn default_required_attributes() -> Vec<String> {
    vec!["database_name".into(), "query_id".into(), "duration_ms".into()]
}

fn default_type_rules() -> BTreeMap<String, ValueKind> {
    BTreeMap::from([
        ("duration_ms".to_string(), ValueKind::Number),
        ("error_count".to_string(), ValueKind::Int),
        ("database_name".to_string(), ValueKind::String),
    ])
}

fn default_cardinality_limits() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("query_id".to_string(), 10_000),
        ("database_name".to_string(), 100),
        ("table_name".to_string(), 1_000),
    ])
}

fn default_duplicate_window() -> Duration {
    Duration::from_secs(10)
}

fn default_duplicate_cache_size() -> usize {
    10_000
}

fn default_pii_fields() -> Vec<String> {
    vec![
        "query_text".into(),
        "db.statement".into(),
        "message".into(),
        "body".into(),
    ]
}

fn default_pii_exclude() -> Vec<String> {
    vec![
        "query_hash".into(),
        "plan_hash".into(),
        "db.query.plan.hash".into(),
        "database_name".into(),
    ]
}

fn default_pii_patterns() -> Vec<PiiPatternConfig> {
    use EnforcementAction::*;
    vec![
        PiiPatternConfig::builtin("email", PiiPatternKind::Email, Redact),
        PiiPatternConfig::builtin("ssn", PiiPatternKind::Ssn, Redact),
        PiiPatternConfig::builtin("credit_card", PiiPatternKind::CreditCard, Redact),
        PiiPatternConfig::builtin("phone", PiiPatternKind::Phone, Alert),
        PiiPatternConfig::builtin("ipv4", PiiPatternKind::Ipv4, Alert),
    ]
}

fn default_placeholder() -> String {
    "[REDACTED]".into()
}

fn default_max_scan_bytes() -> usize {
    16 * 1024
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_memory_percent() -> f64 {
    85.0
}

fn default_cpu_percent() -> f64 {
    80.0
}

fn default_disk_percent() -> f64 {
    90.0
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_analysis_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_window_size() -> usize {
    10
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_max_change_percent() -> f64 {
    10.0
}

fn default_sampling_scale_bounds() -> TunableBoundsConfig {
    TunableBoundsConfig {
        initial: 1.0,
        min: 0.1,
        max: 1.0,
    }
}

fn default_batch_size_bounds() -> TunableBoundsConfig {
    TunableBoundsConfig {
        initial: 1_000.0,
        min: 100.0,
        max: 10_000.0,
    }
}

fn default_collection_interval_bounds() -> TunableBoundsConfig {
    TunableBoundsConfig {
        initial: 10_000.0,
        min: 1_000.0,
        max: 300_000.0,
    }
}

fn default_pressure_circuit_rate() -> f64 {
    0.1
}

fn default_pressure_cardinality() -> f64 {
    0.2
}

fn default_pressure_memory() -> f64 {
    80.0
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_recovery_actions() -> Vec<RecoveryAction> {
    vec![
        RecoveryAction::ReleaseMemory,
        RecoveryAction::ClearCaches,
        RecoveryAction::ResetConnections,
    ]
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_healing_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_healing_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_healing_history() -> usize {
    1_000
}

fn default_feedback_capacity() -> usize {
    1_000
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        config.validate().unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.open_state_timeout, Duration::from_secs(30));
        assert_eq!(config.sampler.default_sample_rate, 0.1);
        assert_eq!(config.sampler.rules.len(), 3);
        assert_eq!(
            config.sampler.dedup.fingerprint_attributes,
            vec!["db.query.plan.hash", "plan_json", "db.plan.text"]
        );
        assert_eq!(config.sampler.dedup.scope_attributes, vec!["query_id", "database_name"]);
        assert_eq!(config.plan_extractor.regression.time_ratio, 1.5);
        assert_eq!(config.verification.tuning.max_change_percent, 10.0);
        assert_eq!(config.verification.pii.redaction_placeholder, "[REDACTED]");
    }

    #[test]
    fn test_from_str_with_overrides() {
        let config = PipelineConfig::from_str(
            r#"
            [circuit_breaker]
            failure_threshold = 3
            success_threshold = 2
            open_state_timeout = "30s"

            [sampler]
            default_sample_rate = 0.5

            [[sampler.rules]]
            name = "slow"
            priority = 10
            condition = "duration_ms > 1000"
            sample_rate = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.sampler.rules.len(), 1);
        assert_eq!(config.sampler.rules[0].name, "slow");
        assert_eq!(config.sampler.dedup.window, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_rate = "[sampler]\ndefault_sample_rate = 1.5\n";
        assert!(matches!(
            PipelineConfig::from_str(bad_rate),
            Err(ConfigError::InvalidValue { .. })
        ));

        let bad_rule = r#"
            [[sampler.rules]]
            name = "broken"
            condition = "duration_ms >"
            sample_rate = 1.0
        "#;
        assert!(matches!(
            PipelineConfig::from_str(bad_rule),
            Err(ConfigError::InvalidRule { .. })
        ));

        let bad_regex = r#"
            [[verification.pii.patterns]]
            name = "ticket"
            kind = "custom"
            regex = "TICKET-("
        "#;
        assert!(matches!(
            PipelineConfig::from_str(bad_regex),
            Err(ConfigError::InvalidPattern { .. })
        ));

        let bad_timeouts = "[circuit_breaker]\nopen_state_timeout = \"10m\"\nmax_open_timeout = \"1m\"\n";
        assert!(PipelineConfig::from_str(bad_timeouts).is_err());

        let bad_cpu = "[circuit_breaker.resource]\ncpu_threshold_percent = 150.0\n";
        assert!(matches!(
            PipelineConfig::from_str(bad_cpu),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\ninstance_name = \"edge-1\"\n[plan_extractor]\nhistory_size = 4").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.pipeline.instance_name, "edge-1");
        assert_eq!(config.plan_extractor.history_size, 4);

        let missing = PipelineConfig::load("/definitely/not/here.toml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));

        let fallback = PipelineConfig::load_or_default("/definitely/not/here.toml").unwrap();
        assert_eq!(fallback.pipeline.instance_name, PipelineConfig::default().pipeline.instance_name);
        assert_eq!(
            PipelineConfig::load_or_default(file.path()).unwrap().plan_extractor.history_size,
            4
        );

        writeln!(file, "[sampler]\ndefault_sample_rate = 3.0").unwrap();
        assert!(PipelineConfig::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = PipelineConfig::generate_default_config();
        assert!(rendered.contains("failure_threshold"));
        let parsed = PipelineConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.sampler.rules.len(), 3);
    }
}
