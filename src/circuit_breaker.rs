// ============================================================================
// CIRCUIT BREAKER
// ============================================================================
// Per-database failure isolation.
//
//            failures >= threshold            timeout elapsed
//   CLOSED ─────────────────────────▶ OPEN ─────────────────▶ HALF-OPEN
//     ▲                                 ▲                         │
//     │      success_threshold          │      any failure        │
//     └─────────────────────────────────┴─────────────────────────┘
//
// Each key owns its own mutex; the registry lock is only written when a new
// key appears. A process-wide resource guard can force every circuit open
// (load shedding) regardless of per-key counters.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use aho_corasick::{AhoCorasick, MatchKind};
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, ErrorImpact, ErrorPatternConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::{PipelineCounters, PipelineMetrics};
use crate::pipeline::{BatchContext, Stage};
use crate::resources::{ResourceProbe, ResourceUsage};
use crate::types::{Clock, DropReason, Instant, Record, Verdict};

/// Attribute added to admitted records.
pub const CIRCUIT_STATE_ATTRIBUTE: &str = "circuit.state";

// ----------------------------------------------------------------------------
// Circuit State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Allowing limited requests to test recovery
    HalfOpen,
    /// Blocking all requests due to failures
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

// ----------------------------------------------------------------------------
// Error Classification
// ----------------------------------------------------------------------------

/// Classification of a downstream error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClass {
    pub name: CompactString,
    pub impact: ErrorImpact,
}

impl ErrorClass {
    pub fn unknown() -> Self {
        Self {
            name: CompactString::from("unknown"),
            impact: ErrorImpact::Counted,
        }
    }
}

/// Result of one attempt against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    Success,
    Failure(&'a str),
}

/// Case-insensitive substring classifier; first configured pattern wins.
pub struct ErrorClassifier {
    matcher: Option<AhoCorasick>,
    classes: Vec<ErrorClass>,
}

impl ErrorClassifier {
    pub fn new(patterns: &[ErrorPatternConfig]) -> ConfigResult<Self> {
        if patterns.is_empty() {
            return Ok(Self {
                matcher: None,
                classes: Vec::new(),
            });
        }
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(patterns.iter().map(|p| p.pattern.as_str()))
            .map_err(|e| ConfigError::invalid_pattern("circuit_breaker.error_patterns", e.to_string()))?;
        let classes = patterns
            .iter()
            .map(|p| ErrorClass {
                name: CompactString::from(p.name.as_str()),
                impact: p.impact,
            })
            .collect();
        Ok(Self {
            matcher: Some(matcher),
            classes,
        })
    }

    /// Classify by the earliest configured pattern found in `message`.
    pub fn classify(&self, message: &str) -> ErrorClass {
        let Some(matcher) = &self.matcher else {
            return ErrorClass::unknown();
        };
        matcher
            .find_iter(message)
            .map(|m| m.pattern().as_usize())
            .min()
            .and_then(|idx| self.classes.get(idx).cloned())
            .unwrap_or_else(ErrorClass::unknown)
    }
}

// ----------------------------------------------------------------------------
// Per-key Circuit
// ----------------------------------------------------------------------------

/// State of one logical source.
#[derive(Debug, Clone)]
pub struct DatabaseCircuit {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    error_rate: f64,
    window_start: Instant,
    opened_at: Instant,
    last_transition: Instant,
    current_timeout: Duration,
    total_successes: u64,
    total_failures: u64,
    trips: u64,
}

impl DatabaseCircuit {
    fn new(now: Instant, base_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_admitted: 0,
            error_rate: 0.0,
            window_start: now,
            opened_at: now,
            last_transition: now,
            current_timeout: base_timeout,
            total_successes: 0,
            total_failures: 0,
            trips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    fn snapshot(&self, now: Instant, shedding: bool) -> CircuitSnapshot {
        CircuitSnapshot {
            state: if shedding { CircuitState::Open } else { self.state },
            failure_count: self.failure_count,
            success_count: self.success_count,
            error_rate: self.error_rate,
            current_timeout_ms: self.current_timeout.as_millis() as u64,
            since_transition_ms: now.saturating_duration_since(self.last_transition).as_millis() as u64,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            trips: self.trips,
        }
    }
}

/// Observable view of a circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub error_rate: f64,
    pub current_timeout_ms: u64,
    pub since_transition_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub trips: u64,
}

// ----------------------------------------------------------------------------
// Circuit Breaker
// ----------------------------------------------------------------------------

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: RwLock<AHashMap<CompactString, Arc<Mutex<DatabaseCircuit>>>>,
    classifier: ErrorClassifier,
    load_shedding: AtomicBool,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Clock, metrics: Arc<PipelineMetrics>) -> ConfigResult<Self> {
        config.validate()?;
        let classifier = ErrorClassifier::new(&config.error_patterns)?;
        Ok(Self {
            config,
            circuits: RwLock::new(AHashMap::new()),
            classifier,
            load_shedding: AtomicBool::new(false),
            clock,
            metrics,
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or lazily create the circuit for `key`.
    fn circuit(&self, key: &str) -> Arc<Mutex<DatabaseCircuit>> {
        if let Some(circuit) = self.circuits.read().get(key) {
            return circuit.clone();
        }
        let mut circuits = self.circuits.write();
        circuits
            .entry(CompactString::from(key))
            .or_insert_with(|| {
                debug!(target: "dbintel::circuit", key, "Tracking new circuit");
                Arc::new(Mutex::new(DatabaseCircuit::new(
                    self.clock.now(),
                    self.config.open_state_timeout,
                )))
            })
            .clone()
    }

    /// May traffic for `key` proceed?
    pub fn allow(&self, key: &str) -> bool {
        if self.is_load_shedding() {
            self.metrics.circuit_rejections.inc();
            return false;
        }

        let circuit = self.circuit(key);
        let mut circuit = circuit.lock();
        let now = self.clock.now();

        let allowed = match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_duration_since(circuit.opened_at) >= circuit.current_timeout {
                    self.transition(key, &mut circuit, CircuitState::HalfOpen, now);
                    circuit.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_admitted < self.config.half_open_max_requests {
                    circuit.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.metrics.circuit_rejections.inc();
        }
        allowed
    }

    /// Update `key` after an attempt.
    pub fn record_outcome(&self, key: &str, outcome: Outcome<'_>) {
        match outcome {
            Outcome::Success => self.record_success(key),
            Outcome::Failure(message) => {
                let class = self.classifier.classify(message);
                self.record_classified(key, &class);
            }
        }
    }

    /// Update `key` with an already classified failure.
    pub fn record_classified(&self, key: &str, class: &ErrorClass) {
        self.metrics
            .classified_errors
            .with_label_values(&[class.name.as_str(), class.impact.as_str()])
            .inc();

        if class.impact == ErrorImpact::Transient {
            debug!(
                target: "dbintel::circuit",
                key,
                class = %class.name,
                "Transient error ignored by circuit"
            );
            return;
        }

        let circuit = self.circuit(key);
        let mut circuit = circuit.lock();
        let now = self.clock.now();
        let alpha = self.config.error_rate_alpha;
        circuit.error_rate = alpha + (1.0 - alpha) * circuit.error_rate;
        circuit.total_failures += 1;
        let severe = class.impact == ErrorImpact::Severe;

        match circuit.state {
            CircuitState::Closed => {
                if circuit.failure_count == 0
                    || now.saturating_duration_since(circuit.window_start) > self.config.failure_window
                {
                    circuit.failure_count = 0;
                    circuit.window_start = now;
                }
                circuit.failure_count += 1;
                if severe || circuit.failure_count >= self.config.failure_threshold {
                    warn!(
                        target: "dbintel::circuit",
                        key,
                        class = %class.name,
                        failures = circuit.failure_count,
                        severe,
                        "Opening circuit"
                    );
                    self.open(key, &mut circuit, now);
                }
            }
            CircuitState::HalfOpen => {
                if self.config.adaptive_timeout && circuit.error_rate >= self.config.high_error_rate {
                    let scaled = circuit.current_timeout.mul_f64(self.config.backoff_multiplier);
                    circuit.current_timeout = scaled.min(self.config.max_open_timeout);
                }
                warn!(
                    target: "dbintel::circuit",
                    key,
                    class = %class.name,
                    timeout_ms = circuit.current_timeout.as_millis() as u64,
                    "Half-open trial failed, reopening circuit"
                );
                self.open(key, &mut circuit, now);
            }
            CircuitState::Open => {}
        }
    }

    fn record_success(&self, key: &str) {
        let circuit = self.circuit(key);
        let mut circuit = circuit.lock();
        let now = self.clock.now();
        circuit.error_rate *= 1.0 - self.config.error_rate_alpha;
        circuit.total_successes += 1;

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= self.config.success_threshold {
                    if self.config.adaptive_timeout {
                        let relaxed = circuit.current_timeout.mul_f64(self.config.recovery_multiplier);
                        circuit.current_timeout = relaxed.max(self.config.open_state_timeout);
                    }
                    info!(
                        target: "dbintel::circuit",
                        key,
                        successes = circuit.success_count,
                        "Circuit recovered"
                    );
                    self.transition(key, &mut circuit, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, key: &str, circuit: &mut DatabaseCircuit, now: Instant) {
        circuit.opened_at = now;
        circuit.trips += 1;
        self.transition(key, circuit, CircuitState::Open, now);
    }

    fn transition(&self, key: &str, circuit: &mut DatabaseCircuit, to: CircuitState, now: Instant) {
        let from = circuit.state;
        circuit.state = to;
        circuit.last_transition = now;
        circuit.failure_count = 0;
        circuit.success_count = 0;
        circuit.half_open_admitted = 0;
        circuit.window_start = now;
        self.metrics
            .circuit_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        debug!(
            target: "dbintel::circuit",
            key,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit transition"
        );
    }

    pub fn classify(&self, message: &str) -> ErrorClass {
        self.classifier.classify(message)
    }

    /// Effective state of `key`, if it has been seen.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        let circuit = self.circuits.read().get(key).cloned()?;
        if self.is_load_shedding() {
            return Some(CircuitState::Open);
        }
        let state = circuit.lock().state;
        Some(state)
    }

    /// Per-key view for observability. Does not mutate any circuit.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        let now = self.clock.now();
        let shedding = self.is_load_shedding();
        let circuits: Vec<_> = self
            .circuits
            .read()
            .iter()
            .map(|(k, c)| (k.to_string(), c.clone()))
            .collect();
        circuits
            .into_iter()
            .map(|(key, circuit)| {
                let snapshot = circuit.lock().snapshot(now, shedding);
                (key, snapshot)
            })
            .collect()
    }

    /// Share of tracked circuits currently not closed.
    pub fn open_ratio(&self) -> f64 {
        let circuits = self.circuits.read();
        if circuits.is_empty() {
            return 0.0;
        }
        if self.is_load_shedding() {
            return 1.0;
        }
        let open = circuits
            .values()
            .filter(|c| c.lock().state != CircuitState::Closed)
            .count();
        open as f64 / circuits.len() as f64
    }

    // ---- load shedding ----

    #[inline]
    pub fn is_load_shedding(&self) -> bool {
        self.load_shedding.load(AtomicOrdering::Acquire)
    }

    /// Evaluate one resource reading. Returns whether shedding is active.
    pub fn apply_resource_usage(&self, usage: &ResourceUsage) -> bool {
        let guard = &self.config.resource;
        let memory_limit = guard.memory_threshold_mb as f64;
        let cpu_limit = guard.cpu_threshold_percent;
        let shedding = self.is_load_shedding();

        let over = usage.process_memory_mb > memory_limit || usage.cpu_percent > cpu_limit;
        let calm = usage.process_memory_mb < memory_limit * guard.recovery_ratio
            && usage.cpu_percent < cpu_limit * guard.recovery_ratio;

        if !shedding && over {
            warn!(
                target: "dbintel::circuit",
                memory_mb = usage.process_memory_mb,
                cpu_percent = usage.cpu_percent,
                "Resource pressure, shedding load on all circuits"
            );
            self.load_shedding.store(true, AtomicOrdering::Release);
            self.metrics.load_shedding.set(1);
            true
        } else if shedding && calm {
            info!(
                target: "dbintel::circuit",
                memory_mb = usage.process_memory_mb,
                cpu_percent = usage.cpu_percent,
                "Resource pressure subsided, resuming traffic"
            );
            self.load_shedding.store(false, AtomicOrdering::Release);
            self.metrics.load_shedding.set(0);
            false
        } else {
            shedding
        }
    }

    /// Background loop sampling `probe` until `shutdown` fires.
    pub async fn run_resource_monitor(self: Arc<Self>, mut probe: Box<dyn ResourceProbe>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resource.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let usage = probe.sample();
                    self.apply_resource_usage(&usage);
                }
            }
        }
        debug!(target: "dbintel::circuit", "Resource monitor stopped");
    }
}

impl Stage for CircuitBreaker {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn process(&self, record: &mut Record, _ctx: &BatchContext) -> Verdict {
        let Some(key) = record.get(&self.config.key_attribute).map(|v| v.render()) else {
            return Verdict::Pass;
        };

        if !self.allow(&key) {
            PipelineCounters::add(&self.metrics.counters.circuit_rejected, 1);
            return Verdict::Drop(DropReason::CircuitOpen);
        }
        PipelineCounters::add(&self.metrics.counters.circuit_admitted, 1);

        let state = if self.is_load_shedding() {
            CircuitState::Open
        } else {
            self.circuit(&key).lock().state
        };
        record.set(CIRCUIT_STATE_ATTRIBUTE, state.as_str());
        Verdict::Pass
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quanta::Mock;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        (CircuitBreaker::new(config, clock, metrics).unwrap(), mock)
    }

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_state_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    const FAIL: Outcome<'static> = Outcome::Failure("connection refused");

    #[test]
    fn test_opens_after_threshold_and_recovers() {
        let (cb, mock) = breaker(small_config());

        for _ in 0..3 {
            assert!(cb.allow("db1"));
            cb.record_outcome("db1", FAIL);
        }
        assert_eq!(cb.state("db1"), Some(CircuitState::Open));
        assert!(!cb.allow("db1"));

        mock.increment(Duration::from_secs(29));
        assert!(!cb.allow("db1"));

        mock.increment(Duration::from_secs(1));
        assert!(cb.allow("db1"));
        assert_eq!(cb.state("db1"), Some(CircuitState::HalfOpen));

        cb.record_outcome("db1", Outcome::Success);
        cb.record_outcome("db1", Outcome::Success);
        assert_eq!(cb.state("db1"), Some(CircuitState::Closed));
        for _ in 0..100 {
            assert!(cb.allow("db1"));
        }
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let (cb, mock) = breaker(small_config());
        for _ in 0..3 {
            cb.record_outcome("db1", FAIL);
        }
        mock.increment(Duration::from_secs(30));
        assert!(cb.allow("db1"));

        cb.record_outcome("db1", FAIL);
        assert_eq!(cb.state("db1"), Some(CircuitState::Open));
        assert!(!cb.allow("db1"));
    }

    #[test]
    fn test_half_open_limits_trial_traffic() {
        let (cb, mock) = breaker(CircuitBreakerConfig {
            half_open_max_requests: 2,
            ..small_config()
        });
        for _ in 0..3 {
            cb.record_outcome("db1", FAIL);
        }
        mock.increment(Duration::from_secs(30));
        assert!(cb.allow("db1"));
        assert!(cb.allow("db1"));
        assert!(!cb.allow("db1"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (cb, _mock) = breaker(small_config());
        cb.record_outcome("db1", FAIL);
        cb.record_outcome("db1", FAIL);
        cb.record_outcome("db1", Outcome::Success);
        cb.record_outcome("db1", FAIL);
        cb.record_outcome("db1", FAIL);
        assert_eq!(cb.state("db1"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let (cb, mock) = breaker(small_config());
        cb.record_outcome("db1", FAIL);
        cb.record_outcome("db1", FAIL);
        mock.increment(Duration::from_secs(61));
        cb.record_outcome("db1", FAIL);
        assert_eq!(cb.state("db1"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_keys_are_isolated() {
        let (cb, _mock) = breaker(small_config());
        for _ in 0..3 {
            cb.record_outcome("db1", FAIL);
        }
        assert!(!cb.allow("db1"));
        assert!(cb.allow("db2"));
        assert_eq!(cb.snapshot().len(), 2);
    }

    #[test]
    fn test_classification_impacts() {
        let (cb, _mock) = breaker(small_config());

        let class = cb.classify("Error: Unique Time Series limit hit");
        assert_eq!(class.name, "unique_series");
        assert_eq!(class.impact, ErrorImpact::Severe);
        assert_eq!(cb.classify("something odd").name, "unknown");

        // Transient errors never move the circuit.
        for _ in 0..10 {
            cb.record_outcome("db1", Outcome::Failure("context deadline exceeded"));
        }
        assert_eq!(cb.state("db1"), Some(CircuitState::Closed));

        // Severe errors open it at once.
        cb.record_outcome("db1", Outcome::Failure("cardinality limit exceeded"));
        assert_eq!(cb.state("db1"), Some(CircuitState::Open));
    }

    #[test]
    fn test_classifier_prefers_configured_order() {
        let classifier = ErrorClassifier::new(&[
            ErrorPatternConfig::new("first", "limit", ErrorImpact::Counted),
            ErrorPatternConfig::new("second", "rate limit", ErrorImpact::Severe),
        ])
        .unwrap();
        assert_eq!(classifier.classify("hit rate limit").name, "first");
    }

    #[test]
    fn test_adaptive_timeout_grows_and_relaxes() {
        let (cb, mock) = breaker(small_config());
        for _ in 0..3 {
            cb.record_outcome("db1", FAIL);
        }
        mock.increment(Duration::from_secs(30));
        assert!(cb.allow("db1"));
        cb.record_outcome("db1", FAIL);

        let grown = cb.snapshot()["db1"].current_timeout_ms;
        assert_eq!(grown, 45_000);

        mock.increment(Duration::from_secs(44));
        assert!(!cb.allow("db1"));
        mock.increment(Duration::from_secs(1));
        assert!(cb.allow("db1"));
        cb.record_outcome("db1", Outcome::Success);
        cb.record_outcome("db1", Outcome::Success);
        assert_eq!(cb.snapshot()["db1"].current_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_shedding_forces_all_circuits_open() {
        let (cb, _mock) = breaker(small_config());
        assert!(cb.allow("db1"));

        let pressure = ResourceUsage {
            process_memory_mb: 600.0,
            cpu_percent: 10.0,
            ..Default::default()
        };
        assert!(cb.apply_resource_usage(&pressure));
        assert!(!cb.allow("db1"));
        assert!(!cb.allow("db-new"));
        assert_eq!(cb.snapshot()["db1"].state, CircuitState::Open);

        // Still above the recovery band: keep shedding.
        let easing = ResourceUsage {
            process_memory_mb: 480.0,
            ..pressure
        };
        assert!(cb.apply_resource_usage(&easing));

        let calm = ResourceUsage {
            process_memory_mb: 100.0,
            ..pressure
        };
        assert!(!cb.apply_resource_usage(&calm));
        assert!(cb.allow("db1"));
    }

    #[test]
    fn test_stage_drops_rejected_and_annotates_admitted() {
        let (cb, _mock) = breaker(small_config());
        let ctx = BatchContext::for_tests();
        for _ in 0..3 {
            cb.record_outcome("db1", FAIL);
        }

        let mut blocked = Record::metric().with_attr("database_name", "db1");
        let mut admitted = Record::metric().with_attr("database_name", "db2");
        let mut unkeyed = Record::metric();

        assert_eq!(cb.process(&mut blocked, &ctx), Verdict::Drop(DropReason::CircuitOpen));
        assert_eq!(cb.process(&mut admitted, &ctx), Verdict::Pass);
        assert_eq!(admitted.get_str(CIRCUIT_STATE_ATTRIBUTE), Some("closed"));
        assert_eq!(cb.process(&mut unkeyed, &ctx), Verdict::Pass);
        assert!(!unkeyed.contains(CIRCUIT_STATE_ATTRIBUTE));
    }

    #[test]
    fn test_rejects_unclosable_half_open_config() {
        let (clock, _mock) = Clock::mock();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let config = CircuitBreakerConfig {
            success_threshold: 4,
            half_open_max_requests: 2,
            ..Default::default()
        };
        assert!(CircuitBreaker::new(config, clock, metrics).is_err());
    }

    #[tokio::test]
    async fn test_resource_monitor_stops_on_shutdown() {
        let (cb, _mock) = breaker(CircuitBreakerConfig {
            resource: crate::config::ResourceGuardConfig {
                check_interval: Duration::from_millis(5),
                ..Default::default()
            },
            ..small_config()
        });
        let cb = Arc::new(cb);
        let probe = crate::resources::ManualProbe::new(ResourceUsage {
            process_memory_mb: 10_000.0,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(cb.clone().run_resource_monitor(Box::new(probe), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.is_load_shedding());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
