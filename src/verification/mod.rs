// ============================================================================
// VERIFICATION
// ============================================================================
// Last stage of the pipeline. On the record path it runs data-quality checks
// and PII scanning. Off the record path it owns the control plane:
//
//   health timer ──▶ HealthMonitor ──▶ SelfHealer (observe)
//                          │                 ▲
//                          ▼                 │ healer timer (tick)
//                   ArcSwap<HealthSnapshot>
//
//   tuning timer ──▶ AutoTuner ──▶ TunableTable (ArcSwap<TunableSet>)
//
// Operator-facing events from both halves go out on a bounded feedback
// channel.
// ============================================================================

pub mod healing;
pub mod health;
pub mod pii;
pub mod quality;
pub mod tuning;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use healing::{HealerState, HealerStatus, HealingOutcome, HealingRecord, RecoveryHooks, SelfHealer};
pub use health::{ComponentHealth, HealthInputs, HealthMonitor, HealthSnapshot, HealthStatus};
pub use pii::{PiiDetector, PiiReport};
pub use quality::{QualityReport, QualityValidator};
pub use tuning::{AutoTuner, PerformanceSample, TunableKind, TunableSet, TunableTable, TuningRecommendation};

use crate::config::{EnforcementAction, VerificationConfig};
use crate::error::{ConfigResult, ResourceError};
use crate::metrics::{CounterSnapshot, PipelineCounters, PipelineMetrics};
use crate::pipeline::{BatchContext, Stage};
use crate::plan::attrs as plan_attrs;
use crate::resources::ResourceProbe;
use crate::types::{Clock, DropReason, Record, Timestamp, Verdict};

// ----------------------------------------------------------------------------
// Feedback Channel
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    Info,
    Warning,
    Error,
}

/// Operator-facing event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackEvent {
    pub timestamp: Timestamp,
    pub level: FeedbackLevel,
    pub category: CompactString,
    pub message: String,
    pub database: Option<CompactString>,
    pub metrics: BTreeMap<CompactString, f64>,
    pub remediation: Option<String>,
    pub auto_fixed: bool,
}

impl FeedbackEvent {
    pub fn new(level: FeedbackLevel, category: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            level,
            category: CompactString::from(category),
            message: message.into(),
            database: None,
            metrics: BTreeMap::new(),
            remediation: None,
            auto_fixed: false,
        }
    }

    pub fn with_database(mut self, database: Option<&str>) -> Self {
        self.database = database.map(CompactString::from);
        self
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(CompactString::from(name), value);
        self
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn auto_fixed(mut self, fixed: bool) -> Self {
        self.auto_fixed = fixed;
        self
    }
}

/// Sending half of the feedback channel. Never blocks: when the channel is
/// full the new event is discarded and counted.
#[derive(Debug)]
pub struct FeedbackSender {
    tx: mpsc::Sender<FeedbackEvent>,
    dropped: AtomicU64,
}

pub fn feedback_channel(capacity: usize) -> (FeedbackSender, mpsc::Receiver<FeedbackEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FeedbackSender {
            tx,
            dropped: AtomicU64::new(0),
        },
        rx,
    )
}

impl FeedbackSender {
    pub fn emit(&self, event: FeedbackEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Verification Stage
// ----------------------------------------------------------------------------

const DATABASE_ATTRIBUTE: &str = "database_name";
const QUERY_ID_ATTRIBUTE: &str = "query_id";

pub struct Verification {
    config: VerificationConfig,
    quality: Arc<QualityValidator>,
    pii: PiiDetector,
    health: HealthMonitor,
    tuner: AutoTuner,
    healer: SelfHealer,
    feedback: FeedbackSender,
    metrics: Arc<PipelineMetrics>,
}

impl Verification {
    pub fn new(
        config: VerificationConfig,
        quality: Arc<QualityValidator>,
        tunables: Arc<TunableTable>,
        hooks: Arc<dyn RecoveryHooks>,
        feedback: FeedbackSender,
        clock: Clock,
        metrics: Arc<PipelineMetrics>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let pii = PiiDetector::new(config.pii.clone(), Arc::clone(&metrics))?;
        let health = HealthMonitor::new(config.health.clone(), Arc::clone(&metrics));
        let tuner = AutoTuner::new(config.tuning.clone(), tunables, Arc::clone(&metrics));
        let healer = SelfHealer::new(config.healing.clone(), hooks, clock, Arc::clone(&metrics));

        Ok(Self {
            config,
            quality,
            pii,
            health,
            tuner,
            healer,
            feedback,
            metrics,
        })
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn quality(&self) -> &QualityValidator {
        &self.quality
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn tuner(&self) -> &AutoTuner {
        &self.tuner
    }

    pub fn healer(&self) -> &SelfHealer {
        &self.healer
    }

    pub fn feedback(&self) -> &FeedbackSender {
        &self.feedback
    }

    /// Quality then PII; the strictest action of either decides.
    pub fn verify(&self, record: &mut Record) -> Verdict {
        PipelineCounters::add(&self.metrics.counters.records_verified, 1);

        if self.config.quality.enabled {
            let report = self.quality.check(record);
            if let Some(action) = self.quality.enforce(record, &report) {
                debug!(
                    target: "dbintel::verify",
                    checks = %report.check_names().join(","),
                    action = action.as_str(),
                    "Quality violation"
                );
                if action == EnforcementAction::Drop {
                    self.feedback.emit(
                        FeedbackEvent::new(
                            FeedbackLevel::Warning,
                            "quality",
                            format!("Record dropped: {}", report.check_names().join(", ")),
                        )
                        .with_database(record.get_str(DATABASE_ATTRIBUTE)),
                    );
                    return Verdict::Drop(DropReason::QualityViolation);
                }
            }
        }

        if self.config.pii.enabled {
            let report = self.pii.apply(record);
            match report.action() {
                Some(EnforcementAction::Drop) => {
                    self.feedback.emit(
                        FeedbackEvent::new(
                            FeedbackLevel::Warning,
                            "pii",
                            format!("Record dropped: PII ({})", report.pattern_names().join(", ")),
                        )
                        .with_database(record.get_str(DATABASE_ATTRIBUTE)),
                    );
                    return Verdict::Drop(DropReason::PiiDetected);
                }
                Some(EnforcementAction::Redact) => {
                    self.feedback.emit(
                        FeedbackEvent::new(
                            FeedbackLevel::Info,
                            "pii",
                            format!("PII redacted ({})", report.pattern_names().join(", ")),
                        )
                        .with_database(record.get_str(DATABASE_ATTRIBUTE))
                        .auto_fixed(true),
                    );
                }
                Some(EnforcementAction::Alert) | None => {}
            }
        }

        if record.get_bool(plan_attrs::HAS_REGRESSION) == Some(true) {
            self.report_regression(record);
        }
        Verdict::Pass
    }

    fn report_regression(&self, record: &Record) {
        let severity = record.get_str(plan_attrs::SEVERITY).unwrap_or("low");
        let level = match severity {
            "critical" => FeedbackLevel::Error,
            "low" => FeedbackLevel::Info,
            _ => FeedbackLevel::Warning,
        };
        let query = record
            .get(QUERY_ID_ATTRIBUTE)
            .map(|v| v.render())
            .unwrap_or_default();

        let mut event = FeedbackEvent::new(
            level,
            "plan_regression",
            format!("{} plan regression for query {}", severity, query),
        )
        .with_database(record.get_str(DATABASE_ATTRIBUTE));
        for (name, attr) in [
            ("time_ratio", plan_attrs::TIME_RATIO),
            ("io_ratio", plan_attrs::IO_RATIO),
            ("cost_ratio", plan_attrs::COST_RATIO),
        ] {
            if let Some(value) = record.get_f64(attr) {
                event = event.with_metric(name, value);
            }
        }
        if let Some(recommendation) = record.get_str(plan_attrs::RECOMMENDATION) {
            event = event.with_remediation(recommendation);
        }
        self.feedback.emit(event);
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Evaluate, let the healer react, publish.
    pub fn check_health(&self, inputs: &HealthInputs) -> Arc<HealthSnapshot> {
        let components = self.health.evaluate(inputs);
        for component in components.iter().filter(|c| c.status != HealthStatus::Healthy) {
            let pressure = match component.name {
                "memory" => Some(ResourceError::MemoryPressure {
                    used_percent: component.value,
                    threshold: component.threshold,
                }),
                "cpu" => Some(ResourceError::CpuPressure {
                    used_percent: component.value,
                    threshold: component.threshold,
                }),
                _ => None,
            };
            match pressure {
                Some(error) => warn!(target: "dbintel::verify", error = %error, "Resource pressure"),
                None => warn!(
                    target: "dbintel::verify",
                    component = component.name,
                    status = component.status.as_str(),
                    message = %component.message,
                    "Component unhealthy"
                ),
            }
        }

        let component_status = components.iter().map(|c| c.status).max().unwrap_or_default();
        let outcome = self.healer.observe(component_status);
        self.report_healing(&outcome);

        let previous = self.health.current().status;
        let snapshot = self.health.publish(components, outcome.status);
        if snapshot.status != previous {
            let level = match snapshot.status {
                HealthStatus::Healthy => FeedbackLevel::Info,
                HealthStatus::Degraded => FeedbackLevel::Warning,
                HealthStatus::Critical => FeedbackLevel::Error,
            };
            let mut event = FeedbackEvent::new(
                level,
                "health",
                format!("Health changed from {} to {}", previous.as_str(), snapshot.status.as_str()),
            );
            for component in &snapshot.components {
                event = event.with_metric(component.name, component.value);
            }
            self.feedback.emit(event);
        }
        snapshot
    }

    fn report_healing(&self, outcome: &HealingOutcome) {
        for record in &outcome.actions {
            let level = if record.succeeded {
                FeedbackLevel::Warning
            } else {
                FeedbackLevel::Error
            };
            self.feedback.emit(
                FeedbackEvent::new(
                    level,
                    "healing",
                    format!("{} (attempt {}): {}", record.action.as_str(), record.attempt, record.detail),
                )
                .auto_fixed(record.succeeded),
            );
        }
        if let Some(error) = &outcome.exhausted {
            self.feedback.emit(
                FeedbackEvent::new(FeedbackLevel::Error, "healing", error.to_string())
                    .with_remediation("Automatic recovery gave up; operator intervention required"),
            );
        }
    }

    /// Retry recovery if due and fold the healer status into the published
    /// health snapshot.
    pub fn heal(&self) -> HealingOutcome {
        let outcome = self.healer.tick();
        self.report_healing(&outcome);
        if !outcome.actions.is_empty() || outcome.exhausted.is_some() {
            self.health.update_healer(outcome.status.clone());
        }
        outcome
    }

    // ------------------------------------------------------------------------
    // Tuning
    // ------------------------------------------------------------------------

    pub fn analyze(&self, sample: PerformanceSample) -> Vec<TuningRecommendation> {
        let recommendations = self.tuner.record(sample);
        for rec in &recommendations {
            if !rec.applied {
                info!(
                    target: "dbintel::verify",
                    parameter = rec.parameter.as_str(),
                    from = rec.from,
                    to = rec.to,
                    confidence = rec.confidence,
                    "Tuning recommendation (not applied)"
                );
            }
            self.feedback.emit(
                FeedbackEvent::new(
                    FeedbackLevel::Info,
                    "tuning",
                    format!(
                        "{} {} from {:.3} to {:.3}: {}",
                        rec.direction.as_str(),
                        rec.parameter.as_str(),
                        rec.from,
                        rec.to,
                        rec.reason
                    ),
                )
                .with_metric("confidence", rec.confidence)
                .auto_fixed(rec.applied),
            );
        }
        recommendations
    }

    // ------------------------------------------------------------------------
    // Background Loops
    // ------------------------------------------------------------------------

    pub async fn run_health_monitor(self: Arc<Self>, mut probe: Box<dyn ResourceProbe>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous = self.metrics.counters.snapshot();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let current = self.metrics.counters.snapshot();
                    let delta = current.delta(&previous);
                    previous = current;
                    let inputs = HealthInputs {
                        usage: probe.sample(),
                        error_rate: error_rate(&delta),
                    };
                    let snapshot = self.check_health(&inputs);
                    debug!(target: "dbintel::verify", status = snapshot.status.as_str(), "Health checked");
                }
            }
        }
    }

    pub async fn run_healer(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.healing.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.heal();
                }
            }
        }
    }

    pub async fn run_tuner(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.tuning.analysis_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut previous = self.metrics.counters.snapshot();
        let mut last = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let current = self.metrics.counters.snapshot();
                    let now = tokio::time::Instant::now();
                    let sample = PerformanceSample::from_counters(
                        &current.delta(&previous),
                        now.duration_since(last),
                        self.memory_percent(),
                    );
                    previous = current;
                    last = now;
                    self.analyze(sample);
                }
            }
        }
    }

    /// Host memory reading from the latest health snapshot.
    fn memory_percent(&self) -> f64 {
        self.health
            .current()
            .components
            .iter()
            .find(|c| c.name == "memory")
            .map(|c| c.value)
            .unwrap_or(0.0)
    }

    pub fn analysis_interval(&self) -> Duration {
        self.config.tuning.analysis_interval
    }
}

fn error_rate(delta: &CounterSnapshot) -> f64 {
    if delta.export_attempts == 0 {
        0.0
    } else {
        delta.export_failures as f64 / delta.export_attempts as f64
    }
}

impl Stage for Verification {
    fn name(&self) -> &'static str {
        "verification"
    }

    fn process(&self, record: &mut Record, _ctx: &BatchContext) -> Verdict {
        if !self.config.enabled {
            return Verdict::Pass;
        }
        self.verify(record)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PiiPatternConfig, PiiPatternKind, QualityConfig};
    use crate::resources::{ManualProbe, ResourceUsage};
    use pretty_assertions::assert_eq;

    struct NoopHooks;

    impl RecoveryHooks for NoopHooks {
        fn release_memory(&self) -> Result<usize, String> {
            Ok(0)
        }

        fn clear_caches(&self) -> Result<usize, String> {
            Ok(0)
        }

        fn reset_connections(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn verification(config: VerificationConfig) -> (Verification, mpsc::Receiver<FeedbackEvent>) {
        let (clock, _mock) = Clock::mock();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let quality = Arc::new(
            QualityValidator::new(
                config.quality.clone(),
                config.pii.redaction_placeholder.clone(),
                4,
                clock.clone(),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let tunables = Arc::new(TunableTable::new(&config.tuning));
        let (tx, rx) = feedback_channel(config.feedback_channel_capacity);
        let v = Verification::new(config, quality, tunables, Arc::new(NoopHooks), tx, clock, metrics).unwrap();
        (v, rx)
    }

    fn lenient() -> VerificationConfig {
        VerificationConfig {
            quality: QualityConfig {
                required_attributes: vec![],
                duplicate_detection: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_email_redacted_and_forwarded() {
        let (v, mut rx) = verification(lenient());
        let mut record = Record::log().with_attr("message", "contact bob@example.com");
        assert_eq!(v.process(&mut record, &BatchContext::for_tests()), Verdict::Pass);
        assert_eq!(record.get_str("message"), Some("contact [REDACTED]"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.category, "pii");
        assert!(event.auto_fixed);
    }

    #[test]
    fn test_pii_drop_removes_record() {
        let mut config = lenient();
        config.pii.patterns = vec![PiiPatternConfig::builtin("email", PiiPatternKind::Email, EnforcementAction::Drop)];
        let (v, _rx) = verification(config);
        let mut record = Record::log().with_attr("message", "contact bob@example.com");
        assert_eq!(
            v.process(&mut record, &BatchContext::for_tests()),
            Verdict::Drop(DropReason::PiiDetected)
        );
    }

    #[test]
    fn test_quality_drop_short_circuits() {
        let mut config = VerificationConfig::default();
        config.quality.on_violation = EnforcementAction::Drop;
        let (v, mut rx) = verification(config);
        let mut record = Record::log().with_attr("message", "bob@example.com");
        assert_eq!(
            v.process(&mut record, &BatchContext::for_tests()),
            Verdict::Drop(DropReason::QualityViolation)
        );
        // PII was never scanned.
        assert_eq!(record.get_str("message"), Some("bob@example.com"));
        assert_eq!(rx.try_recv().unwrap().category, "quality");
    }

    #[test]
    fn test_regressed_record_raises_feedback() {
        let (v, mut rx) = verification(lenient());
        let mut record = Record::metric()
            .with_attr("database_name", "orders")
            .with_attr("query_id", "q1")
            .with_attr(plan_attrs::HAS_REGRESSION, true)
            .with_attr(plan_attrs::SEVERITY, "high")
            .with_attr(plan_attrs::TIME_RATIO, 4.0)
            .with_attr(plan_attrs::RECOMMENDATION, "Add an index on orders");
        assert_eq!(v.process(&mut record, &BatchContext::for_tests()), Verdict::Pass);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.category, "plan_regression");
        assert_eq!(event.level, FeedbackLevel::Warning);
        assert_eq!(event.database.as_deref(), Some("orders"));
        assert_eq!(event.metrics.get("time_ratio"), Some(&4.0));
        assert_eq!(event.remediation.as_deref(), Some("Add an index on orders"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_stage_passes_everything() {
        let mut config = VerificationConfig::default();
        config.enabled = false;
        let (v, _rx) = verification(config);
        let mut record = Record::log().with_attr("message", "bob@example.com");
        assert_eq!(v.process(&mut record, &BatchContext::for_tests()), Verdict::Pass);
        assert!(!record.contains(pii::PII_ACTION_ATTRIBUTE));
    }

    #[test]
    fn test_health_check_triggers_healer_and_escalates() {
        let mut config = lenient();
        config.healing.unhealthy_threshold = 2;
        config.healing.max_retries = 0;
        let (v, mut rx) = verification(config);
        let inputs = HealthInputs {
            usage: ResourceUsage {
                memory_percent: 99.0,
                ..Default::default()
            },
            error_rate: 0.0,
        };

        assert_eq!(v.check_health(&inputs).status, HealthStatus::Critical);
        let snapshot = v.check_health(&inputs);
        assert_eq!(snapshot.healer.state, "recovering");
        assert_eq!(v.healer().history().len(), 3);

        // The first backoff has elapsed on the mock clock only after advancing,
        // so a tick right away does nothing.
        assert!(v.heal().actions.is_empty());

        let mut categories = Vec::new();
        while let Ok(event) = rx.try_recv() {
            categories.push(event.category.to_string());
        }
        assert_eq!(categories, vec!["health", "healing", "healing", "healing"]);
    }

    #[test]
    fn test_feedback_channel_drops_when_full() {
        let (tx, mut rx) = feedback_channel(1);
        assert!(tx.emit(FeedbackEvent::new(FeedbackLevel::Info, "test", "first")));
        assert!(!tx.emit(FeedbackEvent::new(FeedbackLevel::Info, "test", "second")));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().message, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_stops_on_cancel() {
        let (v, _rx) = verification(lenient());
        let v = Arc::new(v);
        let token = CancellationToken::new();
        let probe = ManualProbe::new(ResourceUsage::default());
        let handle = tokio::spawn(Arc::clone(&v).run_health_monitor(Box::new(probe), token.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(v.health().current().components.len(), 5);
        token.cancel();
        handle.await.unwrap();
    }
}
