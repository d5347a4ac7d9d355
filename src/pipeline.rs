// ============================================================================
// PIPELINE
// ============================================================================
// Owns the four stages and the background tasks around them.
//
//   Batch ──▶ circuit_breaker ──▶ sampler ──▶ plan_extractor ──▶ verification ──▶ Batch
//
// Every stage sees one record at a time and answers with a Verdict; the batch
// loop filters with `retain_mut` so surviving records keep their order.
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::circuit_breaker::{CircuitBreaker, Outcome};
use crate::config::PipelineConfig;
use crate::error::{ErrorStats, PipelineError, PipelineResult};
use crate::metrics::{PipelineCounters, PipelineMetrics};
use crate::plan::PlanExtractor;
use crate::resources::{ResourceProbe, SystemProbe};
use crate::sampler::AdaptiveSampler;
use crate::types::{Batch, Clock, Instant, Record, Verdict};
use crate::verification::{
    feedback_channel, FeedbackEvent, HealthSnapshot, QualityValidator, RecoveryHooks, TunableSet, TunableTable,
    Verification,
};

// ----------------------------------------------------------------------------
// Stage Contract
// ----------------------------------------------------------------------------

/// Per-batch values shared by every stage.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext {
    pub now: Instant,
    /// Multiplier the sampler applies to every rule rate
    pub sampling_scale: f64,
    pub tunables_version: u64,
}

impl BatchContext {
    pub fn new(now: Instant, tunables: &TunableSet) -> Self {
        Self {
            now,
            sampling_scale: tunables.sampling_scale,
            tunables_version: tunables.version,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            now: Clock::new().now(),
            sampling_scale: 1.0,
            tunables_version: 0,
        }
    }
}

/// One transformation step. Stages take `&self` so batches can run
/// concurrently.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, record: &mut Record, ctx: &BatchContext) -> Verdict;
}

// ----------------------------------------------------------------------------
// Recovery Hooks
// ----------------------------------------------------------------------------

/// Host hook that drops and re-establishes database connections.
pub trait ConnectionReset: Send + Sync {
    fn reset(&self) -> Result<(), String>;
}

struct CacheRecovery {
    sampler: Arc<AdaptiveSampler>,
    plans: Arc<PlanExtractor>,
    quality: Arc<QualityValidator>,
    connections: RwLock<Option<Arc<dyn ConnectionReset>>>,
}

impl RecoveryHooks for CacheRecovery {
    fn release_memory(&self) -> Result<usize, String> {
        Ok(self.sampler.release_memory() + self.plans.release_memory() + self.quality.release_memory())
    }

    fn clear_caches(&self) -> Result<usize, String> {
        Ok(self.sampler.clear_dedup() + self.plans.clear_history() + self.quality.clear_duplicates())
    }

    fn reset_connections(&self) -> Result<(), String> {
        let hook = self.connections.read().clone();
        match hook {
            Some(hook) => hook.reset(),
            None => {
                debug!(target: "dbintel::pipeline", "No connection hook registered, nothing to reset");
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
    circuit_breaker: Arc<CircuitBreaker>,
    sampler: Arc<AdaptiveSampler>,
    plans: Arc<PlanExtractor>,
    verification: Arc<Verification>,
    /// Enabled stages in execution order
    stages: Vec<Arc<dyn Stage>>,
    tunables: Arc<TunableTable>,
    recovery: Arc<CacheRecovery>,
    feedback_rx: Mutex<Option<mpsc::Receiver<FeedbackEvent>>>,
    error_stats: ErrorStats,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    running: AtomicBool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_clock(config, Clock::new())
    }

    /// Build the pipeline on an explicit clock; tests pass `Clock::mock()`.
    pub fn with_clock(config: PipelineConfig, clock: Clock) -> PipelineResult<Self> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::new()?);
        let shards = config.pipeline.cache_shards;

        let circuit_breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
            Arc::clone(&metrics),
        )?);
        let sampler = Arc::new(AdaptiveSampler::new(
            config.sampler.clone(),
            shards,
            clock.clone(),
            Arc::clone(&metrics),
        )?);
        let plans = Arc::new(PlanExtractor::new(
            config.plan_extractor.clone(),
            shards,
            clock.clone(),
            Arc::clone(&metrics),
        )?);
        let quality = Arc::new(QualityValidator::new(
            config.verification.quality.clone(),
            config.verification.pii.redaction_placeholder.clone(),
            shards,
            clock.clone(),
            Arc::clone(&metrics),
        )?);

        let recovery = Arc::new(CacheRecovery {
            sampler: Arc::clone(&sampler),
            plans: Arc::clone(&plans),
            quality: Arc::clone(&quality),
            connections: RwLock::new(None),
        });
        let tunables = Arc::new(TunableTable::new(&config.verification.tuning));
        let (feedback, feedback_rx) = feedback_channel(config.verification.feedback_channel_capacity);
        let verification = Arc::new(Verification::new(
            config.verification.clone(),
            quality,
            Arc::clone(&tunables),
            Arc::clone(&recovery) as Arc<dyn RecoveryHooks>,
            feedback,
            clock.clone(),
            Arc::clone(&metrics),
        )?);

        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(4);
        if config.circuit_breaker.enabled {
            stages.push(Arc::clone(&circuit_breaker) as Arc<dyn Stage>);
        }
        if config.sampler.enabled {
            stages.push(Arc::clone(&sampler) as Arc<dyn Stage>);
        }
        if config.plan_extractor.enabled {
            stages.push(Arc::clone(&plans) as Arc<dyn Stage>);
        }
        if config.verification.enabled {
            stages.push(Arc::clone(&verification) as Arc<dyn Stage>);
        }

        info!(
            target: "dbintel::init",
            instance = %config.pipeline.instance_name,
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Pipeline initialized"
        );

        Ok(Self {
            config,
            clock,
            metrics,
            circuit_breaker,
            sampler,
            plans,
            verification,
            stages,
            tunables,
            recovery,
            feedback_rx: Mutex::new(Some(feedback_rx)),
            error_stats: ErrorStats::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            running: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------------
    // Record Path
    // ------------------------------------------------------------------------

    /// Run `batch` through every enabled stage. Dropped records are counted
    /// per stage and reason; survivors keep their relative order.
    pub fn process_batch(&self, batch: Batch) -> PipelineResult<Batch> {
        if self.shutdown.is_cancelled() {
            let err = PipelineError::ShuttingDown;
            self.error_stats.record(&err);
            return Err(err);
        }

        let tunables = self.tunables.current();
        let ctx = BatchContext::new(self.clock.now(), &tunables);
        let mut records = batch.records;
        let received = records.len();
        PipelineCounters::add(&self.metrics.counters.records_in, received as u64);

        for stage in &self.stages {
            if records.is_empty() {
                break;
            }
            records.retain_mut(|record| match stage.process(record, &ctx) {
                Verdict::Pass => true,
                Verdict::Drop(reason) => {
                    self.metrics
                        .records_dropped
                        .with_label_values(&[stage.name(), reason.as_str()])
                        .inc();
                    false
                }
            });
        }

        PipelineCounters::add(&self.metrics.counters.records_out, records.len() as u64);
        trace!(
            target: "dbintel::pipeline",
            received,
            forwarded = records.len(),
            tunables_version = ctx.tunables_version,
            "Batch processed"
        );
        Ok(Batch::new(records))
    }

    /// Feed the outcome of an export attempt back into the circuits of `keys`.
    pub fn report_export<I, K>(&self, keys: I, result: Result<(), &str>)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        PipelineCounters::add(&self.metrics.counters.export_attempts, 1);
        if result.is_err() {
            PipelineCounters::add(&self.metrics.counters.export_failures, 1);
        }
        for key in keys {
            let outcome = match result {
                Ok(()) => Outcome::Success,
                Err(message) => Outcome::Failure(message),
            };
            self.circuit_breaker.record_outcome(key.as_ref(), outcome);
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.verification.health().current()
    }

    pub fn report_connectivity(&self, database: &str, reachable: bool) {
        self.verification.health().report_connectivity(database, reachable);
    }

    /// Register the hook the self-healer calls for `reset_connections`.
    pub fn set_connection_reset(&self, hook: Arc<dyn ConnectionReset>) {
        *self.recovery.connections.write() = Some(hook);
    }

    /// Hand the feedback receiver to the host. Only the first call gets it.
    pub fn take_feedback_receiver(&self) -> Option<mpsc::Receiver<FeedbackEvent>> {
        self.feedback_rx.lock().take()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn tunables(&self) -> Arc<TunableSet> {
        self.tunables.current()
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.sampler
    }

    pub fn plan_extractor(&self) -> &Arc<PlanExtractor> {
        &self.plans
    }

    pub fn verification(&self) -> &Arc<Verification> {
        &self.verification
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.error_stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Background Tasks
    // ------------------------------------------------------------------------

    /// Spawn the background tasks with system probes. Needs a tokio runtime.
    pub fn start(&self) -> PipelineResult<()> {
        self.start_with_probes(Box::new(SystemProbe::new()), Box::new(SystemProbe::new()))
    }

    /// Spawn the background tasks; `resource_probe` feeds the circuit
    /// breaker's load shedding and `health_probe` the health monitor.
    pub fn start_with_probes(
        &self,
        resource_probe: Box<dyn ResourceProbe>,
        health_probe: Box<dyn ResourceProbe>,
    ) -> PipelineResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PipelineError::Internal("background tasks need a tokio runtime".into()));
        }
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            warn!(target: "dbintel::pipeline", "Pipeline already started");
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        let mut spawned = Vec::new();

        if self.config.circuit_breaker.enabled && self.config.circuit_breaker.resource.enabled {
            tasks.spawn(Arc::clone(&self.circuit_breaker).run_resource_monitor(resource_probe, self.shutdown.clone()));
            spawned.push("resource_monitor");
        }
        if self.config.sampler.enabled && self.config.sampler.dedup.enabled {
            tasks.spawn(Arc::clone(&self.sampler).run_dedup_sweeper(self.shutdown.clone()));
            spawned.push("dedup_sweeper");
        }
        if self.config.plan_extractor.enabled {
            tasks.spawn(Arc::clone(&self.plans).run_history_sweeper(self.shutdown.clone()));
            spawned.push("history_sweeper");
        }

        let verification = &self.config.verification;
        if verification.enabled {
            if verification.health.enabled {
                tasks.spawn(Arc::clone(&self.verification).run_health_monitor(health_probe, self.shutdown.clone()));
                spawned.push("health_monitor");
            }
            if verification.healing.enabled {
                tasks.spawn(Arc::clone(&self.verification).run_healer(self.shutdown.clone()));
                spawned.push("self_healer");
            }
            if verification.tuning.enabled {
                tasks.spawn(Arc::clone(&self.verification).run_tuner(self.shutdown.clone()));
                spawned.push("auto_tuner");
            }
        }

        info!(target: "dbintel::pipeline", tasks = ?spawned, "Background tasks started");
        Ok(())
    }

    /// Cancel the background tasks and wait for them for at most the grace
    /// period; stragglers are aborted. Later batches fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        info!(target: "dbintel::pipeline", "Starting graceful shutdown");
        let started = StdInstant::now();
        self.shutdown.cancel();
        self.running.store(false, AtomicOrdering::Release);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = self.config.pipeline.shutdown_grace_period;

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    self.record_task_failure(&e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                target: "dbintel::pipeline",
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Background tasks exceeded grace period, aborting"
            );
            tasks.abort_all();
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        self.record_task_failure(&e);
                    }
                }
            }
        }

        info!(
            target: "dbintel::pipeline",
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline shutdown complete"
        );
    }

    fn record_task_failure(&self, error: &tokio::task::JoinError) {
        let err = PipelineError::Internal(format!("background task failed: {}", error));
        warn!(target: "dbintel::pipeline", error = %err, "Background task ended abnormally");
        self.error_stats.record(&err);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QualityConfig, SamplerConfig};
    use crate::resources::{ManualProbe, ResourceUsage};
    use crate::types::AttributeValue;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn permissive_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.sampler = SamplerConfig {
            default_sample_rate: 1.0,
            rules: Vec::new(),
            ..Default::default()
        };
        config.verification.quality = QualityConfig {
            required_attributes: Vec::new(),
            duplicate_detection: false,
            ..Default::default()
        };
        config
    }

    fn pipeline(config: PipelineConfig) -> Pipeline {
        pipeline_with_mock(config).0
    }

    fn pipeline_with_mock(config: PipelineConfig) -> (Pipeline, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (Pipeline::with_clock(config, clock).unwrap(), mock)
    }

    const INDEXED: &str = r#"{"Plan": {"Node Type": "Index Scan", "Relation Name": "orders",
        "Index Name": "orders_pkey", "Total Cost": 8.3, "Plan Rows": 1}}"#;
    const SCANNED: &str = r#"{"Plan": {"Node Type": "Seq Scan", "Relation Name": "orders",
        "Total Cost": 9.1, "Plan Rows": 60000}}"#;

    fn plan_report(id: &str, plan: &str, exec_ms: f64) -> Record {
        Record::metric()
            .with_attr("database_name", "orders")
            .with_attr("db.system", "postgresql")
            .with_attr("query_id", id)
            .with_attr("plan_json", plan)
            .with_attr("mean_exec_time_ms", exec_ms)
    }

    fn query(db: &str, id: &str, message: &str) -> Record {
        Record::log()
            .with_attr("database_name", db)
            .with_attr("query_id", id)
            .with_attr("duration_ms", 12.5)
            .with_attr("message", message)
    }

    fn query_ids(batch: &Batch) -> Vec<&str> {
        batch.iter().filter_map(|r| r.get_str("query_id")).collect()
    }

    #[test]
    fn test_batch_order_and_drops() {
        let p = pipeline(permissive_config());
        let batch = Batch::new(vec![
            query("orders", "q1", "fine").with_attr("plan_json", INDEXED),
            query("orders", "q1", "fine").with_attr("plan_json", INDEXED),
            query("orders", "q2", "mail bob@example.com"),
            query("billing", "q3", "fine"),
        ]);

        let out = p.process_batch(batch).unwrap();
        assert_eq!(query_ids(&out), vec!["q1", "q2", "q3"]);
        assert_eq!(out.records[1].get_str("message"), Some("mail [REDACTED]"));
        assert_eq!(
            out.records[0].get("circuit.state"),
            Some(&AttributeValue::from("closed"))
        );
        assert_eq!(p.metrics().dropped("sampler", "duplicate"), 1);

        let counters = p.metrics().counters.snapshot();
        assert_eq!(counters.records_in, 4);
        assert_eq!(counters.records_out, 3);
    }

    #[test]
    fn test_plan_change_reaches_regression_detection() {
        let (p, mock) = pipeline_with_mock(permissive_config());
        let mut feedback = p.take_feedback_receiver().unwrap();

        let out = p.process_batch(Batch::new(vec![plan_report("q1", INDEXED, 10.0)])).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.records[0].get_bool("plan.has_regression"), Some(false));

        // Same query, new plan, four times slower.
        let out = p.process_batch(Batch::new(vec![plan_report("q1", SCANNED, 40.0)])).unwrap();
        assert_eq!(out.len(), 1);
        let regressed = &out.records[0];
        assert_eq!(regressed.get_bool("plan.has_regression"), Some(true));
        assert_eq!(regressed.get_str("plan.regression.severity"), Some("high"));
        assert_eq!(regressed.get_f64("plan.regression.time_ratio"), Some(4.0));
        assert_eq!(p.metrics().plan_regressions.with_label_values(&["high"]).get(), 1);

        let event = feedback.try_recv().unwrap();
        assert_eq!(event.category, "plan_regression");
        assert_eq!(event.database.as_deref(), Some("orders"));
        assert!(event.remediation.unwrap().contains("orders"));

        // The regressed plan keeps being reported once a minute.
        let mut kept = 0;
        for _ in 0..10 {
            mock.increment(Duration::from_secs(60));
            let out = p.process_batch(Batch::new(vec![plan_report("q1", SCANNED, 40.0)])).unwrap();
            kept += out.len();
        }
        assert_eq!(kept, 2);
        assert_eq!(p.metrics().dropped("sampler", "duplicate"), 8);
        assert_eq!(p.metrics().plan_regressions.with_label_values(&["high"]).get(), 1);
    }

    #[test]
    fn test_export_failures_open_circuit() {
        let p = pipeline(permissive_config());
        let threshold = p.config().circuit_breaker.failure_threshold;
        for _ in 0..threshold {
            p.report_export(["orders"], Err("dial tcp: connection refused"));
        }

        let out = p
            .process_batch(Batch::new(vec![
                query("orders", "q1", "a"),
                query("billing", "q2", "b"),
            ]))
            .unwrap();
        assert_eq!(query_ids(&out), vec!["q2"]);
        assert_eq!(p.metrics().dropped("circuit_breaker", "circuit_open"), 1);

        let counters = p.metrics().counters.snapshot();
        assert_eq!(counters.export_attempts, threshold as u64);
        assert_eq!(counters.export_failures, threshold as u64);
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let mut config = permissive_config();
        config.sampler.enabled = false;
        config.verification.enabled = false;
        let p = pipeline(config);
        let out = p
            .process_batch(Batch::new(vec![
                query("orders", "q1", "bob@example.com"),
                query("orders", "q1", "bob@example.com"),
            ]))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.records[0].get_str("message"), Some("bob@example.com"));
    }

    #[test]
    fn test_feedback_receiver_taken_once() {
        let p = pipeline(permissive_config());
        assert!(p.take_feedback_receiver().is_some());
        assert!(p.take_feedback_receiver().is_none());
    }

    struct CountingReset(AtomicUsize);

    impl ConnectionReset for CountingReset {
        fn reset(&self) -> Result<(), String> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_recovery_hooks_reach_caches_and_host() {
        let p = pipeline(permissive_config());
        p.process_batch(Batch::new(vec![
            plan_report("q1", INDEXED, 1.0),
            plan_report("q2", INDEXED, 1.0),
        ]))
        .unwrap();
        assert_eq!(p.sampler().dedup_stats().len, 2);
        assert_eq!(p.plan_extractor().history_stats().len, 2);

        assert_eq!(p.recovery.clear_caches(), Ok(4));
        assert_eq!(p.sampler().dedup_stats().len, 0);
        assert_eq!(p.plan_extractor().history_stats().len, 0);
        assert_eq!(p.recovery.reset_connections(), Ok(()));

        let hook = Arc::new(CountingReset(AtomicUsize::new(0)));
        p.set_connection_reset(hook.clone());
        assert_eq!(p.recovery.reset_connections(), Ok(()));
        assert_eq!(hook.0.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_tasks_and_rejects_batches() {
        let mut config = permissive_config();
        config.pipeline.shutdown_grace_period = Duration::from_secs(1);
        let p = pipeline(config);
        let probe = ManualProbe::new(ResourceUsage::default());

        p.start_with_probes(Box::new(probe.clone()), Box::new(probe)).unwrap();
        assert!(p.is_running());
        assert!(!p.tasks.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        p.shutdown().await;

        assert!(!p.is_running());
        assert!(p.tasks.lock().is_empty());
        assert_eq!(p.error_stats().total_errors(), 0);

        let err = p.process_batch(Batch::new(vec![query("orders", "q1", "a")])).unwrap_err();
        assert!(matches!(err, PipelineError::ShuttingDown));
        assert_eq!(p.error_stats().count_by_category(err.category()), 1);
    }

    #[test]
    fn test_start_requires_runtime() {
        let p = pipeline(permissive_config());
        assert!(matches!(p.start(), Err(PipelineError::Internal(_))));
        assert!(!p.is_running());
    }
}
