//! The plan extraction stage.

use std::sync::Arc;

use compact_str::CompactString;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::anonymizer::QueryAnonymizer;
use super::history::{PerformanceSnapshot, PlanHistory, PlanObservation};
use super::{PlanDialect, PlanSummary};
use crate::cache::{CacheStats, ShardedCache};
use crate::config::PlanExtractorConfig;
use crate::error::{ConfigResult, ProcessingResult};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{BatchContext, Stage};
use crate::types::{Clock, Record, Verdict};

pub mod attrs {
    pub const PLAN_HASH: &str = "db.query.plan.hash";
    pub const OPERATION: &str = "db.query.plan.operation";
    pub const COST: &str = "db.query.plan.cost";
    pub const ROWS: &str = "db.query.plan.rows";
    pub const NODE_COUNT: &str = "db.query.plan.node_count";
    pub const DEPTH: &str = "db.query.plan.depth";
    pub const HAS_SEQ_SCAN: &str = "db.query.plan.has_seq_scan";
    pub const HAS_NESTED_LOOP: &str = "db.query.plan.has_nested_loop";
    pub const EFFICIENCY: &str = "db.query.plan.efficiency";
    pub const NEEDS_OPTIMIZATION: &str = "db.query.plan.needs_optimization";
    pub const HAS_REGRESSION: &str = "plan.has_regression";
    pub const SEVERITY: &str = "plan.regression.severity";
    pub const TIME_RATIO: &str = "plan.regression.time_ratio";
    pub const IO_RATIO: &str = "plan.regression.io_ratio";
    pub const COST_RATIO: &str = "plan.regression.cost_ratio";
    pub const RECOMMENDATION: &str = "plan.recommendation";
}

pub struct PlanExtractor {
    config: PlanExtractorConfig,
    histories: ShardedCache<CompactString, PlanHistory>,
    anonymizer: QueryAnonymizer,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
}

impl PlanExtractor {
    pub fn new(
        config: PlanExtractorConfig,
        shards: usize,
        clock: Clock,
        metrics: Arc<PipelineMetrics>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let histories = ShardedCache::new(config.history_capacity, Some(config.history_ttl), shards);
        Ok(Self {
            config,
            histories,
            anonymizer: QueryAnonymizer,
            clock,
            metrics,
        })
    }

    /// Parse a plan payload; `dialect = None` detects it.
    pub fn extract(&self, raw: &str, dialect: Option<PlanDialect>) -> ProcessingResult<PlanSummary> {
        super::extract(raw, dialect, &self.config, &self.clock)
    }

    /// Record `summary` for `query_id` and report any regression.
    pub fn observe(&self, query_id: &str, summary: Arc<PlanSummary>, performance: PerformanceSnapshot) -> PlanObservation {
        let now = self.clock.now();
        let mut shard = self.histories.shard(query_id);
        if let Some(history) = shard.get_mut(query_id, now) {
            let observation = history.observe(summary, performance, now, &self.config);
            shard.touch(query_id, now);
            return observation;
        }
        let mut history = PlanHistory::new(self.config.history_size);
        let observation = history.observe(summary, performance, now, &self.config);
        shard.insert(CompactString::from(query_id), history, now);
        observation
    }

    fn anonymize(&self, record: &mut Record) {
        let anonymize = &self.config.anonymize;
        for attribute in &anonymize.attributes {
            let Some(text) = record.get_str(attribute) else {
                continue;
            };
            let scrubbed = self.anonymizer.anonymize(text);
            let fingerprint = self.anonymizer.fingerprint(text);
            record.set(attribute, scrubbed);
            if !record.contains(&anonymize.fingerprint_attribute) {
                record.set(&anonymize.fingerprint_attribute, format!("{:016x}", fingerprint));
            }
        }
    }

    fn annotate(&self, record: &mut Record, summary: &PlanSummary) {
        record.set(attrs::PLAN_HASH, summary.hash_hex());
        record.set(attrs::OPERATION, summary.root_operation.clone());
        record.set(attrs::COST, summary.total_cost);
        record.set(attrs::ROWS, summary.estimated_rows);
        record.set(attrs::NODE_COUNT, summary.node_count);
        record.set(attrs::DEPTH, summary.depth);
        record.set(attrs::HAS_SEQ_SCAN, summary.has_seq_scan());
        record.set(attrs::HAS_NESTED_LOOP, summary.has_nested_loop());
        record.set(attrs::EFFICIENCY, summary.efficiency());
        record.set(attrs::NEEDS_OPTIMIZATION, summary.needs_optimization(&self.config));
    }

    // ---- cache maintenance ----

    pub fn sweep_history(&self) -> usize {
        self.histories.sweep_expired(self.clock.now())
    }

    pub fn release_memory(&self) -> usize {
        let removed = self.sweep_history();
        self.histories.shrink_to_fit();
        removed
    }

    pub fn clear_history(&self) -> usize {
        let len = self.histories.len();
        self.histories.clear();
        len
    }

    pub fn history_stats(&self) -> CacheStats {
        self.histories.stats()
    }

    pub async fn run_history_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_history();
                    if removed > 0 {
                        debug!(target: "dbintel::plan", removed, "Swept plan history");
                    }
                }
            }
        }
    }
}

impl Stage for PlanExtractor {
    fn name(&self) -> &'static str {
        "plan_extractor"
    }

    fn process(&self, record: &mut Record, _ctx: &BatchContext) -> Verdict {
        let raw = self
            .config
            .plan_attributes
            .iter()
            .find_map(|attr| record.get_str(attr));

        // A plan that fails to parse leaves the whole record untouched.
        let summary = match raw {
            None => None,
            Some(raw) => {
                let dialect = record
                    .get_str(&self.config.dialect_attribute)
                    .and_then(PlanDialect::from_system);
                match self.extract(raw, dialect) {
                    Ok(summary) => Some(Arc::new(summary)),
                    Err(e) => {
                        debug!(target: "dbintel::plan", error = %e, "Skipping unparseable plan");
                        self.metrics.plan_parse_failures.with_label_values(&[e.kind()]).inc();
                        return Verdict::Pass;
                    }
                }
            }
        };

        if self.config.anonymize.enabled {
            self.anonymize(record);
        }
        let Some(summary) = summary else {
            return Verdict::Pass;
        };

        self.metrics
            .plans_parsed
            .with_label_values(&[summary.dialect.as_str()])
            .inc();
        self.annotate(record, &summary);

        let query_id = record
            .get(&self.config.query_id_attribute)
            .map(|v| v.render());
        let regression = query_id.and_then(|query_id| {
            let performance = PerformanceSnapshot {
                mean_exec_time_ms: record.get_f64(&self.config.exec_time_attribute),
                io_blocks: record.get_f64(&self.config.io_attribute),
            };
            let observation = self.observe(&query_id, summary.clone(), performance);
            observation.regression.map(|r| (query_id, r))
        });

        let Some((query_id, regression)) = regression else {
            record.set(attrs::HAS_REGRESSION, false);
            return Verdict::Pass;
        };

        warn!(
            target: "dbintel::plan",
            query_id = %query_id,
            severity = regression.severity.as_str(),
            time_ratio = ?regression.time_ratio,
            cost_ratio = ?regression.cost_ratio,
            "Plan regression detected"
        );
        self.metrics
            .plan_regressions
            .with_label_values(&[regression.severity.as_str()])
            .inc();

        record.set(attrs::HAS_REGRESSION, true);
        record.set(attrs::SEVERITY, regression.severity.as_str());
        for (attr, value) in [
            (attrs::TIME_RATIO, regression.time_ratio),
            (attrs::IO_RATIO, regression.io_ratio),
            (attrs::COST_RATIO, regression.cost_ratio),
        ] {
            if let Some(value) = value {
                record.set(attr, value);
            }
        }
        record.set(attrs::RECOMMENDATION, regression.recommendation);
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn extractor() -> PlanExtractor {
        let (clock, _mock) = Clock::mock();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        PlanExtractor::new(PlanExtractorConfig::default(), 4, clock, metrics).unwrap()
    }

    const INDEXED: &str = r#"{"Plan": {"Node Type": "Index Scan", "Relation Name": "orders",
        "Index Name": "orders_pkey", "Total Cost": 8.3, "Plan Rows": 1}}"#;
    const SCANNED: &str = r#"{"Plan": {"Node Type": "Seq Scan", "Relation Name": "orders",
        "Total Cost": 9.1, "Plan Rows": 60000}}"#;

    fn plan_record(plan: &str, exec_ms: f64) -> Record {
        Record::metric()
            .with_attr("query_id", "q-17")
            .with_attr("db.system", "postgresql")
            .with_attr("plan_json", plan)
            .with_attr("mean_exec_time_ms", exec_ms)
    }

    #[test]
    fn test_plan_attributes_and_regression() {
        let stage = extractor();
        let ctx = BatchContext::for_tests();

        let mut baseline = plan_record(INDEXED, 10.0);
        assert_eq!(stage.process(&mut baseline, &ctx), Verdict::Pass);
        assert_eq!(baseline.get_str(attrs::OPERATION), Some("Index Scan"));
        assert_eq!(baseline.get_bool(attrs::HAS_SEQ_SCAN), Some(false));
        assert_eq!(baseline.get_bool(attrs::HAS_REGRESSION), Some(false));

        let mut slower = plan_record(SCANNED, 40.0);
        stage.process(&mut slower, &ctx);
        assert_eq!(slower.get_bool(attrs::HAS_REGRESSION), Some(true));
        assert_eq!(slower.get_f64(attrs::TIME_RATIO), Some(4.0));
        assert_eq!(slower.get_str(attrs::SEVERITY), Some("high"));
        assert!(slower.get_str(attrs::RECOMMENDATION).unwrap().contains("orders"));
        assert_ne!(baseline.get_str(attrs::PLAN_HASH), slower.get_str(attrs::PLAN_HASH));
        assert_eq!(stage.metrics.plan_regressions.with_label_values(&["high"]).get(), 1);
    }

    #[test]
    fn test_identical_plans_hash_identically() {
        let stage = extractor();
        let ctx = BatchContext::for_tests();
        let mut a = plan_record(INDEXED, 10.0);
        let mut b = plan_record(INDEXED, 10.0);
        stage.process(&mut a, &ctx);
        stage.process(&mut b, &ctx);
        assert_eq!(a.get_str(attrs::PLAN_HASH), b.get_str(attrs::PLAN_HASH));
        assert_eq!(stage.history_stats().len, 1);
    }

    #[test]
    fn test_malformed_plan_passes_through_untouched() {
        let stage = extractor();
        let ctx = BatchContext::for_tests();
        let mut record =
            plan_record("{\"Plan\": [oops", 10.0).with_attr("query_text", "SELECT * FROM orders WHERE id = 42");
        let before = record.clone();

        assert_eq!(stage.process(&mut record, &ctx), Verdict::Pass);
        assert_eq!(record, before);
        assert!(!record.contains("db.query.fingerprint"));
        assert_eq!(
            stage.metrics.plan_parse_failures.with_label_values(&["malformed"]).get(),
            1
        );
    }

    #[test]
    fn test_query_text_is_anonymized() {
        let stage = extractor();
        let ctx = BatchContext::for_tests();
        let mut record = Record::log().with_attr("query_text", "SELECT * FROM t WHERE email = 'a@b.co'");
        stage.process(&mut record, &ctx);
        assert_eq!(record.get_str("query_text"), Some("SELECT * FROM t WHERE email = ?"));
        assert_eq!(record.get_str("db.query.fingerprint").map(str::len), Some(16));
    }

    #[test]
    fn test_clear_history() {
        let stage = extractor();
        let ctx = BatchContext::for_tests();
        stage.process(&mut plan_record(INDEXED, 1.0), &ctx);
        assert_eq!(stage.clear_history(), 1);
        assert_eq!(stage.history_stats().len, 0);
    }
}
