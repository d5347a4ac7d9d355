//! Per-query plan history and regression detection.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use super::PlanSummary;
use crate::config::{PlanExtractorConfig, RegressionConfig};
use crate::types::Instant;

/// Execution statistics observed alongside a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub mean_exec_time_ms: Option<f64>,
    pub io_blocks: Option<f64>,
}

impl PerformanceSnapshot {
    /// Overlay the values present in `newer`.
    fn refresh(&mut self, newer: &PerformanceSnapshot) {
        if newer.mean_exec_time_ms.is_some() {
            self.mean_exec_time_ms = newer.mean_exec_time_ms;
        }
        if newer.io_blocks.is_some() {
            self.io_blocks = newer.io_blocks;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub summary: Arc<PlanSummary>,
    pub performance: PerformanceSnapshot,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RegressionSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegressionSeverity::Low => "low",
            RegressionSeverity::Medium => "medium",
            RegressionSeverity::High => "high",
            RegressionSeverity::Critical => "critical",
        }
    }

    fn from_ratio(ratio: f64, cuts: &RegressionConfig) -> Self {
        if ratio >= cuts.critical_at {
            RegressionSeverity::Critical
        } else if ratio >= cuts.high_at {
            RegressionSeverity::High
        } else if ratio >= cuts.medium_at {
            RegressionSeverity::Medium
        } else {
            RegressionSeverity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRegression {
    pub severity: RegressionSeverity,
    pub previous_hash: u64,
    pub current_hash: u64,
    pub time_ratio: Option<f64>,
    pub io_ratio: Option<f64>,
    pub cost_ratio: Option<f64>,
    pub recommendation: String,
}

/// What one observation did to a query's history.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanObservation {
    /// The plan differs from the latest one on record
    pub plan_changed: bool,
    pub distinct_plans: usize,
    pub regression: Option<PlanRegression>,
}

/// Ring of the most recent distinct plans for one query, oldest first.
#[derive(Debug, Clone)]
pub struct PlanHistory {
    plans: VecDeque<PlanRecord>,
    capacity: usize,
}

impl PlanHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            plans: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn latest(&self) -> Option<&PlanRecord> {
        self.plans.back()
    }

    pub fn observe(
        &mut self,
        summary: Arc<PlanSummary>,
        performance: PerformanceSnapshot,
        now: Instant,
        config: &PlanExtractorConfig,
    ) -> PlanObservation {
        if let Some(latest) = self.plans.back_mut() {
            if latest.summary.hash == summary.hash {
                latest.performance.refresh(&performance);
                latest.last_seen = now;
                return PlanObservation {
                    plan_changed: false,
                    distinct_plans: self.plans.len(),
                    regression: None,
                };
            }
        }

        let plan_changed = !self.plans.is_empty();
        let regression = self
            .plans
            .back()
            .and_then(|previous| detect_regression(previous, &summary, &performance, config));

        self.plans.retain(|p| p.summary.hash != summary.hash);
        self.plans.push_back(PlanRecord {
            summary,
            performance,
            first_seen: now,
            last_seen: now,
        });
        while self.plans.len() > self.capacity {
            self.plans.pop_front();
        }

        PlanObservation {
            plan_changed,
            distinct_plans: self.plans.len(),
            regression,
        }
    }
}

fn ratio(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    match (current, previous) {
        (Some(current), Some(previous)) if previous > 0.0 => Some(current / previous),
        _ => None,
    }
}

fn detect_regression(
    previous: &PlanRecord,
    current: &PlanSummary,
    performance: &PerformanceSnapshot,
    config: &PlanExtractorConfig,
) -> Option<PlanRegression> {
    let thresholds = &config.regression;
    let time_ratio = ratio(performance.mean_exec_time_ms, previous.performance.mean_exec_time_ms);
    let io_ratio = ratio(performance.io_blocks, previous.performance.io_blocks);
    let cost_ratio = ratio(Some(current.total_cost), Some(previous.summary.total_cost));

    let exceeds = |value: Option<f64>, limit: f64| value.is_some_and(|v| v > limit);
    let time_hit = exceeds(time_ratio, thresholds.time_ratio);
    let io_hit = exceeds(io_ratio, thresholds.io_ratio);
    let cost_hit = exceeds(cost_ratio, thresholds.cost_ratio);
    if !(time_hit || io_hit || cost_hit) {
        return None;
    }

    let largest = [time_ratio, io_ratio, cost_ratio]
        .into_iter()
        .flatten()
        .fold(0.0_f64, f64::max);

    Some(PlanRegression {
        severity: RegressionSeverity::from_ratio(largest, thresholds),
        previous_hash: previous.summary.hash,
        current_hash: current.hash,
        time_ratio,
        io_ratio,
        cost_ratio,
        recommendation: recommend(&previous.summary, current, cost_hit, io_hit, cost_ratio, io_ratio, config),
    })
}

fn recommend(
    previous: &PlanSummary,
    current: &PlanSummary,
    cost_hit: bool,
    io_hit: bool,
    cost_ratio: Option<f64>,
    io_ratio: Option<f64>,
    config: &PlanExtractorConfig,
) -> String {
    let new_large_scan = current.seq_scans.iter().find(|(table, rows)| {
        *rows >= config.large_table_rows && !previous.seq_scans.iter().any(|(t, _)| t == table)
    });
    if let Some((table, rows)) = new_large_scan {
        return format!(
            "New sequential scan on {} (~{:.0} rows); consider adding an index on {}",
            table, rows, table
        );
    }
    if current.nested_loop_depth > previous.nested_loop_depth {
        return format!(
            "Nested loop depth grew from {} to {}; review the join strategy and join column indexes",
            previous.nested_loop_depth, current.nested_loop_depth
        );
    }
    if cost_hit {
        return format!(
            "Estimated cost rose {:.1}x; refresh table statistics (ANALYZE)",
            cost_ratio.unwrap_or_default()
        );
    }
    if io_hit {
        return format!(
            "I/O rose {:.1}x; review the working set and buffer sizing",
            io_ratio.unwrap_or_default()
        );
    }
    "Plan changed and execution slowed; review the new plan".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanDialect, PlanNode};
    use crate::types::Clock;
    use pretty_assertions::assert_eq;

    fn plan(scan: &str, table: &str, rows: f64, cost: f64) -> Arc<PlanSummary> {
        let node = PlanNode {
            node_type: scan.into(),
            relation: Some(table.into()),
            full_scan: scan == "Seq Scan",
            rows: Some(rows),
            total_cost: Some(cost),
            ..Default::default()
        };
        Arc::new(PlanSummary::from_tree(PlanDialect::PostgreSql, &node))
    }

    fn perf(ms: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            mean_exec_time_ms: Some(ms),
            io_blocks: None,
        }
    }

    #[test]
    fn test_time_regression_between_distinct_plans() {
        let (clock, _mock) = Clock::mock();
        let config = PlanExtractorConfig::default();
        let mut history = PlanHistory::new(10);

        let baseline = history.observe(plan("Index Scan", "orders", 10.0, 8.0), perf(10.0), clock.now(), &config);
        assert!(!baseline.plan_changed);
        assert!(baseline.regression.is_none());

        let observed = history.observe(plan("Seq Scan", "orders", 50_000.0, 9.0), perf(40.0), clock.now(), &config);
        assert!(observed.plan_changed);
        let regression = observed.regression.unwrap();
        assert_eq!(regression.time_ratio, Some(4.0));
        assert_eq!(regression.severity, RegressionSeverity::High);
        assert!(regression.recommendation.contains("index on orders"));
    }

    #[test]
    fn test_repeated_plan_only_refreshes() {
        let (clock, _mock) = Clock::mock();
        let config = PlanExtractorConfig::default();
        let mut history = PlanHistory::new(10);
        let p = plan("Index Scan", "orders", 10.0, 8.0);

        history.observe(p.clone(), perf(10.0), clock.now(), &config);
        let again = history.observe(p, perf(100.0), clock.now(), &config);
        assert!(!again.plan_changed);
        assert!(again.regression.is_none());
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().performance.mean_exec_time_ms, Some(100.0));
    }

    #[test]
    fn test_cost_regression_and_ring_capacity() {
        let (clock, _mock) = Clock::mock();
        let config = PlanExtractorConfig::default();
        let mut history = PlanHistory::new(2);

        history.observe(plan("Index Scan", "a", 1.0, 10.0), PerformanceSnapshot::default(), clock.now(), &config);
        let obs = history.observe(plan("Index Scan", "b", 1.0, 60.0), PerformanceSnapshot::default(), clock.now(), &config);
        let regression = obs.regression.unwrap();
        assert_eq!(regression.cost_ratio, Some(6.0));
        assert_eq!(regression.time_ratio, None);
        assert_eq!(regression.severity, RegressionSeverity::Critical);
        assert!(regression.recommendation.contains("ANALYZE"));

        history.observe(plan("Index Scan", "c", 1.0, 1.0), PerformanceSnapshot::default(), clock.now(), &config);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_faster_plan_is_not_a_regression() {
        let (clock, _mock) = Clock::mock();
        let config = PlanExtractorConfig::default();
        let mut history = PlanHistory::new(10);
        history.observe(plan("Seq Scan", "t", 10.0, 50.0), perf(40.0), clock.now(), &config);
        let obs = history.observe(plan("Index Scan", "t", 10.0, 5.0), perf(10.0), clock.now(), &config);
        assert!(obs.plan_changed);
        assert!(obs.regression.is_none());
    }
}
