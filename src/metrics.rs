// ============================================================================
// PIPELINE METRICS
// ============================================================================
// Self-telemetry exposed to the host. Every counter lives in a private
// prometheus registry; `snapshot()` and `encode_text()` read them without
// mutating anything. A handful of cache-padded atomics mirror the totals the
// auto-tuner samples on its timer.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crossbeam::utils::CachePadded;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};

/// Namespace prefixed to every exported metric.
pub const METRICS_NAMESPACE: &str = "dbintel";

// ----------------------------------------------------------------------------
// Hot-path Totals
// ----------------------------------------------------------------------------

/// Monotonic totals sampled by the auto-tuner.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub records_in: CachePadded<AtomicU64>,
    pub records_out: CachePadded<AtomicU64>,
    pub circuit_admitted: CachePadded<AtomicU64>,
    pub circuit_rejected: CachePadded<AtomicU64>,
    pub export_attempts: CachePadded<AtomicU64>,
    pub export_failures: CachePadded<AtomicU64>,
    pub records_verified: CachePadded<AtomicU64>,
    pub cardinality_new_values: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub circuit_admitted: u64,
    pub circuit_rejected: u64,
    pub export_attempts: u64,
    pub export_failures: u64,
    pub records_verified: u64,
    pub cardinality_new_values: u64,
}

impl PipelineCounters {
    #[inline]
    pub fn add(counter: &CachePadded<AtomicU64>, n: u64) {
        counter.fetch_add(n, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &CachePadded<AtomicU64>| c.load(AtomicOrdering::Relaxed);
        CounterSnapshot {
            records_in: load(&self.records_in),
            records_out: load(&self.records_out),
            circuit_admitted: load(&self.circuit_admitted),
            circuit_rejected: load(&self.circuit_rejected),
            export_attempts: load(&self.export_attempts),
            export_failures: load(&self.export_failures),
            records_verified: load(&self.records_verified),
            cardinality_new_values: load(&self.cardinality_new_values),
        }
    }
}

impl CounterSnapshot {
    /// Per-field difference against an earlier snapshot.
    pub fn delta(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            records_in: self.records_in.saturating_sub(earlier.records_in),
            records_out: self.records_out.saturating_sub(earlier.records_out),
            circuit_admitted: self.circuit_admitted.saturating_sub(earlier.circuit_admitted),
            circuit_rejected: self.circuit_rejected.saturating_sub(earlier.circuit_rejected),
            export_attempts: self.export_attempts.saturating_sub(earlier.export_attempts),
            export_failures: self.export_failures.saturating_sub(earlier.export_failures),
            records_verified: self.records_verified.saturating_sub(earlier.records_verified),
            cardinality_new_values: self
                .cardinality_new_values
                .saturating_sub(earlier.cardinality_new_values),
        }
    }
}

// ----------------------------------------------------------------------------
// Prometheus Registry
// ----------------------------------------------------------------------------

pub struct PipelineMetrics {
    registry: Registry,

    /// Circuit state changes, labelled `from` / `to`
    pub circuit_transitions: IntCounterVec,
    pub circuit_rejections: IntCounter,
    /// Classified downstream errors, labelled `class` / `impact`
    pub classified_errors: IntCounterVec,
    /// 1 while resource pressure forces every circuit open
    pub load_shedding: IntGauge,

    /// Sampler decisions, labelled `outcome` / `rule`
    pub sampling_decisions: IntCounterVec,
    /// Records removed from batches, labelled `stage` / `reason`
    pub records_dropped: IntCounterVec,

    pub plans_parsed: IntCounterVec,
    pub plan_parse_failures: IntCounterVec,
    pub plan_regressions: IntCounterVec,

    pub pii_matches: IntCounterVec,
    pub quality_violations: IntCounterVec,
    pub tuning_adjustments: IntCounterVec,
    pub healing_actions: IntCounterVec,
    /// 0 healthy, 1 degraded, 2 critical
    pub health_status: IntGauge,

    pub counters: PipelineCounters,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> PipelineResult<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).map_err(metrics_error)?;
    registry.register(Box::new(vec.clone())).map_err(metrics_error)?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> PipelineResult<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(metrics_error)?;
    registry.register(Box::new(gauge.clone())).map_err(metrics_error)?;
    Ok(gauge)
}

fn metrics_error(e: prometheus::Error) -> PipelineError {
    PipelineError::Internal(format!("metrics registration failed: {}", e))
}

impl PipelineMetrics {
    pub fn new() -> PipelineResult<Self> {
        let registry =
            Registry::new_custom(Some(METRICS_NAMESPACE.to_string()), None).map_err(metrics_error)?;

        let circuit_rejections = IntCounter::new(
            "circuit_rejections_total",
            "Records rejected because their circuit was open",
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(circuit_rejections.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            circuit_transitions: counter_vec(
                &registry,
                "circuit_transitions_total",
                "Circuit breaker state transitions",
                &["from", "to"],
            )?,
            circuit_rejections,
            classified_errors: counter_vec(
                &registry,
                "classified_errors_total",
                "Downstream errors by classification",
                &["class", "impact"],
            )?,
            load_shedding: gauge(&registry, "load_shedding", "Resource pressure load shedding active")?,
            sampling_decisions: counter_vec(
                &registry,
                "sampling_decisions_total",
                "Sampler keep/drop decisions",
                &["outcome", "rule"],
            )?,
            records_dropped: counter_vec(
                &registry,
                "records_dropped_total",
                "Records removed from batches",
                &["stage", "reason"],
            )?,
            plans_parsed: counter_vec(&registry, "plans_parsed_total", "Plans parsed", &["dialect"])?,
            plan_parse_failures: counter_vec(
                &registry,
                "plan_parse_failures_total",
                "Plans skipped because parsing failed",
                &["reason"],
            )?,
            plan_regressions: counter_vec(
                &registry,
                "plan_regressions_total",
                "Plan regressions detected",
                &["severity"],
            )?,
            pii_matches: counter_vec(&registry, "pii_matches_total", "PII matches by action", &["action"])?,
            quality_violations: counter_vec(
                &registry,
                "quality_violations_total",
                "Data quality violations",
                &["check"],
            )?,
            tuning_adjustments: counter_vec(
                &registry,
                "tuning_adjustments_total",
                "Tunable parameter adjustments",
                &["parameter", "direction"],
            )?,
            healing_actions: counter_vec(
                &registry,
                "healing_actions_total",
                "Self-healing actions executed",
                &["action", "result"],
            )?,
            health_status: gauge(&registry, "health_status", "Overall health (0 ok, 1 degraded, 2 critical)")?,
            counters: PipelineCounters::default(),
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Flatten every metric into `name{label="v",...} -> value`.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let labels: Vec<String> = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}=\"{}\"", l.get_name(), l.get_value()))
                    .collect();
                let key = if labels.is_empty() {
                    family.get_name().to_string()
                } else {
                    format!("{}{{{}}}", family.get_name(), labels.join(","))
                };
                let value = if metric.has_counter() {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                };
                out.insert(key, value);
            }
        }
        out
    }

    /// Prometheus text exposition of the registry.
    pub fn encode_text(&self) -> PipelineResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| PipelineError::Internal(e.to_string()))
    }

    /// Records dropped by a stage, for a given reason.
    pub fn dropped(&self, stage: &str, reason: &str) -> u64 {
        self.records_dropped.with_label_values(&[stage, reason]).get()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("counters", &self.counters.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_labelled_counters() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.circuit_transitions.with_label_values(&["closed", "open"]).inc();
        metrics.records_dropped.with_label_values(&["sampler", "duplicate"]).inc_by(2);
        metrics.load_shedding.set(1);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.get("dbintel_circuit_transitions_total{from=\"closed\",to=\"open\"}"),
            Some(&1.0)
        );
        assert_eq!(snapshot.get("dbintel_load_shedding"), Some(&1.0));
        assert_eq!(metrics.dropped("sampler", "duplicate"), 2);

        // Reading twice gives the same answer.
        assert_eq!(snapshot, metrics.snapshot());
        assert!(metrics.encode_text().unwrap().contains("dbintel_records_dropped_total"));
    }

    #[test]
    fn test_counter_delta() {
        let counters = PipelineCounters::default();
        PipelineCounters::add(&counters.records_in, 10);
        let first = counters.snapshot();
        PipelineCounters::add(&counters.records_in, 5);
        PipelineCounters::add(&counters.circuit_rejected, 2);

        let delta = counters.snapshot().delta(&first);
        assert_eq!(delta.records_in, 5);
        assert_eq!(delta.circuit_rejected, 2);
    }
}
