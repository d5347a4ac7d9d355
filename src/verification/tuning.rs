// ============================================================================
// AUTO-TUNING
// ============================================================================
// Each analysis tick contributes one performance sample. Once a full window
// has been collected every sample votes (pressure, calm or neutral); when one
// side reaches the confidence threshold each tunable moves one bounded step
// in the matching direction. Tunables are published as an immutable,
// versioned set so a batch always sees one consistent view.
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{TunableBoundsConfig, TuningConfig};
use crate::metrics::{CounterSnapshot, PipelineMetrics};

// ----------------------------------------------------------------------------
// Tunable Table
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunableKind {
    SamplingScale,
    BatchSize,
    CollectionIntervalMs,
}

impl TunableKind {
    pub const ALL: [TunableKind; 3] = [
        TunableKind::SamplingScale,
        TunableKind::BatchSize,
        TunableKind::CollectionIntervalMs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunableKind::SamplingScale => "sampling_scale",
            TunableKind::BatchSize => "batch_size",
            TunableKind::CollectionIntervalMs => "collection_interval_ms",
        }
    }

    /// Whether raising this value sheds load.
    fn relieves_pressure_when_raised(&self) -> bool {
        matches!(self, TunableKind::CollectionIntervalMs)
    }
}

/// Immutable view of every tunable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TunableSet {
    pub version: u64,
    pub sampling_scale: f64,
    pub batch_size: f64,
    pub collection_interval_ms: f64,
}

impl TunableSet {
    pub fn get(&self, kind: TunableKind) -> f64 {
        match kind {
            TunableKind::SamplingScale => self.sampling_scale,
            TunableKind::BatchSize => self.batch_size,
            TunableKind::CollectionIntervalMs => self.collection_interval_ms,
        }
    }

    fn set(&mut self, kind: TunableKind, value: f64) {
        match kind {
            TunableKind::SamplingScale => self.sampling_scale = value,
            TunableKind::BatchSize => self.batch_size = value,
            TunableKind::CollectionIntervalMs => self.collection_interval_ms = value,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.round() as usize
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms.round() as u64)
    }
}

pub struct TunableTable {
    current: ArcSwap<TunableSet>,
    bounds: [TunableBoundsConfig; 3],
}

impl TunableTable {
    pub fn new(config: &TuningConfig) -> Self {
        let initial = TunableSet {
            version: 0,
            sampling_scale: config.sampling_scale.initial,
            batch_size: config.batch_size.initial,
            collection_interval_ms: config.collection_interval_ms.initial,
        };
        Self {
            current: ArcSwap::from_pointee(initial),
            bounds: [config.sampling_scale, config.batch_size, config.collection_interval_ms],
        }
    }

    pub fn current(&self) -> Arc<TunableSet> {
        self.current.load_full()
    }

    pub fn bounds(&self, kind: TunableKind) -> TunableBoundsConfig {
        self.bounds[kind as usize]
    }

    /// Publish a new version with each change clamped to its bounds.
    pub fn apply(&self, changes: &[(TunableKind, f64)]) -> Arc<TunableSet> {
        let mut next = *self.current.load_full();
        next.version += 1;
        for &(kind, value) in changes {
            let bounds = self.bounds(kind);
            next.set(kind, value.clamp(bounds.min, bounds.max));
        }
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        next
    }
}

impl std::fmt::Debug for TunableTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunableTable")
            .field("current", &self.current())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Samples and Votes
// ----------------------------------------------------------------------------

/// Pipeline behaviour over one analysis interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSample {
    /// Records accepted per second
    pub throughput: f64,
    /// Rejected over admitted-plus-rejected at the circuit breaker
    pub circuit_open_rate: f64,
    /// New tracked attribute values per verified record
    pub cardinality_growth: f64,
    /// Export failures over export attempts
    pub error_rate: f64,
    pub memory_percent: f64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl PerformanceSample {
    pub fn from_counters(delta: &CounterSnapshot, elapsed: Duration, memory_percent: f64) -> Self {
        let secs = elapsed.as_secs_f64();
        Self {
            throughput: if secs > 0.0 { delta.records_in as f64 / secs } else { 0.0 },
            circuit_open_rate: ratio(
                delta.circuit_rejected,
                delta.circuit_admitted + delta.circuit_rejected,
            ),
            cardinality_growth: ratio(delta.cardinality_new_values, delta.records_verified),
            error_rate: ratio(delta.export_failures, delta.export_attempts),
            memory_percent,
        }
    }

    /// Largest signal relative to its pressure threshold; 1.0 or more is pressure.
    pub fn pressure(&self, config: &TuningConfig) -> f64 {
        let relative = |value: f64, threshold: f64| if threshold > 0.0 { value / threshold } else { 0.0 };
        [
            relative(self.circuit_open_rate, config.pressure_circuit_open_rate),
            relative(self.cardinality_growth, config.pressure_cardinality_growth),
            relative(self.error_rate, config.pressure_error_rate),
            relative(self.memory_percent, config.pressure_memory_percent),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Decrease => "decrease",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningRecommendation {
    pub parameter: TunableKind,
    pub direction: Direction,
    pub from: f64,
    pub to: f64,
    pub confidence: f64,
    pub applied: bool,
    pub reason: String,
}

/// Window-level verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WindowVerdict {
    under_pressure: bool,
    confidence: f64,
    mean_pressure: f64,
    pressure_stddev: f64,
}

// ----------------------------------------------------------------------------
// Auto Tuner
// ----------------------------------------------------------------------------

pub struct AutoTuner {
    config: TuningConfig,
    table: Arc<TunableTable>,
    window: Mutex<VecDeque<PerformanceSample>>,
    metrics: Arc<PipelineMetrics>,
}

impl AutoTuner {
    pub fn new(config: TuningConfig, table: Arc<TunableTable>, metrics: Arc<PipelineMetrics>) -> Self {
        let window = Mutex::new(VecDeque::with_capacity(config.window_size));
        Self {
            config,
            table,
            window,
            metrics,
        }
    }

    pub fn config(&self) -> &TuningConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<TunableTable> {
        &self.table
    }

    pub fn samples(&self) -> usize {
        self.window.lock().len()
    }

    fn judge(&self, window: &VecDeque<PerformanceSample>) -> Option<WindowVerdict> {
        let pressures: Vec<f64> = window.iter().map(|s| s.pressure(&self.config)).collect();
        let n = pressures.len() as f64;
        let pressured = pressures.iter().filter(|p| **p >= 1.0).count() as f64;
        let calm = pressures.iter().filter(|p| **p < 0.5).count() as f64;

        let mean_pressure = statistical::mean(&pressures);
        let pressure_stddev = if pressures.len() >= 2 {
            statistical::standard_deviation(&pressures, Some(mean_pressure))
        } else {
            0.0
        };

        let (under_pressure, confidence) = if pressured >= calm {
            (true, pressured / n)
        } else {
            (false, calm / n)
        };
        (confidence >= self.config.confidence_threshold).then_some(WindowVerdict {
            under_pressure,
            confidence,
            mean_pressure,
            pressure_stddev,
        })
    }

    /// Add one sample. When a full window yields a confident verdict,
    /// returns the resulting recommendations and starts a new window.
    pub fn record(&self, sample: PerformanceSample) -> Vec<TuningRecommendation> {
        let verdict = {
            let mut window = self.window.lock();
            window.push_back(sample);
            while window.len() > self.config.window_size {
                window.pop_front();
            }
            if window.len() < self.config.window_size {
                return Vec::new();
            }
            let verdict = self.judge(&window);
            if verdict.is_some() {
                window.clear();
            }
            verdict
        };
        let Some(verdict) = verdict else {
            return Vec::new();
        };

        let current = self.table.current();
        let step = self.config.max_change_percent / 100.0;
        let mut recommendations = Vec::new();
        for kind in TunableKind::ALL {
            let raise = verdict.under_pressure == kind.relieves_pressure_when_raised();
            let from = current.get(kind);
            let bounds = self.table.bounds(kind);
            let target = if raise { from * (1.0 + step) } else { from * (1.0 - step) };
            let to = target.clamp(bounds.min, bounds.max);
            if (to - from).abs() <= f64::EPSILON * from.abs().max(1.0) {
                continue;
            }
            let direction = if raise { Direction::Increase } else { Direction::Decrease };
            recommendations.push(TuningRecommendation {
                parameter: kind,
                direction,
                from,
                to,
                confidence: verdict.confidence,
                applied: self.config.auto_apply,
                reason: format!(
                    "{} in {:.0}% of samples (mean pressure {:.2}, stddev {:.2})",
                    if verdict.under_pressure { "pressure" } else { "headroom" },
                    verdict.confidence * 100.0,
                    verdict.mean_pressure,
                    verdict.pressure_stddev
                ),
            });
        }

        if self.config.auto_apply && !recommendations.is_empty() {
            let changes: Vec<(TunableKind, f64)> = recommendations.iter().map(|r| (r.parameter, r.to)).collect();
            let published = self.table.apply(&changes);
            for r in &recommendations {
                self.metrics
                    .tuning_adjustments
                    .with_label_values(&[r.parameter.as_str(), r.direction.as_str()])
                    .inc();
            }
            tracing::info!(
                target: "dbintel::verify",
                version = published.version,
                sampling_scale = published.sampling_scale,
                batch_size = published.batch_size,
                collection_interval_ms = published.collection_interval_ms,
                confidence = verdict.confidence,
                "Tunables adjusted"
            );
        }
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn tuner(config: TuningConfig) -> AutoTuner {
        let table = Arc::new(TunableTable::new(&config));
        AutoTuner::new(config, table, Arc::new(PipelineMetrics::new().unwrap()))
    }

    fn pressured() -> PerformanceSample {
        PerformanceSample {
            circuit_open_rate: 0.5,
            memory_percent: 40.0,
            ..Default::default()
        }
    }

    fn calm() -> PerformanceSample {
        PerformanceSample {
            memory_percent: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_sample_from_counters() {
        let delta = CounterSnapshot {
            records_in: 600,
            circuit_admitted: 90,
            circuit_rejected: 10,
            export_attempts: 20,
            export_failures: 1,
            records_verified: 100,
            cardinality_new_values: 5,
            ..Default::default()
        };
        let sample = PerformanceSample::from_counters(&delta, Duration::from_secs(60), 55.0);
        assert_eq!(sample.throughput, 10.0);
        assert_eq!(sample.circuit_open_rate, 0.1);
        assert_eq!(sample.error_rate, 0.05);
        assert_eq!(sample.cardinality_growth, 0.05);
        assert_eq!(sample.memory_percent, 55.0);
    }

    #[test]
    fn test_pressure_lowers_sampling_and_stretches_interval() {
        let t = tuner(TuningConfig {
            window_size: 5,
            ..Default::default()
        });
        for _ in 0..4 {
            assert!(t.record(pressured()).is_empty());
        }
        let recs = t.record(pressured());
        assert_eq!(recs.len(), 3);

        let current = t.table().current();
        assert_eq!(current.version, 1);
        assert!((current.sampling_scale - 0.9).abs() < 1e-9);
        assert!((current.batch_size - 900.0).abs() < 1e-9);
        assert!((current.collection_interval_ms - 11_000.0).abs() < 1e-9);
        assert_eq!(t.samples(), 0);
    }

    #[test]
    fn test_calm_window_stops_at_bounds() {
        let t = tuner(TuningConfig {
            window_size: 2,
            ..Default::default()
        });
        t.record(calm());
        let recs = t.record(calm());
        // sampling_scale starts at its maximum, so only two tunables move.
        let moved: Vec<TunableKind> = recs.iter().map(|r| r.parameter).collect();
        assert_eq!(moved, vec![TunableKind::BatchSize, TunableKind::CollectionIntervalMs]);
        assert!(recs.iter().all(|r| r.applied));
    }

    #[test]
    fn test_mixed_window_below_confidence_changes_nothing() {
        let t = tuner(TuningConfig {
            window_size: 4,
            ..Default::default()
        });
        for sample in [pressured(), calm(), pressured(), calm()] {
            assert!(t.record(sample).is_empty());
        }
        assert_eq!(t.table().current().version, 0);
        assert_eq!(t.samples(), 4);
    }

    #[test]
    fn test_recommend_only_mode() {
        let t = tuner(TuningConfig {
            window_size: 2,
            auto_apply: false,
            ..Default::default()
        });
        t.record(pressured());
        let recs = t.record(pressured());
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| !r.applied));
        assert_eq!(t.table().current().version, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_adjustments_stay_bounded(
            rates in prop::collection::vec(0.0f64..1.0, 1..120),
            max_change in 1.0f64..50.0,
        ) {
            let t = tuner(TuningConfig {
                window_size: 3,
                max_change_percent: max_change,
                ..Default::default()
            });
            let mut version = 0;
            for rate in rates {
                let before = *t.table().current();
                let recs = t.record(PerformanceSample {
                    circuit_open_rate: rate,
                    ..Default::default()
                });
                let after = *t.table().current();
                prop_assert!(after.version >= version);
                version = after.version;
                for rec in recs {
                    let previous = before.get(rec.parameter);
                    let change = (rec.to - previous).abs() / previous;
                    prop_assert!(change <= max_change / 100.0 + 1e-9);
                    prop_assert!(rec.confidence >= 0.8);
                    let bounds = t.table().bounds(rec.parameter);
                    prop_assert!(after.get(rec.parameter) >= bounds.min);
                    prop_assert!(after.get(rec.parameter) <= bounds.max);
                }
            }
        }
    }
}
