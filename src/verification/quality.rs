// ============================================================================
// DATA QUALITY VALIDATION
// ============================================================================
// Required attributes, type expectations, cardinality ceilings, short-window
// duplicates and user rules. Every check yields a violation carrying an
// action; the strictest action decides what happens to the record.
// ============================================================================

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;

use crate::cache::{CacheStats, ShardedCache};
use crate::config::{EnforcementAction, QualityConfig};
use crate::error::ConfigResult;
use crate::metrics::{PipelineCounters, PipelineMetrics};
use crate::rules::Condition;
use crate::types::{Clock, Record};

pub const QUALITY_VALID_ATTRIBUTE: &str = "quality.valid";
pub const QUALITY_VIOLATIONS_ATTRIBUTE: &str = "quality.violations";

/// One failed check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub check: CompactString,
    /// Attributes whose values caused the violation
    pub attributes: SmallVec<[CompactString; 2]>,
    pub action: EnforcementAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub violations: Vec<Violation>,
}

impl QualityReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Strictest action across all violations.
    pub fn action(&self) -> Option<EnforcementAction> {
        self.violations.iter().map(|v| v.action).max()
    }

    /// Distinct check names in the order they failed.
    pub fn check_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.violations.len());
        for violation in &self.violations {
            if !names.contains(&violation.check.as_str()) {
                names.push(violation.check.as_str());
            }
        }
        names
    }
}

struct QualityRule {
    name: CompactString,
    condition: Condition,
    action: EnforcementAction,
    targets: SmallVec<[CompactString; 2]>,
}

pub struct QualityValidator {
    config: QualityConfig,
    rules: Vec<QualityRule>,
    /// Value hashes seen per limited attribute; keys fixed at construction.
    cardinality: AHashMap<CompactString, Mutex<AHashSet<u64>>>,
    duplicates: ShardedCache<u64, ()>,
    placeholder: String,
    hasher: ahash::RandomState,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
}

impl QualityValidator {
    pub fn new(
        config: QualityConfig,
        placeholder: impl Into<String>,
        shards: usize,
        clock: Clock,
        metrics: Arc<PipelineMetrics>,
    ) -> ConfigResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let condition = Condition::compile(&rule.name, Some(&rule.condition))?;
                let targets = condition.attributes().into_iter().map(CompactString::from).collect();
                Ok(QualityRule {
                    name: CompactString::from(rule.name.as_str()),
                    condition,
                    action: rule.action,
                    targets,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let cardinality = config
            .cardinality_limits
            .keys()
            .map(|attr| (CompactString::from(attr.as_str()), Mutex::new(AHashSet::new())))
            .collect();

        let duplicates = ShardedCache::new(
            config.duplicate_cache_size,
            Some(config.duplicate_window),
            shards,
        );

        Ok(Self {
            config,
            rules,
            cardinality,
            duplicates,
            placeholder: placeholder.into(),
            hasher: ahash::RandomState::new(),
            clock,
            metrics,
        })
    }

    /// Run every check against `record` without modifying it.
    pub fn check(&self, record: &Record) -> QualityReport {
        let mut report = QualityReport::default();
        let action = self.config.on_violation;
        let violation = |check: &str, attr: Option<&str>, action| Violation {
            check: CompactString::from(check),
            attributes: attr.map(CompactString::from).into_iter().collect(),
            action,
        };

        for attr in &self.config.required_attributes {
            if !record.contains(attr) {
                report.violations.push(violation("missing_required", Some(attr), action));
            }
        }

        for (attr, expected) in &self.config.type_rules {
            if let Some(value) = record.get(attr) {
                if !expected.accepts(value.kind()) {
                    report.violations.push(violation("type_mismatch", Some(attr), action));
                }
            }
        }

        for (attr, limit) in &self.config.cardinality_limits {
            let (Some(value), Some(seen)) = (record.get(attr), self.cardinality.get(attr.as_str())) else {
                continue;
            };
            let mut hasher = self.hasher.build_hasher();
            value.render().hash(&mut hasher);
            let hash = hasher.finish();

            let mut seen = seen.lock();
            if seen.contains(&hash) {
                continue;
            }
            if seen.len() < *limit {
                seen.insert(hash);
                PipelineCounters::add(&self.metrics.counters.cardinality_new_values, 1);
            } else {
                report.violations.push(violation("cardinality_exceeded", Some(attr), action));
            }
        }

        if self.config.duplicate_detection {
            let now = self.clock.now();
            let hash = record.content_hash();
            let mut shard = self.duplicates.shard(&hash);
            if shard.peek(&hash, now).is_some() {
                report.violations.push(violation("duplicate", None, action));
            } else {
                shard.insert(hash, (), now);
            }
        }

        for rule in &self.rules {
            // Unknown (missing attributes) is not a failure; required checks cover absence.
            if rule.condition.evaluate(record) == Some(false) {
                report.violations.push(Violation {
                    check: rule.name.clone(),
                    attributes: rule.targets.clone(),
                    action: rule.action,
                });
            }
        }

        for violation in &report.violations {
            self.metrics
                .quality_violations
                .with_label_values(&[violation.check.as_str()])
                .inc();
        }
        report
    }

    /// Annotate and, for redacting violations, scrub offending values.
    /// Returns the strictest action, if any check failed.
    pub fn enforce(&self, record: &mut Record, report: &QualityReport) -> Option<EnforcementAction> {
        let action = report.action()?;
        record.set(QUALITY_VALID_ATTRIBUTE, false);
        record.set(QUALITY_VIOLATIONS_ATTRIBUTE, report.check_names().join(","));

        if action == EnforcementAction::Redact {
            for violation in report.violations.iter().filter(|v| v.action >= EnforcementAction::Redact) {
                for attr in &violation.attributes {
                    if record.contains(attr) {
                        record.set(attr, self.placeholder.as_str());
                    }
                }
            }
        }
        Some(action)
    }

    pub fn clear_duplicates(&self) -> usize {
        let len = self.duplicates.len();
        self.duplicates.clear();
        len
    }

    pub fn release_memory(&self) -> usize {
        let removed = self.duplicates.sweep_expired(self.clock.now());
        self.duplicates.shrink_to_fit();
        removed
    }

    pub fn duplicate_stats(&self) -> CacheStats {
        self.duplicates.stats()
    }

    /// Distinct values tracked for a cardinality-limited attribute.
    pub fn tracked_values(&self, attribute: &str) -> usize {
        self.cardinality.get(attribute).map(|s| s.lock().len()).unwrap_or(0)
    }
}
