// ============================================================================
// ADAPTIVE SAMPLER
// ============================================================================
// Cost-aware sampling with deduplication.
//
//   record ──▶ fingerprint ──▶ dedup window ──▶ rules (priority desc)
//                                   │               │ first match with a token
//                                   ▼               ▼
//                              DROP duplicate   keep if unit(seed) < rate × scale
//
// Decisions are deterministic: the keep test hashes the fingerprint (or the
// whole attribute set) instead of drawing random numbers, so identical
// records always get identical outcomes.
// ============================================================================

use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

use crate::cache::{CacheStats, ShardedCache};
use crate::config::{SamplerConfig, SamplingRuleConfig};
use crate::error::ConfigResult;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{BatchContext, Stage};
use crate::rules::Condition;
use crate::types::{Clock, DropReason, Instant, Record, Verdict};

/// Rule name reported when no configured rule governs a record.
pub const DEFAULT_RULE_NAME: &str = "default";

// ----------------------------------------------------------------------------
// Token Bucket
// ----------------------------------------------------------------------------

/// Per-rule rate cap: `capacity` tokens, refilled continuously over a minute.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(max: u32, now: Instant) -> Self {
        let capacity = max as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Compiled Rules
// ----------------------------------------------------------------------------

struct SamplingRule {
    name: CompactString,
    priority: i32,
    condition: Condition,
    sample_rate: f64,
    bucket: Option<Mutex<TokenBucket>>,
}

impl SamplingRule {
    fn compile(config: &SamplingRuleConfig, now: Instant) -> ConfigResult<Self> {
        Ok(Self {
            name: CompactString::from(config.name.as_str()),
            priority: config.priority,
            condition: Condition::compile(&config.name, config.condition.as_deref())?,
            sample_rate: config.sample_rate,
            bucket: config
                .max_per_minute
                .map(|max| Mutex::new(TokenBucket::per_minute(max, now))),
        })
    }

    fn has_token(&self, now: Instant) -> bool {
        match &self.bucket {
            Some(bucket) => bucket.lock().try_take(now),
            None => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Decisions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub keep: bool,
    /// Rule that governed the decision, or `default`
    pub rule_name: CompactString,
    /// Set when the record is not kept
    pub reason: Option<DropReason>,
}

impl Decision {
    fn duplicate() -> Self {
        Self {
            keep: false,
            rule_name: CompactString::from(DEFAULT_RULE_NAME),
            reason: Some(DropReason::Duplicate),
        }
    }
}

/// Map a hash onto [0, 1) using its top 53 bits.
#[inline]
fn unit_interval(hash: u64) -> f64 {
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

// ----------------------------------------------------------------------------
// Sampler
// ----------------------------------------------------------------------------

pub struct AdaptiveSampler {
    config: SamplerConfig,
    /// Sorted by priority, highest first; ties keep configuration order.
    rules: Vec<SamplingRule>,
    dedup: ShardedCache<u64, ()>,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
}

impl AdaptiveSampler {
    pub fn new(
        config: SamplerConfig,
        shards: usize,
        clock: Clock,
        metrics: Arc<PipelineMetrics>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();
        let mut rules = config
            .rules
            .iter()
            .map(|rule| SamplingRule::compile(rule, now))
            .collect::<ConfigResult<Vec<_>>>()?;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let dedup = ShardedCache::new(config.dedup.cache_size, Some(config.dedup.window), shards);
        debug!(
            target: "dbintel::sampler",
            rules = rules.len(),
            default_rate = config.default_sample_rate,
            "Sampler initialized"
        );
        Ok(Self {
            config,
            rules,
            dedup,
            clock,
            metrics,
        })
    }

    /// Rule names in evaluation order.
    pub fn rule_order(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Hash of the normalised fingerprint attributes, scoped by whichever
    /// scope attributes are present. `None` when the record carries none of
    /// the fingerprint attributes.
    pub fn fingerprint(&self, record: &Record) -> Option<u64> {
        let mut hasher = Xxh3::new();
        let mut present = 0usize;

        if self.config.dedup.fingerprint_attributes.is_empty() {
            for key in record.sorted_keys() {
                if let Some(value) = record.get(key) {
                    write_pair(&mut hasher, key, &value.normalized());
                    present += 1;
                }
            }
        } else {
            let dedup = &self.config.dedup;
            let mut keys: Vec<&str> = dedup.fingerprint_attributes.iter().map(String::as_str).collect();
            keys.sort_unstable();
            keys.dedup();
            for key in &keys {
                if let Some(value) = record.get(key) {
                    write_pair(&mut hasher, key, &value.normalized());
                    present += 1;
                }
            }

            if present > 0 {
                let mut scope: Vec<&str> = dedup
                    .scope_attributes
                    .iter()
                    .map(String::as_str)
                    .filter(|key| !keys.contains(key))
                    .collect();
                scope.sort_unstable();
                scope.dedup();
                for key in scope {
                    if let Some(value) = record.get(key) {
                        write_pair(&mut hasher, key, &value.normalized());
                    }
                }
            }
        }

        (present > 0).then(|| hasher.finish())
    }

    /// Decide whether to keep `record`. Consumes dedup state and rule tokens.
    pub fn decide(&self, record: &Record, sampling_scale: f64) -> Decision {
        let now = self.clock.now();
        let fingerprint = self.fingerprint(record);

        if self.config.dedup.enabled {
            if let Some(fp) = fingerprint {
                let mut shard = self.dedup.shard(&fp);
                // A hit does not push expiry out: the window runs from the
                // last sighting that was kept.
                if shard.get(&fp, now).is_some() {
                    trace!(target: "dbintel::sampler", fingerprint = fp, "Duplicate within window");
                    return Decision::duplicate();
                }
                shard.insert(fp, (), now);
            }
        }

        let (rule_name, rate) = self
            .rules
            .iter()
            .find(|rule| rule.condition.matches(record) && rule.has_token(now))
            .map(|rule| (rule.name.clone(), rule.sample_rate))
            .unwrap_or_else(|| (CompactString::from(DEFAULT_RULE_NAME), self.config.default_sample_rate));

        let threshold = (rate * sampling_scale).clamp(0.0, 1.0);
        let seed = fingerprint.unwrap_or_else(|| record.content_hash());
        let keep = unit_interval(seed) < threshold;

        Decision {
            keep,
            rule_name,
            reason: (!keep).then_some(DropReason::SampledOut),
        }
    }

    // ---- cache maintenance ----

    pub fn sweep_dedup(&self) -> usize {
        self.dedup.sweep_expired(self.clock.now())
    }

    /// Sweep expired entries and release spare capacity.
    pub fn release_memory(&self) -> usize {
        let removed = self.sweep_dedup();
        self.dedup.shrink_to_fit();
        removed
    }

    pub fn clear_dedup(&self) -> usize {
        let len = self.dedup.len();
        self.dedup.clear();
        len
    }

    pub fn dedup_stats(&self) -> CacheStats {
        self.dedup.stats()
    }

    /// Periodically drop expired dedup entries until `shutdown` fires.
    pub async fn run_dedup_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dedup.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_dedup();
                    if removed > 0 {
                        debug!(target: "dbintel::sampler", removed, "Swept dedup cache");
                    }
                }
            }
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.dedup.sweep_interval
    }
}

fn write_pair(hasher: &mut Xxh3, key: &str, value: &str) {
    hasher.write(key.as_bytes());
    hasher.write_u8(0x1f);
    hasher.write(value.as_bytes());
    hasher.write_u8(0x1e);
}

impl Stage for AdaptiveSampler {
    fn name(&self) -> &'static str {
        "sampler"
    }

    fn process(&self, record: &mut Record, ctx: &BatchContext) -> Verdict {
        let decision = self.decide(record, ctx.sampling_scale);
        let outcome = match decision.reason {
            None => "kept",
            Some(DropReason::Duplicate) => "duplicate",
            Some(_) => "dropped",
        };
        self.metrics
            .sampling_decisions
            .with_label_values(&[outcome, decision.rule_name.as_str()])
            .inc();

        match decision.reason {
            Some(reason) => Verdict::Drop(reason),
            None => {
                if self.config.annotate {
                    record.set("sampled", true);
                    record.set("rule_name", decision.rule_name);
                }
                Verdict::Pass
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
