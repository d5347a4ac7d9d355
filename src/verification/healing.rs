// ============================================================================
// SELF-HEALING
// ============================================================================
// Idle -> Recovering{attempt, next_at} -> Exhausted.
//
// Recovery starts after `unhealthy_threshold` consecutive non-healthy health
// snapshots and runs the configured actions in order. While health stays bad
// the sequence is retried with exponential backoff; once retries run out the
// healer escalates the overall health status until a healthy snapshot
// arrives.
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::health::HealthStatus;
use crate::config::{HealingConfig, RecoveryAction};
use crate::error::ResourceError;
use crate::metrics::PipelineMetrics;
use crate::types::{Clock, Instant, Timestamp};

/// Host-side effects of recovery actions.
pub trait RecoveryHooks: Send + Sync {
    /// Sweep expired entries and release spare capacity; returns entries freed.
    fn release_memory(&self) -> Result<usize, String>;

    /// Empty the pipeline's caches; returns entries removed.
    fn clear_caches(&self) -> Result<usize, String>;

    fn reset_connections(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealerState {
    Idle,
    Recovering { attempt: u32, next_at: Instant },
    Exhausted,
}

impl HealerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealerState::Idle => "idle",
            HealerState::Recovering { .. } => "recovering",
            HealerState::Exhausted => "exhausted",
        }
    }
}

/// Healer summary embedded in every health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealerStatus {
    pub state: &'static str,
    /// Recovery sequences run since health was last good
    pub attempts: u32,
    pub consecutive_unhealthy: u32,
    pub escalation: Option<HealthStatus>,
}

impl Default for HealerStatus {
    fn default() -> Self {
        Self {
            state: HealerState::Idle.as_str(),
            attempts: 0,
            consecutive_unhealthy: 0,
            escalation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingRecord {
    pub action: RecoveryAction,
    pub attempt: u32,
    pub succeeded: bool,
    pub detail: String,
    pub at: Timestamp,
}

/// What one observation or tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealingOutcome {
    pub actions: Vec<HealingRecord>,
    /// Health returned to normal while recovery was in progress
    pub recovered: bool,
    /// Set on the transition into the exhausted state
    pub exhausted: Option<ResourceError>,
    pub status: HealerStatus,
}

struct HealerInner {
    state: HealerState,
    attempts: u32,
    consecutive_unhealthy: u32,
    last_status: HealthStatus,
    escalation: Option<HealthStatus>,
    history: VecDeque<HealingRecord>,
}

pub struct SelfHealer {
    config: HealingConfig,
    hooks: Arc<dyn RecoveryHooks>,
    inner: Mutex<HealerInner>,
    clock: Clock,
    metrics: Arc<PipelineMetrics>,
}

impl SelfHealer {
    pub fn new(
        config: HealingConfig,
        hooks: Arc<dyn RecoveryHooks>,
        clock: Clock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let history = VecDeque::with_capacity(config.history_size.min(1024));
        Self {
            config,
            hooks,
            inner: Mutex::new(HealerInner {
                state: HealerState::Idle,
                attempts: 0,
                consecutive_unhealthy: 0,
                last_status: HealthStatus::Healthy,
                escalation: None,
                history,
            }),
            clock,
            metrics,
        }
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    pub fn state(&self) -> HealerState {
        self.inner.lock().state
    }

    pub fn status(&self) -> HealerStatus {
        Self::status_of(&self.inner.lock())
    }

    fn status_of(inner: &HealerInner) -> HealerStatus {
        HealerStatus {
            state: inner.state.as_str(),
            attempts: inner.attempts,
            consecutive_unhealthy: inner.consecutive_unhealthy,
            escalation: inner.escalation,
        }
    }

    /// Most recent actions, oldest first.
    pub fn history(&self) -> Vec<HealingRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Delay before retry `attempt` (0 is the wait after the first run).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_multiplier.powi(attempt.min(64) as i32);
        let secs = self.config.base_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.config.max_backoff.as_secs_f64() {
            self.config.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Feed the component status of a fresh health snapshot.
    pub fn observe(&self, status: HealthStatus) -> HealingOutcome {
        let now = self.clock.now();
        let mut outcome = HealingOutcome::default();

        let planned = {
            let mut inner = self.inner.lock();
            inner.last_status = status;

            if status == HealthStatus::Healthy {
                let recovered = inner.state != HealerState::Idle;
                if recovered {
                    tracing::info!(
                        target: "dbintel::verify",
                        attempts = inner.attempts,
                        "Health recovered; self-healer back to idle"
                    );
                }
                inner.state = HealerState::Idle;
                inner.attempts = 0;
                inner.consecutive_unhealthy = 0;
                inner.escalation = None;
                return HealingOutcome {
                    recovered,
                    status: Self::status_of(&inner),
                    ..Default::default()
                };
            }

            inner.consecutive_unhealthy = inner.consecutive_unhealthy.saturating_add(1);
            let state = inner.state;
            match state {
                HealerState::Idle
                    if self.config.enabled && inner.consecutive_unhealthy >= self.config.unhealthy_threshold =>
                {
                    tracing::warn!(
                        target: "dbintel::verify",
                        status = status.as_str(),
                        consecutive = inner.consecutive_unhealthy,
                        "Starting self-healing"
                    );
                    Some(self.claim(&mut inner, now, 0))
                }
                HealerState::Exhausted => {
                    inner.escalation = Some(escalation_for(status));
                    None
                }
                _ => self.advance(&mut inner, now, &mut outcome),
            }
        };

        self.complete(planned, &mut outcome);
        outcome
    }

    /// Run a retry if one is due. Driven by the healer's own timer.
    pub fn tick(&self) -> HealingOutcome {
        let now = self.clock.now();
        let mut outcome = HealingOutcome::default();
        let planned = {
            let mut inner = self.inner.lock();
            if inner.last_status == HealthStatus::Healthy {
                None
            } else {
                self.advance(&mut inner, now, &mut outcome)
            }
        };
        self.complete(planned, &mut outcome);
        outcome
    }

    /// Returns the attempt to run once the lock is released, if one is due.
    fn advance(&self, inner: &mut HealerInner, now: Instant, outcome: &mut HealingOutcome) -> Option<u32> {
        let HealerState::Recovering { attempt, next_at } = inner.state else {
            return None;
        };
        if now < next_at {
            return None;
        }

        if attempt >= self.config.max_retries {
            let error = ResourceError::RecoveryExhausted {
                attempts: inner.attempts,
            };
            inner.state = HealerState::Exhausted;
            inner.escalation = Some(escalation_for(inner.last_status));
            tracing::error!(
                target: "dbintel::verify",
                error = %error,
                escalation = ?inner.escalation,
                "Self-healing exhausted"
            );
            outcome.exhausted = Some(error);
            return None;
        }

        Some(self.claim(inner, now, attempt + 1))
    }

    /// Reserve `attempt` so a concurrent tick cannot start the same sequence.
    fn claim(&self, inner: &mut HealerInner, now: Instant, attempt: u32) -> u32 {
        inner.attempts += 1;
        inner.state = HealerState::Recovering {
            attempt,
            next_at: now + self.backoff(attempt),
        };
        attempt
    }

    /// Run the planned sequence without holding the healer lock, then record it.
    fn complete(&self, planned: Option<u32>, outcome: &mut HealingOutcome) {
        if let Some(attempt) = planned {
            outcome.actions = self.run_sequence(attempt);
        }

        let mut inner = self.inner.lock();
        for record in &outcome.actions {
            inner.history.push_back(record.clone());
        }
        while inner.history.len() > self.config.history_size {
            inner.history.pop_front();
        }
        outcome.status = Self::status_of(&inner);
    }

    fn run_sequence(&self, attempt: u32) -> Vec<HealingRecord> {
        let mut records = Vec::with_capacity(self.config.actions.len());
        for &action in &self.config.actions {
            let result = match action {
                RecoveryAction::ReleaseMemory => self
                    .hooks
                    .release_memory()
                    .map(|freed| format!("released {} entries", freed)),
                RecoveryAction::ClearCaches => self
                    .hooks
                    .clear_caches()
                    .map(|cleared| format!("cleared {} entries", cleared)),
                RecoveryAction::ResetConnections => self
                    .hooks
                    .reset_connections()
                    .map(|_| "connections reset".to_string()),
            };

            let (succeeded, detail) = match result {
                Ok(detail) => {
                    tracing::info!(
                        target: "dbintel::verify",
                        action = action.as_str(),
                        attempt,
                        detail = %detail,
                        "Recovery action completed"
                    );
                    (true, detail)
                }
                Err(message) => {
                    let error = ResourceError::RecoveryActionFailed {
                        action: action.as_str().to_string(),
                        message,
                    };
                    tracing::warn!(target: "dbintel::verify", attempt, error = %error, "Recovery action failed");
                    (false, error.to_string())
                }
            };
            self.metrics
                .healing_actions
                .with_label_values(&[action.as_str(), if succeeded { "success" } else { "failure" }])
                .inc();

            records.push(HealingRecord {
                action,
                attempt,
                succeeded,
                detail,
                at: Timestamp::now(),
            });
        }
        records
    }
}

fn escalation_for(status: HealthStatus) -> HealthStatus {
    if status == HealthStatus::Critical {
        HealthStatus::Critical
    } else {
        HealthStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        releases: AtomicUsize,
        clears: AtomicUsize,
        resets: AtomicUsize,
    }

    impl RecoveryHooks for CountingHooks {
        fn release_memory(&self) -> Result<usize, String> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        fn clear_caches(&self) -> Result<usize, String> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(10)
        }

        fn reset_connections(&self) -> Result<(), String> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Err("no connection pool registered".into())
        }
    }

    fn healer(config: HealingConfig) -> (SelfHealer, Arc<CountingHooks>, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let hooks = Arc::new(CountingHooks::default());
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        (SelfHealer::new(config, hooks.clone(), clock, metrics), hooks, mock)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let (h, _hooks, _mock) = healer(HealingConfig::default());
        assert_eq!(h.backoff(0), Duration::from_secs(1));
        assert_eq!(h.backoff(1), Duration::from_secs(2));
        assert_eq!(h.backoff(3), Duration::from_secs(8));
        assert_eq!(h.backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn test_recovery_starts_after_threshold() {
        let (h, hooks, _mock) = healer(HealingConfig::default());
        assert!(h.observe(HealthStatus::Degraded).actions.is_empty());
        assert!(h.observe(HealthStatus::Degraded).actions.is_empty());

        let outcome = h.observe(HealthStatus::Degraded);
        assert_eq!(outcome.actions.len(), 3);
        assert!(outcome.actions[0].succeeded);
        assert!(!outcome.actions[2].succeeded);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.clears.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.status.state, "recovering");
        assert_eq!(h.history().len(), 3);
    }

    #[test]
    fn test_retries_with_backoff_then_escalates() {
        let (h, hooks, mock) = healer(HealingConfig {
            unhealthy_threshold: 1,
            max_retries: 2,
            ..Default::default()
        });
        h.observe(HealthStatus::Critical);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 1);

        // Not due yet.
        assert!(h.tick().actions.is_empty());

        mock.increment(Duration::from_secs(1));
        assert_eq!(h.tick().actions.len(), 3);
        mock.increment(Duration::from_secs(1));
        assert!(h.tick().actions.is_empty());
        mock.increment(Duration::from_secs(1));
        assert_eq!(h.tick().actions.len(), 3);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 3);

        mock.increment(Duration::from_secs(4));
        let outcome = h.tick();
        assert_eq!(outcome.exhausted, Some(ResourceError::RecoveryExhausted { attempts: 3 }));
        assert_eq!(h.state(), HealerState::Exhausted);
        assert_eq!(outcome.status.escalation, Some(HealthStatus::Critical));

        // Stays escalated while unhealthy, clears once health recovers.
        assert_eq!(h.observe(HealthStatus::Degraded).status.escalation, Some(HealthStatus::Degraded));
        let outcome = h.observe(HealthStatus::Healthy);
        assert!(outcome.recovered);
        assert_eq!(outcome.status, HealerStatus::default());
    }

    #[test]
    fn test_healthy_snapshot_resets_streak() {
        let (h, hooks, _mock) = healer(HealingConfig::default());
        h.observe(HealthStatus::Degraded);
        h.observe(HealthStatus::Degraded);
        h.observe(HealthStatus::Healthy);
        h.observe(HealthStatus::Degraded);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 0);
        assert_eq!(h.status().consecutive_unhealthy, 1);
    }

    /// Reads healer state from inside every hook.
    struct ReentrantHooks {
        healer: once_cell::sync::OnceCell<std::sync::Weak<SelfHealer>>,
        seen: Mutex<Vec<HealerStatus>>,
    }

    impl ReentrantHooks {
        fn look(&self) {
            if let Some(healer) = self.healer.get().and_then(|w| w.upgrade()) {
                self.seen.lock().push(healer.status());
            }
        }
    }

    impl RecoveryHooks for ReentrantHooks {
        fn release_memory(&self) -> Result<usize, String> {
            self.look();
            Ok(0)
        }

        fn clear_caches(&self) -> Result<usize, String> {
            self.look();
            Ok(0)
        }

        fn reset_connections(&self) -> Result<(), String> {
            self.look();
            Ok(())
        }
    }

    #[test]
    fn test_hooks_run_outside_the_healer_lock() {
        let (clock, mock) = Clock::mock();
        let hooks = Arc::new(ReentrantHooks {
            healer: once_cell::sync::OnceCell::new(),
            seen: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let config = HealingConfig {
            unhealthy_threshold: 1,
            ..Default::default()
        };
        let h = Arc::new(SelfHealer::new(config, hooks.clone(), clock, metrics));
        hooks.healer.set(Arc::downgrade(&h)).unwrap();

        let outcome = h.observe(HealthStatus::Degraded);
        assert_eq!(outcome.actions.len(), 3);
        mock.increment(Duration::from_secs(1));
        assert_eq!(h.tick().actions.len(), 3);

        // The attempt is claimed before the hooks run.
        let seen = hooks.seen.lock();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|s| s.state == "recovering"));
        assert_eq!(seen[0].attempts, 1);
        assert_eq!(seen[5].attempts, 2);
        assert_eq!(h.history().len(), 6);
    }

    #[test]
    fn test_history_is_bounded() {
        let (h, _hooks, mock) = healer(HealingConfig {
            unhealthy_threshold: 1,
            max_retries: 10,
            history_size: 4,
            ..Default::default()
        });
        h.observe(HealthStatus::Degraded);
        for _ in 0..5 {
            mock.increment(Duration::from_secs(120));
            h.tick();
        }
        let history = h.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().map(|r| r.attempt), Some(5));
    }
}
