// ============================================================================
// HEALTH MONITORING
// ============================================================================
// Grades memory, CPU, disk, export error rate and database connectivity on
// every check. The latest snapshot is published through an ArcSwap so
// `health()` never blocks the record path.
// ============================================================================

use std::sync::Arc;

use arc_swap::ArcSwap;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::Serialize;

use super::healing::HealerStatus;
use crate::config::HealthConfig;
use crate::metrics::PipelineMetrics;
use crate::resources::ResourceUsage;
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Critical => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

/// Inputs of one health evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthInputs {
    pub usage: ResourceUsage,
    /// Export failures over attempts since the previous check
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    /// Overall status, including any escalation from the self-healer
    pub status: HealthStatus,
    /// Worst component status
    pub component_status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub healer: HealerStatus,
    pub timestamp: Timestamp,
}

fn grade(name: &'static str, value: f64, threshold: f64, critical_at: f64, unit: &str) -> ComponentHealth {
    let status = if value >= critical_at {
        HealthStatus::Critical
    } else if value >= threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    let message = match status {
        HealthStatus::Healthy => format!("{} at {:.1}{}", name, value, unit),
        _ => format!("{} at {:.1}{} (threshold {:.1}{})", name, value, unit, threshold, unit),
    };
    ComponentHealth {
        name,
        status,
        value,
        threshold,
        message,
    }
}

/// Critical cut for a percentage: halfway between the threshold and 100.
fn percent_critical(threshold: f64) -> f64 {
    threshold + (100.0 - threshold) / 2.0
}

pub struct HealthMonitor {
    config: HealthConfig,
    connectivity: DashMap<CompactString, bool>,
    current: ArcSwap<HealthSnapshot>,
    metrics: Arc<PipelineMetrics>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            config,
            connectivity: DashMap::new(),
            current: ArcSwap::from_pointee(HealthSnapshot {
                timestamp: Timestamp::now(),
                ..Default::default()
            }),
            metrics,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record whether the host can currently reach `database`.
    pub fn report_connectivity(&self, database: &str, reachable: bool) {
        self.connectivity.insert(CompactString::from(database), reachable);
    }

    fn connectivity_component(&self) -> ComponentHealth {
        let total = self.connectivity.len();
        let unreachable: Vec<CompactString> = self
            .connectivity
            .iter()
            .filter(|e| !*e.value())
            .map(|e| e.key().clone())
            .collect();

        let status = if total == 0 || unreachable.is_empty() {
            HealthStatus::Healthy
        } else if unreachable.len() == total {
            HealthStatus::Critical
        } else {
            HealthStatus::Degraded
        };
        let message = if unreachable.is_empty() {
            format!("{} database(s) reachable", total)
        } else {
            let mut names: Vec<&str> = unreachable.iter().map(CompactString::as_str).collect();
            names.sort_unstable();
            format!("unreachable: {}", names.join(", "))
        };
        ComponentHealth {
            name: "connectivity",
            status,
            value: unreachable.len() as f64,
            threshold: 1.0,
            message,
        }
    }

    /// Grade every component. Does not publish.
    pub fn evaluate(&self, inputs: &HealthInputs) -> Vec<ComponentHealth> {
        let c = &self.config;
        vec![
            grade("memory", inputs.usage.memory_percent, c.memory_percent, percent_critical(c.memory_percent), "%"),
            grade("cpu", inputs.usage.cpu_percent, c.cpu_percent, percent_critical(c.cpu_percent), "%"),
            grade("disk", inputs.usage.disk_percent, c.disk_percent, percent_critical(c.disk_percent), "%"),
            grade("error_rate", inputs.error_rate, c.error_rate, c.error_rate * 2.0, ""),
            self.connectivity_component(),
        ]
    }

    /// Publish a snapshot; the overall status is the worse of the component
    /// status and the healer's escalation.
    pub fn publish(&self, components: Vec<ComponentHealth>, healer: HealerStatus) -> Arc<HealthSnapshot> {
        let component_status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or_default();
        let status = component_status.max(healer.escalation.unwrap_or_default());

        let previous = self.current.load().status;
        if previous != status {
            tracing::info!(
                target: "dbintel::verify",
                from = previous.as_str(),
                to = status.as_str(),
                "Health status changed"
            );
        }

        let snapshot = Arc::new(HealthSnapshot {
            status,
            component_status,
            components,
            healer,
            timestamp: Timestamp::now(),
        });
        self.metrics.health_status.set(status.gauge_value());
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }

    /// Refresh only the healer portion of the current snapshot.
    pub fn update_healer(&self, healer: HealerStatus) -> Arc<HealthSnapshot> {
        let current = self.current.load_full();
        self.publish(current.components.clone(), healer)
    }

    pub fn current(&self) -> Arc<HealthSnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), Arc::new(PipelineMetrics::new().unwrap()))
    }

    fn usage(memory: f64, cpu: f64, disk: f64) -> ResourceUsage {
        ResourceUsage {
            process_memory_mb: 100.0,
            memory_percent: memory,
            cpu_percent: cpu,
            disk_percent: disk,
        }
    }

    fn status_of(components: &[ComponentHealth], name: &str) -> HealthStatus {
        components.iter().find(|c| c.name == name).map(|c| c.status).unwrap()
    }

    #[test]
    fn test_component_grading() {
        let m = monitor();
        let components = m.evaluate(&HealthInputs {
            usage: usage(50.0, 85.0, 96.0),
            error_rate: 0.2,
        });
        assert_eq!(status_of(&components, "memory"), HealthStatus::Healthy);
        assert_eq!(status_of(&components, "cpu"), HealthStatus::Degraded);
        assert_eq!(status_of(&components, "disk"), HealthStatus::Critical);
        assert_eq!(status_of(&components, "error_rate"), HealthStatus::Critical);
        assert_eq!(status_of(&components, "connectivity"), HealthStatus::Healthy);
    }

    #[test]
    fn test_connectivity_reports() {
        let m = monitor();
        m.report_connectivity("orders", true);
        m.report_connectivity("billing", false);
        let components = m.evaluate(&HealthInputs::default());
        assert_eq!(status_of(&components, "connectivity"), HealthStatus::Degraded);

        m.report_connectivity("orders", false);
        let components = m.evaluate(&HealthInputs::default());
        let connectivity = components.iter().find(|c| c.name == "connectivity").unwrap();
        assert_eq!(connectivity.status, HealthStatus::Critical);
        assert_eq!(connectivity.message, "unreachable: billing, orders");
    }

    #[test]
    fn test_publish_combines_escalation() {
        let m = monitor();
        assert_eq!(m.current().status, HealthStatus::Healthy);

        let components = m.evaluate(&HealthInputs {
            usage: usage(10.0, 10.0, 10.0),
            error_rate: 0.0,
        });
        let healer = HealerStatus {
            escalation: Some(HealthStatus::Degraded),
            ..Default::default()
        };
        let snapshot = m.publish(components, healer);
        assert_eq!(snapshot.component_status, HealthStatus::Healthy);
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(m.current().status, HealthStatus::Degraded);

        let cleared = m.update_healer(HealerStatus::default());
        assert_eq!(cleared.status, HealthStatus::Healthy);
    }
}
