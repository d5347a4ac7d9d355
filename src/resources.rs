// ============================================================================
// RESOURCE PROBES
// ============================================================================
// Process and host resource readings consumed by the circuit breaker's load
// shedder and the health monitor. Probes are only sampled from background
// tasks, never from the record path.
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Pid, System};

/// One reading of resource utilisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident memory of this process, in MiB
    pub process_memory_mb: f64,
    /// Host memory in use, percent
    pub memory_percent: f64,
    /// Host CPU utilisation, percent
    pub cpu_percent: f64,
    /// Fullest mounted disk, percent
    pub disk_percent: f64,
}

/// Source of resource readings.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceUsage;
}

// ----------------------------------------------------------------------------
// sysinfo-backed probe
// ----------------------------------------------------------------------------

pub struct SystemProbe {
    system: System,
    disks: Disks,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> ResourceUsage {
        self.system.refresh_memory();
        self.system.refresh_cpu();
        self.disks.refresh();

        let process_memory_mb = match self.pid {
            Some(pid) if self.system.refresh_process(pid) => self
                .system
                .process(pid)
                .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0),
            _ => 0.0,
        };

        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            self.system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let disk_percent = self
            .disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space());
                used as f64 / d.total_space() as f64 * 100.0
            })
            .fold(0.0_f64, f64::max);

        ResourceUsage {
            process_memory_mb,
            memory_percent,
            cpu_percent: self.system.global_cpu_info().cpu_usage() as f64,
            disk_percent,
        }
    }
}

// ----------------------------------------------------------------------------
// Host-fed probe
// ----------------------------------------------------------------------------

/// Probe whose readings are pushed by the host (or a test).
#[derive(Debug, Clone, Default)]
pub struct ManualProbe {
    usage: Arc<Mutex<ResourceUsage>>,
}

impl ManualProbe {
    pub fn new(initial: ResourceUsage) -> Self {
        Self {
            usage: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock() = usage;
    }
}

impl ResourceProbe for ManualProbe {
    fn sample(&mut self) -> ResourceUsage {
        *self.usage.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_probe_shares_readings() {
        let probe = ManualProbe::default();
        let mut reader = probe.clone();
        probe.set(ResourceUsage {
            cpu_percent: 42.0,
            ..Default::default()
        });
        assert_eq!(reader.sample().cpu_percent, 42.0);
    }

    #[test]
    fn test_system_probe_reports_sane_ranges() {
        let mut probe = SystemProbe::new();
        let usage = probe.sample();
        assert!(usage.memory_percent >= 0.0 && usage.memory_percent <= 100.0);
        assert!(usage.disk_percent >= 0.0 && usage.disk_percent <= 100.0);
    }
}
