// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::RunOutcome;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Mark the process start for uptime reporting
pub fn mark_start() {
    let _ = START_TIME.get_or_init(Instant::now);
}

/// Pipeline run counters
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub runs_started: Arc<AtomicU64>,
    pub runs_stopped: Arc<AtomicU64>,
    pub units_succeeded: Arc<AtomicU64>,
    pub units_failed: Arc<AtomicU64>,
    pub total_synthesis_time_ms: Arc<AtomicU64>,
    pub request_count: Arc<AtomicU64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &RunOutcome) {
        self.units_succeeded
            .fetch_add(outcome.successful as u64, Ordering::Relaxed);
        self.units_failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        self.total_synthesis_time_ms
            .fetch_add(outcome.synthesis_time.as_millis() as u64, Ordering::Relaxed);
        if outcome.stopped {
            self.runs_stopped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn avg_unit_synthesis_ms(&self) -> f64 {
        let units = self.units_succeeded.load(Ordering::Relaxed) + self.units_failed.load(Ordering::Relaxed);
        if units == 0 {
            return 0.0;
        }
        self.total_synthesis_time_ms.load(Ordering::Relaxed) as f64 / units as f64
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_stopped: self.runs_stopped.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            total_synthesis_time_ms: self.total_synthesis_time_ms.load(Ordering::Relaxed),
            avg_unit_synthesis_ms: self.avg_unit_synthesis_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub pipeline: PipelineStats,
    pub connected_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PipelineStats {
    pub runs_started: u64,
    pub runs_stopped: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub total_synthesis_time_ms: u64,
    pub avg_unit_synthesis_ms: f64,
}

/// Current CPU, memory and load figures
pub fn system_metrics(request_count: u64) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    // Average across all cores
    let cpu_usage = system.global_cpu_info().cpu_usage();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count,
        uptime_seconds: uptime,
        system_load,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_outcome() {
        let metrics = PipelineMetrics::new();
        metrics.record_run_started();
        metrics.record_outcome(&RunOutcome {
            total: 3,
            successful: 2,
            failed: 1,
            stopped: true,
            synthesis_time: Duration::from_millis(300),
        });

        let stats = metrics.snapshot();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_stopped, 1);
        assert_eq!(stats.units_succeeded, 2);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.total_synthesis_time_ms, 300);
        assert_eq!(stats.avg_unit_synthesis_ms, 100.0);
    }

    #[test]
    fn test_empty_average() {
        assert_eq!(PipelineMetrics::new().avg_unit_synthesis_ms(), 0.0);
    }
}
