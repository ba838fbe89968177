//! Thread-safe metrics collection
//!
//! Atomic counters for the high-frequency paths (dispatch, bus traffic, LLM
//! attempts) with a serialisable snapshot for the health endpoint.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Workflow engine
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    branches_created: AtomicU64,
    workflow_passes: AtomicU64,

    // Router / provider
    llm_attempts: AtomicU64,
    llm_safety_blocks: AtomicU64,
    llm_rate_limited: AtomicU64,

    // Bus
    bus_published: AtomicU64,
    bus_received: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            tasks_dispatched: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            branches_created: AtomicU64::new(0),
            workflow_passes: AtomicU64::new(0),
            llm_attempts: AtomicU64::new(0),
            llm_safety_blocks: AtomicU64::new(0),
            llm_rate_limited: AtomicU64::new(0),
            bus_published: AtomicU64::new(0),
            bus_received: AtomicU64::new(0),
            uptime_start: AtomicU64::new(now),
        }
    }

    pub fn record_task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch_created(&self) {
        self.branches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workflow_pass(&self) {
        self.workflow_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_attempt(&self) {
        self.llm_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_safety_block(&self) {
        self.llm_safety_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.llm_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_published(&self) {
        self.bus_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_received(&self) {
        self.bus_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        MetricsSnapshot {
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            branches_created: self.branches_created.load(Ordering::Relaxed),
            workflow_passes: self.workflow_passes.load(Ordering::Relaxed),
            llm_attempts: self.llm_attempts.load(Ordering::Relaxed),
            llm_safety_blocks: self.llm_safety_blocks.load(Ordering::Relaxed),
            llm_rate_limited: self.llm_rate_limited.load(Ordering::Relaxed),
            bus_published: self.bus_published.load(Ordering::Relaxed),
            bus_received: self.bus_received.load(Ordering::Relaxed),
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time metrics export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub branches_created: u64,
    pub workflow_passes: u64,
    pub llm_attempts: u64,
    pub llm_safety_blocks: u64,
    pub llm_rate_limited: u64,
    pub bus_published: u64,
    pub bus_received: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record_task_dispatched();
        collector.record_task_dispatched();
        collector.record_branch_created();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks_dispatched, 2);
        assert_eq!(snapshot.branches_created, 1);
        assert_eq!(snapshot.tasks_failed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new();
        collector.record_llm_attempt();
        let json = serde_json::to_string(&collector.get_metrics()).unwrap();
        assert!(json.contains("\"llm_attempts\":1"));
    }
}
