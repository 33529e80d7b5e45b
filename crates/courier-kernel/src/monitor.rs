//! Performance monitor: per-type request counters and execution time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Observer of request placement and outcome.
pub trait PerformanceMonitor: Send + Sync + 'static {
    /// A request of `type_name` is about to be served in this process.
    fn new_local_request(&self, type_name: &str);

    /// A request of `type_name` is about to be handed to a dispatcher.
    fn new_remote_request(&self, type_name: &str);

    /// A request of `type_name` completed successfully after `elapsed`.
    fn successfully_completed(&self, type_name: &str, elapsed: Duration);

    /// A request of `type_name` failed after `elapsed`.
    fn completed_with_exceptions(&self, type_name: &str, elapsed: Duration);
}

/// Counters for one message type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStat {
    pub type_name: String,
    pub served_locally: u64,
    pub remote_requests: u64,
    pub errors: u64,
    /// Total time spent in successful requests, in milliseconds.
    pub total_execution_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl PerformanceStat {
    pub fn total_requests(&self) -> u64 {
        self.served_locally + self.remote_requests
    }

    pub fn successful_requests(&self) -> u64 {
        self.total_requests().saturating_sub(self.errors)
    }

    /// Mean execution time of successful requests, in milliseconds.
    pub fn average_execution_ms(&self) -> f64 {
        match self.successful_requests() {
            0 => 0.0,
            n => self.total_execution_ms / n as f64,
        }
    }
}

/// In-memory monitor backing a stats surface.
#[derive(Default)]
pub struct InMemoryPerformanceMonitor {
    stats: DashMap<String, PerformanceStat>,
}

impl InMemoryPerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the counters of one type.
    pub fn stat(&self, type_name: &str) -> Option<PerformanceStat> {
        self.stats.get(type_name).map(|s| s.clone())
    }

    /// Snapshot of every type, sorted by name.
    pub fn stats(&self) -> Vec<PerformanceStat> {
        let mut all: Vec<PerformanceStat> = self.stats.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        all
    }

    pub fn reset(&self) {
        self.stats.clear();
    }

    fn update(&self, type_name: &str, f: impl FnOnce(&mut PerformanceStat)) {
        let mut stat = self
            .stats
            .entry(type_name.to_string())
            .or_insert_with(|| PerformanceStat {
                type_name: type_name.to_string(),
                ..Default::default()
            });
        f(&mut stat);
    }
}

impl PerformanceMonitor for InMemoryPerformanceMonitor {
    fn new_local_request(&self, type_name: &str) {
        self.update(type_name, |s| {
            s.served_locally += 1;
            s.last_request_at = Some(Utc::now());
        });
    }

    fn new_remote_request(&self, type_name: &str) {
        self.update(type_name, |s| {
            s.remote_requests += 1;
            s.last_request_at = Some(Utc::now());
        });
    }

    fn successfully_completed(&self, type_name: &str, elapsed: Duration) {
        self.update(type_name, |s| {
            s.total_execution_ms += elapsed.as_secs_f64() * 1000.0;
        });
    }

    fn completed_with_exceptions(&self, type_name: &str, _elapsed: Duration) {
        self.update(type_name, |s| s.errors += 1);
    }
}
