//! In-process dispatch counters.

use dashmap::DashMap;
use tracing::trace;

use crate::traits::DispatchMetrics;

/// Per-event-type counters for dispatched and failed events.
///
/// Safe to share between concurrent listeners. Export to a metrics backend by
/// reading [`CounterMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct CounterMetrics {
    dispatched: DashMap<String, u64>,
    failed: DashMap<String, u64>,
}

/// Point-in-time copy of the counters, sorted by event type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatched: Vec<(String, u64)>,
    pub failed: Vec<(String, u64)>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self, event_type: &str) -> u64 {
        self.dispatched.get(event_type).map(|c| *c).unwrap_or(0)
    }

    pub fn failed(&self, event_type: &str) -> u64 {
        self.failed.get(event_type).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: sorted(&self.dispatched),
            failed: sorted(&self.failed),
        }
    }
}

fn sorted(counters: &DashMap<String, u64>) -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = counters
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect();
    out.sort();
    out
}

fn bump(counters: &DashMap<String, u64>, event_type: &str) -> u64 {
    let mut count = counters.entry(event_type.to_string()).or_insert(0);
    *count += 1;
    *count
}

impl DispatchMetrics for CounterMetrics {
    fn event_dispatched(&self, event_type: &str) {
        let count = bump(&self.dispatched, event_type);
        trace!(event_type, count, "events_dispatched");
    }

    fn event_failed(&self, event_type: &str) {
        let count = bump(&self.failed, event_type);
        trace!(event_type, count, "events_failed");
    }
}
