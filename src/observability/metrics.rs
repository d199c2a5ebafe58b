//! Action statistics reported by the service info endpoint
//!
//! Features:
//! - Per-action call and error counters
//! - Cumulative execution time for average latency
//! - Process uptime

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Atomic counter for metrics
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct ActionCounters {
    calls: Counter,
    errors: Counter,
    duration_us: Counter,
}

/// Snapshot of one action's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStats {
    pub calls: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

/// Counters for dispatched actions
#[derive(Debug)]
pub struct ActionMetrics {
    total_actions: Counter,
    total_errors: Counter,
    by_action: RwLock<HashMap<String, ActionCounters>>,
}

impl Default for ActionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionMetrics {
    pub fn new() -> Self {
        Self {
            total_actions: Counter::new(),
            total_errors: Counter::new(),
            by_action: RwLock::new(HashMap::new()),
        }
    }

    /// Record one finished action, successful or not
    pub fn record(&self, action: &str, duration: Duration, failed: bool) {
        self.total_actions.inc();
        if failed {
            self.total_errors.inc();
        }

        let update = |counters: &ActionCounters| {
            counters.calls.inc();
            counters.duration_us.inc_by(duration.as_micros() as u64);
            if failed {
                counters.errors.inc();
            }
        };

        if let Ok(by_action) = self.by_action.read() {
            if let Some(counters) = by_action.get(action) {
                update(counters);
                return;
            }
        }
        if let Ok(mut by_action) = self.by_action.write() {
            update(by_action.entry(action.to_string()).or_default());
        }
    }

    pub fn total_actions(&self) -> u64 {
        self.total_actions.get()
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.get()
    }

    /// Per-action statistics ordered by action name
    pub fn snapshot(&self) -> BTreeMap<String, ActionStats> {
        let Ok(by_action) = self.by_action.read() else {
            return BTreeMap::new();
        };
        by_action
            .iter()
            .map(|(name, counters)| {
                let calls = counters.calls.get();
                let avg_duration_ms = if calls == 0 {
                    0.0
                } else {
                    counters.duration_us.get() as f64 / calls as f64 / 1000.0
                };
                (
                    name.clone(),
                    ActionStats {
                        calls,
                        errors: counters.errors.get(),
                        avg_duration_ms,
                    },
                )
            })
            .collect()
    }
}

/// Process-wide metrics
#[derive(Debug)]
pub struct Metrics {
    pub actions: ActionMetrics,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            actions: ActionMetrics::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Uptime in whole seconds, formatted like `1h 2m 3s`
    pub fn uptime_human(&self) -> String {
        humantime::format_duration(Duration::from_secs(self.uptime().as_secs())).to_string()
    }
}
