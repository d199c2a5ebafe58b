//! Observability module
//!
//! This module provides:
//! - Logging setup in text or JSON format
//! - Request logging middleware
//! - Slow action logging
//! - Per-action counters and uptime

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_requests, LogConfig, LogFormat, SlowActionEntry, SlowActionLog};
pub use metrics::{ActionMetrics, ActionStats, Counter, Metrics};
