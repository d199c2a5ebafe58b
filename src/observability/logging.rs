//! Logging setup, request logging and the slow action log
//!
//! Features:
//! - Text or JSON output through `tracing-subscriber`
//! - One log line per HTTP request with method, path, status and latency
//! - Bounded in-memory log of actions slower than a threshold

use crate::config::LoggingConfig;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Maximum number of slow actions to keep in memory
const DEFAULT_SLOWLOG_MAX_LEN: usize = 128;

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON structured format
    Json,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub slow_action_threshold: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_config(&LoggingConfig::default())
    }
}

impl LogConfig {
    /// Parse log level from string
    pub fn parse_level(s: &str) -> Option<Level> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::TRACE),
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warn" | "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        }
    }

    /// Unknown level or format names fall back to `info` and text
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            level: Self::parse_level(&config.level).unwrap_or(Level::INFO),
            format: LogFormat::parse(&config.format).unwrap_or_default(),
            slow_action_threshold: Duration::from_millis(config.slow_action_ms),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        warn!("A global tracing subscriber is already installed");
    }
}

/// Axum middleware logging every request once it has been answered
pub async fn log_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed = %humantime::format_duration(truncate_to_micros(start.elapsed())),
        "request"
    );
    response
}

fn truncate_to_micros(duration: Duration) -> Duration {
    Duration::from_micros(duration.as_micros() as u64)
}

/// Slow action entry
#[derive(Debug, Clone)]
pub struct SlowActionEntry {
    pub id: u64,
    /// Unix timestamp when the action finished
    pub timestamp: u64,
    pub duration: Duration,
    pub action: String,
    pub data_source: Option<String>,
}

/// Most recent slow actions, newest first
#[derive(Debug)]
pub struct SlowActionLog {
    entries: RwLock<VecDeque<SlowActionEntry>>,
    max_len: usize,
    threshold_us: AtomicU64,
    next_id: AtomicU64,
}

impl SlowActionLog {
    pub fn new(threshold: Duration) -> Self {
        Self::with_settings(DEFAULT_SLOWLOG_MAX_LEN, threshold)
    }

    pub fn with_settings(max_len: usize, threshold: Duration) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_len)),
            max_len,
            threshold_us: AtomicU64::new(threshold.as_micros() as u64),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_micros(self.threshold_us.load(Ordering::Relaxed))
    }

    /// Record the action if it ran for at least the threshold.
    /// Returns whether it was recorded.
    pub fn record(&self, action: &str, data_source: Option<&str>, duration: Duration) -> bool {
        if (duration.as_micros() as u64) < self.threshold_us.load(Ordering::Relaxed) {
            return false;
        }

        warn!(
            action,
            data_source = data_source.unwrap_or("-"),
            elapsed = %humantime::format_duration(truncate_to_micros(duration)),
            "Slow action"
        );

        let entry = SlowActionEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            duration,
            action: action.to_string(),
            data_source: data_source.map(str::to_string),
        };

        if let Ok(mut entries) = self.entries.write() {
            entries.push_front(entry);
            while entries.len() > self.max_len {
                entries.pop_back();
            }
        }
        true
    }

    /// Get recent slow actions
    pub fn get(&self, count: usize) -> Vec<SlowActionEntry> {
        if let Ok(entries) = self.entries.read() {
            entries.iter().take(count).cloned().collect()
        } else {
            Vec::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("plain"), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_log_config_from_file_section() {
        let section = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            slow_action_ms: 250,
        };
        let config = LogConfig::from_config(&section);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.slow_action_threshold, Duration::from_millis(250));

        let section = LoggingConfig {
            level: "loud".to_string(),
            format: "fancy".to_string(),
            slow_action_ms: 0,
        };
        let config = LogConfig::from_config(&section);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn test_slow_action_threshold() {
        let log = SlowActionLog::new(Duration::from_millis(1));
        assert_eq!(log.threshold(), Duration::from_millis(1));

        assert!(!log.record("find", Some("logs"), Duration::from_micros(500)));
        assert!(log.is_empty());

        assert!(log.record("insertOne", Some("logs"), Duration::from_millis(2)));
        let entries = log.get(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "insertOne");
        assert_eq!(entries[0].data_source.as_deref(), Some("logs"));
    }

    #[test]
    fn test_slow_action_log_max_len() {
        let log = SlowActionLog::with_settings(3, Duration::ZERO);
        for i in 0..5 {
            log.record(&format!("action{}", i), None, Duration::from_millis(1));
        }

        assert_eq!(log.len(), 3);
        let entries = log.get(10);
        assert_eq!(entries[0].action, "action4");
        assert_eq!(entries[2].action, "action2");
    }
}
