//! Runtime configuration from environment variables

use crate::pipeline::batch_writer::RetryPolicy;
use crate::pipeline::clock::{parse_hhmm, SessionHours};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set (in the environment or .env)")]
    MissingVariable(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with defaults for everything except
/// the feed endpoint and token.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub fallback_dir: PathBuf,
    /// Directory holding `holidays_YYYY.json` files
    pub calendar_dir: PathBuf,
    pub instruments_path: PathBuf,

    pub feed_url: Option<String>,
    pub feed_access_token: Option<String>,

    pub session_hours: SessionHours,
    pub utc_offset_minutes: i32,
    pub expected_instruments: usize,

    /// Channel buffer size for tick ingestion (ticks)
    pub tick_channel_buffer: usize,
    pub feed_silence_timeout_secs: u64,
    pub feed_subscribe_batch_size: usize,

    /// Backend calls per batch before it goes to fallback
    pub write_max_attempts: u32,
    pub write_retry_base_secs: u64,
    /// Queued batches before a backlog alert
    pub write_queue_alert_depth: usize,

    pub checkpoint_interval_secs: u64,
    pub max_checkpoint_files: usize,
    /// Delay after a boundary before the window is finalized
    pub finalize_grace_ms: u64,

    /// Quarantine an unreadable checkpoint instead of refusing to start
    pub fresh_start: bool,
}

impl RuntimeConfig {
    /// Load configuration from the process environment and CLI arguments
    ///
    /// `--fresh-start` on the command line has the same effect as
    /// `FRESH_START=true`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        if env::args().skip(1).any(|arg| arg == "--fresh-start") {
            config.fresh_start = true;
        }
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str, default: &str| PathBuf::from(lookup(key).unwrap_or_else(|| default.to_string()));
        let open = parse_time(&lookup, "MARKET_OPEN", "09:15")?;
        let close = parse_time(&lookup, "MARKET_CLOSE", "15:30")?;
        let session_hours = SessionHours::new(open, close).map_err(|e| ConfigError::InvalidValue {
            key: "MARKET_CLOSE",
            value: close.format("%H:%M").to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db_path: path("ATRFLOW_DB_PATH", "data/atrflow.db"),
            checkpoint_dir: path("CHECKPOINT_DIR", "data/checkpoints"),
            fallback_dir: path("FALLBACK_DIR", "data/fallback"),
            calendar_dir: path("CALENDAR_DIR", "config/calendars"),
            instruments_path: path("INSTRUMENTS_PATH", "config/instruments.json"),

            feed_url: lookup("FEED_URL").filter(|s| !s.trim().is_empty()),
            feed_access_token: lookup("FEED_ACCESS_TOKEN").filter(|s| !s.trim().is_empty()),

            session_hours,
            utc_offset_minutes: parsed(&lookup, "MARKET_UTC_OFFSET_MINUTES", 330),
            expected_instruments: parsed(&lookup, "EXPECTED_INSTRUMENTS", 178),

            tick_channel_buffer: parsed(&lookup, "TICK_CHANNEL_BUFFER", 10_000),
            feed_silence_timeout_secs: parsed(&lookup, "FEED_SILENCE_TIMEOUT_SECS", 30),
            feed_subscribe_batch_size: parsed(&lookup, "FEED_SUBSCRIBE_BATCH_SIZE", 50),

            write_max_attempts: parsed(&lookup, "WRITE_MAX_ATTEMPTS", 5),
            write_retry_base_secs: parsed(&lookup, "WRITE_RETRY_BASE_SECS", 1),
            write_queue_alert_depth: parsed(&lookup, "WRITE_QUEUE_ALERT_DEPTH", 12),

            checkpoint_interval_secs: parsed(&lookup, "CHECKPOINT_INTERVAL_SECS", 300),
            max_checkpoint_files: parsed(&lookup, "MAX_CHECKPOINT_FILES", 3),
            finalize_grace_ms: parsed(&lookup, "FINALIZE_GRACE_MS", 500),

            fresh_start: parsed(&lookup, "FRESH_START", false),
        })
    }

    /// Feed endpoint and token, both required to actually connect
    pub fn require_feed(&self) -> Result<(String, String), ConfigError> {
        let url = self.feed_url.clone().ok_or(ConfigError::MissingVariable("FEED_URL"))?;
        let token = self
            .feed_access_token
            .clone()
            .ok_or(ConfigError::MissingVariable("FEED_ACCESS_TOKEN"))?;
        Ok((url, token))
    }

    pub fn utc_offset_seconds(&self) -> i32 {
        self.utc_offset_minutes * 60
    }

    /// Delays double from the base up to 16x the base
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_secs(self.write_retry_base_secs.max(1));
        RetryPolicy {
            max_attempts: self.write_max_attempts.max(1),
            base_delay: base,
            max_delay: base * 16,
        }
    }

    pub fn log_summary(&self) {
        log::info!("📋 Configuration:");
        log::info!("   ├─ Database: {}", self.db_path.display());
        log::info!("   ├─ Checkpoints: {} (keep {})", self.checkpoint_dir.display(), self.max_checkpoint_files);
        log::info!("   ├─ Fallback: {}", self.fallback_dir.display());
        log::info!(
            "   ├─ Session: {} - {} (UTC{:+}m)",
            self.session_hours.open.format("%H:%M"),
            self.session_hours.close.format("%H:%M"),
            self.utc_offset_minutes
        );
        log::info!("   ├─ Expected instruments: {}", self.expected_instruments);
        log::info!("   ├─ Tick channel buffer: {}", self.tick_channel_buffer);
        log::info!(
            "   ├─ Write attempts: {} (base {}s)",
            self.write_max_attempts,
            self.write_retry_base_secs
        );
        log::info!("   └─ Fresh start: {}", self.fresh_start);
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_time<F>(lookup: &F, key: &'static str, default: &str) -> Result<chrono::NaiveTime, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    parse_hhmm(&value).ok_or_else(|| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        reason: "expected HH:MM".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<RuntimeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.db_path, PathBuf::from("data/atrflow.db"));
        assert_eq!(config.checkpoint_dir, PathBuf::from("data/checkpoints"));
        assert_eq!(config.session_hours.open, parse_hhmm("09:15").unwrap());
        assert_eq!(config.session_hours.close, parse_hhmm("15:30").unwrap());
        assert_eq!(config.utc_offset_seconds(), 19_800);
        assert_eq!(config.expected_instruments, 178);
        assert_eq!(config.tick_channel_buffer, 10_000);
        assert_eq!(config.feed_silence_timeout_secs, 30);
        assert_eq!(config.write_queue_alert_depth, 12);
        assert!(!config.fresh_start);
        assert_eq!(config.require_feed(), Err(ConfigError::MissingVariable("FEED_URL")));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(16));
    }

    #[test]
    fn test_custom_config() {
        let config = config_from(&[
            ("ATRFLOW_DB_PATH", "/tmp/test.db"),
            ("MARKET_OPEN", "10:00"),
            ("MARKET_CLOSE", "13:00"),
            ("TICK_CHANNEL_BUFFER", "5000"),
            ("FRESH_START", "true"),
            ("FEED_URL", "wss://feed.example/ws"),
            ("FEED_ACCESS_TOKEN", "abc"),
        ])
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.session_hours.open, parse_hhmm("10:00").unwrap());
        assert_eq!(config.tick_channel_buffer, 5_000);
        assert!(config.fresh_start);
        assert_eq!(
            config.require_feed().unwrap(),
            ("wss://feed.example/ws".to_string(), "abc".to_string())
        );
    }

    #[test]
    fn test_invalid_market_hours() {
        assert!(matches!(
            config_from(&[("MARKET_OPEN", "9am")]),
            Err(ConfigError::InvalidValue { key: "MARKET_OPEN", .. })
        ));
        assert!(matches!(
            config_from(&[("MARKET_OPEN", "15:30"), ("MARKET_CLOSE", "09:15")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let config = config_from(&[("TICK_CHANNEL_BUFFER", "lots")]).unwrap();
        assert_eq!(config.tick_channel_buffer, 10_000);
    }
}
