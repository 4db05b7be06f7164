//! Core data structures flowing through the pipeline
//!
//! Tick → PartialWindow → Candle → WriteBatch, plus the SystemEvent rows
//! that surface operational conditions to the `system_log` table.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock time in the market's fixed timezone
pub type MarketTime = DateTime<FixedOffset>;

/// A single price update from the feed. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub instrument_id: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub volume: Option<f64>,
}

/// In-progress OHLC for one instrument in one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialWindow {
    pub instrument_id: String,
    pub window_start: MarketTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub tick_count: u32,
}

impl PartialWindow {
    /// Start a window from its first tick
    pub fn open_with(
        instrument_id: &str,
        window_start: MarketTime,
        price: f64,
        volume: Option<f64>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            window_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            tick_count: 1,
        }
    }

    pub fn apply(&mut self, price: f64, volume: Option<f64>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        if let Some(v) = volume {
            self.volume = Some(self.volume.unwrap_or(0.0) + v);
        }
        self.tick_count += 1;
    }
}

/// Immutable 5-minute candle as persisted to `market_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub id: String,
    pub window_start: MarketTime,
    pub instrument_id: String,
    pub segment: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub true_range: f64,
    /// Empty while the instrument is still collecting its first 14 true ranges
    pub atr: Option<f64>,
    #[serde(default)]
    pub atr_flagged: bool,
    pub volume: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// One window's candles, appended to the backend in a single call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub window_start: MarketTime,
    pub candles: Vec<Candle>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Row of the `atr_state` table (one per instrument, overwritten each window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrStateRow {
    pub instrument_id: String,
    pub last_close: f64,
    pub last_atr: Option<f64>,
    pub last_timestamp: MarketTime,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
            EventLevel::Critical => "CRITICAL",
        }
    }
}

/// Row of the `system_log` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub event: String,
    pub window: Option<MarketTime>,
    pub details: String,
}

impl SystemEvent {
    pub fn new(level: EventLevel, event: &str, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            event: event.to_string(),
            window: None,
            details: details.into(),
        }
    }

    pub fn with_window(mut self, window: MarketTime) -> Self {
        self.window = Some(window);
        self
    }

    /// Mirror the event into the application log
    pub fn log(&self) {
        let window = self
            .window
            .map(|w| format!(" [{}]", w.format("%H:%M")))
            .unwrap_or_default();
        match self.level {
            EventLevel::Info => log::info!("📋 {}{}: {}", self.event, window, self.details),
            EventLevel::Warning => log::warn!("⚠️  {}{}: {}", self.event, window, self.details),
            EventLevel::Error => log::error!("❌ {}{}: {}", self.event, window, self.details),
            EventLevel::Critical => log::error!("🚨 {}{}: {}", self.event, window, self.details),
        }
    }
}

/// Unique row id for an instrument's candle: `{instrument}_{YYYYMMDD_HHMM}`
pub fn generate_row_id(instrument_id: &str, window_start: &MarketTime) -> String {
    format!("{}_{}", instrument_id, window_start.format("%Y%m%d_%H%M"))
}

/// Split a row id back into instrument and local window start.
///
/// Instrument ids may themselves contain underscores, so the split is
/// taken from the right.
pub fn parse_row_id(row_id: &str) -> Option<(String, NaiveDateTime)> {
    let mut parts = row_id.rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    let instrument = parts.next()?;
    if instrument.is_empty() {
        return None;
    }
    let stamp = NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), "%Y%m%d_%H%M").ok()?;
    Some((instrument.to_string(), stamp))
}
