//! ATR Engine - 14-period Average True Range with Wilder smoothing
//!
//! Per instrument the first 14 true ranges are collected and their mean
//! seeds the ATR; afterwards `ATR = (prev_atr * 13 + TR) / 14`. Values are
//! rounded to 4 decimals before they are stored or fed back.
//!
//! A window is processed as a unit: new states are staged and only
//! committed once every candle in the window has passed validation.

use super::types::{AtrStateRow, Candle, MarketTime};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const ATR_PERIOD: usize = 14;
pub const ATR_PRECISION: i32 = 4;

/// ATR jump (relative to the previous ATR) that triggers a review flag
pub const ANOMALY_RATIO: f64 = 3.0;

#[derive(Debug, Error, PartialEq)]
pub enum AtrError {
    #[error("negative ATR {atr} computed for {instrument_id} at {window}")]
    NegativeAtr {
        instrument_id: String,
        window: MarketTime,
        atr: f64,
    },
    #[error("non-finite {field} for {instrument_id} at {window}")]
    NonFinite {
        instrument_id: String,
        window: MarketTime,
        field: &'static str,
    },
    #[error("window {window} for {instrument_id} is not after its last processed window {last}")]
    OutOfOrder {
        instrument_id: String,
        window: MarketTime,
        last: MarketTime,
    },
    #[error("corrupt ATR state for {instrument_id}: {reason}")]
    CorruptState { instrument_id: String, reason: String },
}

impl AtrError {
    /// Corrupted state cannot be recovered by skipping a window
    pub fn is_fatal(&self) -> bool {
        matches!(self, AtrError::CorruptState { .. })
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn round_atr(value: f64) -> f64 {
    round_to(value, ATR_PRECISION)
}

/// `max(high - low, |high - prev_close|, |low - prev_close|)`, or `high - low`
/// when there is no previous close
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(prev) => (high - low)
            .max((high - prev).abs())
            .max((low - prev).abs()),
        None => high - low,
    }
}

/// Cold-start ATR: mean of the first 14 true ranges
pub fn seed_atr(true_ranges: &[f64]) -> f64 {
    if true_ranges.is_empty() {
        return 0.0;
    }
    round_atr(true_ranges.iter().sum::<f64>() / true_ranges.len() as f64)
}

pub fn smooth_atr(prev_atr: f64, tr: f64) -> f64 {
    let period = ATR_PERIOD as f64;
    round_atr((prev_atr * (period - 1.0) + tr) / period)
}

/// A jump above 3x the previous ATR. Flagged for review, never rejected.
pub fn is_anomalous(prev_atr: f64, atr: f64) -> bool {
    prev_atr > 0.0 && atr > ANOMALY_RATIO * prev_atr
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrState {
    pub instrument_id: String,
    pub prev_close: Option<f64>,
    pub prev_atr: Option<f64>,
    /// True ranges collected during warmup, cleared once the ATR is seeded
    #[serde(default)]
    pub tr_history: Vec<f64>,
    #[serde(default)]
    pub candle_count: u64,
    pub last_window: Option<MarketTime>,
    pub updated_at: DateTime<Utc>,
}

impl AtrState {
    pub fn new(instrument_id: &str) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            prev_close: None,
            prev_atr: None,
            tr_history: Vec::new(),
            candle_count: 0,
            last_window: None,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild from a persisted `atr_state` row. Warmup true ranges are not
    /// persisted, so an instrument that was still warming starts over.
    pub fn from_row(row: &AtrStateRow) -> Self {
        Self {
            instrument_id: row.instrument_id.clone(),
            prev_close: Some(row.last_close),
            prev_atr: row.last_atr,
            tr_history: Vec::new(),
            candle_count: 0,
            last_window: Some(row.last_timestamp),
            updated_at: row.updated_at,
        }
    }

    pub fn is_warm(&self) -> bool {
        self.prev_atr.is_some()
    }

    pub fn validate(&self) -> Result<(), AtrError> {
        let corrupt = |reason: String| AtrError::CorruptState {
            instrument_id: self.instrument_id.clone(),
            reason,
        };

        if let Some(close) = self.prev_close {
            if !close.is_finite() || close <= 0.0 {
                return Err(corrupt(format!("prev_close {}", close)));
            }
        }
        if let Some(atr) = self.prev_atr {
            if !atr.is_finite() || atr < 0.0 {
                return Err(corrupt(format!("prev_atr {}", atr)));
            }
        }
        if self.tr_history.len() >= ATR_PERIOD {
            return Err(corrupt(format!(
                "{} warmup true ranges (period is {})",
                self.tr_history.len(),
                ATR_PERIOD
            )));
        }
        if let Some(tr) = self.tr_history.iter().find(|tr| !tr.is_finite() || **tr < 0.0) {
            return Err(corrupt(format!("warmup true range {}", tr)));
        }
        Ok(())
    }

    pub fn to_row(&self) -> Option<AtrStateRow> {
        Some(AtrStateRow {
            instrument_id: self.instrument_id.clone(),
            last_close: self.prev_close?,
            last_atr: self.prev_atr,
            last_timestamp: self.last_window?,
            updated_at: self.updated_at,
        })
    }
}

/// Outcome of one window's ATR pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAtrReport {
    pub updated: usize,
    /// Instruments whose ATR was seeded from the warmup mean this window
    pub seeded: Vec<String>,
    pub flagged: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtrSummary {
    pub instruments: usize,
    pub warm: usize,
    pub warming: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AtrEngine {
    states: HashMap<String, AtrState>,
}

impl AtrEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from checkpointed states; any invalid state is corruption
    pub fn from_states(states: impl IntoIterator<Item = AtrState>) -> Result<Self, AtrError> {
        let mut engine = Self::new();
        for state in states {
            state.validate()?;
            engine.states.insert(state.instrument_id.clone(), state);
        }
        Ok(engine)
    }

    /// Replace one instrument's state
    pub fn restore(&mut self, state: AtrState) -> Result<(), AtrError> {
        state.validate()?;
        self.states.insert(state.instrument_id.clone(), state);
        Ok(())
    }

    pub fn state(&self, instrument_id: &str) -> Option<&AtrState> {
        self.states.get(instrument_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// All states ordered by instrument id
    pub fn snapshot(&self) -> Vec<AtrState> {
        let mut states: Vec<AtrState> = self.states.values().cloned().collect();
        states.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        states
    }

    pub fn state_rows(&self) -> Vec<AtrStateRow> {
        self.snapshot().iter().filter_map(AtrState::to_row).collect()
    }

    pub fn summary(&self) -> AtrSummary {
        let warm = self.states.values().filter(|s| s.is_warm()).count();
        AtrSummary {
            instruments: self.states.len(),
            warm,
            warming: self.states.len() - warm,
        }
    }

    /// Fill `true_range`, `atr` and `atr_flagged` on each validated candle of
    /// one window and advance the per-instrument state.
    ///
    /// Nothing is committed if any candle fails: the engine's state is left
    /// exactly as it was before the call.
    pub fn process_window(
        &mut self,
        window_start: MarketTime,
        candles: &mut [Candle],
    ) -> Result<WindowAtrReport, AtrError> {
        let mut staged: Vec<AtrState> = Vec::with_capacity(candles.len());
        let mut report = WindowAtrReport::default();
        let now = Utc::now();

        for candle in candles.iter_mut() {
            let id = candle.instrument_id.clone();
            let mut state = self
                .states
                .get(&id)
                .cloned()
                .unwrap_or_else(|| AtrState::new(&id));

            if let Some(last) = state.last_window {
                if window_start <= last {
                    return Err(AtrError::OutOfOrder {
                        instrument_id: id,
                        window: window_start,
                        last,
                    });
                }
            }

            let tr = round_atr(true_range(candle.high, candle.low, state.prev_close));
            if !tr.is_finite() {
                return Err(AtrError::NonFinite {
                    instrument_id: id,
                    window: window_start,
                    field: "true range",
                });
            }

            let mut flagged = false;
            let atr = match state.prev_atr {
                Some(prev_atr) => {
                    let atr = smooth_atr(prev_atr, tr);
                    flagged = is_anomalous(prev_atr, atr);
                    Some(atr)
                }
                None => {
                    state.tr_history.push(tr);
                    if state.tr_history.len() == ATR_PERIOD {
                        let atr = seed_atr(&state.tr_history);
                        state.tr_history.clear();
                        report.seeded.push(id.clone());
                        Some(atr)
                    } else {
                        None
                    }
                }
            };

            if let Some(value) = atr {
                if !value.is_finite() {
                    return Err(AtrError::NonFinite {
                        instrument_id: id,
                        window: window_start,
                        field: "ATR",
                    });
                }
                if value < 0.0 {
                    return Err(AtrError::NegativeAtr {
                        instrument_id: id,
                        window: window_start,
                        atr: value,
                    });
                }
                state.prev_atr = Some(value);
            }

            state.prev_close = Some(candle.close);
            state.candle_count += 1;
            state.last_window = Some(window_start);
            state.updated_at = now;

            candle.true_range = tr;
            candle.atr = atr;
            candle.atr_flagged = flagged;
            if flagged {
                report.flagged.push(id);
            }
            staged.push(state);
        }

        report.updated = staged.len();
        for state in staged {
            self.states.insert(state.instrument_id.clone(), state);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::generate_row_id;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn window(n: i64) -> MarketTime {
        FixedOffset::east_opt(19_800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 15, 9, 15, 0)
            .unwrap()
            + Duration::minutes(5 * n)
    }

    fn candle(id: &str, w: MarketTime, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            id: generate_row_id(id, &w),
            window_start: w,
            instrument_id: id.to_string(),
            segment: "NSE_EQ".to_string(),
            open,
            high,
            low,
            close,
            true_range: 0.0,
            atr: None,
            atr_flagged: false,
            volume: None,
            created_at: Utc::now(),
        }
    }

    fn warm_state(id: &str, prev_close: f64, prev_atr: f64, last: MarketTime) -> AtrState {
        AtrState {
            instrument_id: id.to_string(),
            prev_close: Some(prev_close),
            prev_atr: Some(prev_atr),
            tr_history: Vec::new(),
            candle_count: 40,
            last_window: Some(last),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        // ticks 100, 105, 98, 102 with prev_close 101
        assert_eq!(true_range(105.0, 98.0, Some(101.0)), 7.0);
        // gap up: |high - prev_close| dominates
        assert_eq!(true_range(110.0, 108.0, Some(100.0)), 10.0);
        // gap down: |low - prev_close| dominates
        assert_eq!(true_range(95.0, 90.0, Some(100.0)), 10.0);
        assert_eq!(true_range(105.0, 98.0, None), 7.0);
    }

    #[test]
    fn test_cold_start_is_mean_of_first_14() {
        let trs = [
            1.2, 0.8, 1.5, 2.1, 0.9, 1.1, 1.7, 1.3, 0.6, 1.9, 1.4, 1.0, 2.2, 0.75,
        ];
        let expected = round_to(trs.iter().sum::<f64>() / 14.0, 4);
        assert_eq!(seed_atr(&trs), expected);

        // Same thing through the engine: flat candles whose range is the TR
        let mut engine = AtrEngine::new();
        let mut last = None;
        for (n, tr) in trs.iter().enumerate() {
            let w = window(n as i64);
            let mut candles = vec![candle("A", w, 100.0, 100.0 + tr, 100.0, 100.0)];
            // prev_close 100 sits inside every range, so TR == high - low
            engine.process_window(w, &mut candles).unwrap();
            last = candles[0].atr;
            if n < 13 {
                assert_eq!(candles[0].atr, None, "ATR must be empty during warmup");
            }
        }
        assert_eq!(last, Some(expected));
        assert!(engine.state("A").unwrap().tr_history.is_empty());
    }

    #[test]
    fn test_recursive_formula() {
        for (a, t) in [(2.5, 7.0), (1.2345, 0.5), (10.0, 0.0), (0.3333, 1.7777)] {
            assert_eq!(smooth_atr(a, t), round_to((a * 13.0 + t) / 14.0, 4));
        }
    }

    #[test]
    fn test_values_are_rounded_to_four_decimals() {
        let atr = smooth_atr(1.0, 1.123456789);
        assert_eq!(atr, round_to(atr, 4));
        assert!((atr * 10_000.0 - (atr * 10_000.0).round()).abs() < 1e-6);
        assert!(atr >= 0.0);
        assert_eq!(round_to(2.71828, 4), 2.7183);
    }

    #[test]
    fn test_end_to_end_window() {
        let mut engine = AtrEngine::from_states([warm_state("A", 101.0, 2.5, window(0))]).unwrap();
        let mut candles = vec![candle("A", window(1), 100.0, 105.0, 98.0, 102.0)];

        let report = engine.process_window(window(1), &mut candles).unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(candles[0].true_range, 7.0);
        assert_eq!(candles[0].atr, Some(round_to((2.5 * 13.0 + 7.0) / 14.0, 4)));
        let state = engine.state("A").unwrap();
        assert_eq!(state.prev_close, Some(102.0));
        assert_eq!(state.prev_atr, candles[0].atr);
        assert_eq!(state.last_window, Some(window(1)));
    }

    #[test]
    fn test_anomaly_is_flagged_not_rejected() {
        // TR 35 on ATR 1.0 -> (13 + 35) / 14 = 3.4286, above 3x
        let mut engine = AtrEngine::from_states([warm_state("A", 100.0, 1.0, window(0))]).unwrap();
        let mut candles = vec![candle("A", window(1), 100.0, 135.0, 100.0, 130.0)];
        let report = engine.process_window(window(1), &mut candles).unwrap();
        assert_eq!(candles[0].atr, Some(3.4286));
        assert!(candles[0].atr_flagged);
        assert_eq!(report.flagged, vec!["A".to_string()]);

        // TR 28 -> 2.9286 stays under the threshold
        let mut engine = AtrEngine::from_states([warm_state("A", 100.0, 1.0, window(0))]).unwrap();
        let mut candles = vec![candle("A", window(1), 100.0, 128.0, 100.0, 120.0)];
        engine.process_window(window(1), &mut candles).unwrap();
        assert_eq!(candles[0].atr, Some(2.9286));
        assert!(!candles[0].atr_flagged);

        assert!(!is_anomalous(1.0, 3.0));
        assert!(!is_anomalous(0.0, 5.0));
    }

    #[test]
    fn test_out_of_order_window_leaves_state_untouched() {
        let mut engine = AtrEngine::from_states([
            warm_state("A", 100.0, 1.0, window(0)),
            warm_state("B", 50.0, 0.5, window(3)),
        ])
        .unwrap();
        let before = engine.snapshot();

        let mut candles = vec![
            candle("A", window(2), 100.0, 101.0, 99.0, 100.5),
            candle("B", window(2), 50.0, 51.0, 49.0, 50.5),
        ];
        let err = engine.process_window(window(2), &mut candles).unwrap_err();

        assert!(matches!(err, AtrError::OutOfOrder { .. }));
        assert!(!err.is_fatal());
        // A was computed before B failed, but nothing was committed
        assert_eq!(engine.snapshot(), before);
    }

    #[test]
    fn test_corrupt_state_is_rejected_on_restore() {
        let mut bad = warm_state("A", 100.0, 1.0, window(0));
        bad.prev_atr = Some(-0.5);
        let err = AtrEngine::from_states([bad]).unwrap_err();
        assert!(err.is_fatal());

        let mut bad = warm_state("B", f64::NAN, 1.0, window(0));
        bad.prev_atr = None;
        assert!(AtrEngine::from_states([bad]).is_err());
    }

    #[test]
    fn test_summary_and_rows() {
        let mut engine = AtrEngine::from_states([warm_state("A", 100.0, 1.0, window(0))]).unwrap();
        let mut candles = vec![candle("B", window(1), 10.0, 11.0, 9.5, 10.5)];
        engine.process_window(window(1), &mut candles).unwrap();

        assert_eq!(
            engine.summary(),
            AtrSummary {
                instruments: 2,
                warm: 1,
                warming: 1
            }
        );
        let rows = engine.state_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instrument_id, "A");
        assert_eq!(rows[1].last_atr, None);
        assert_eq!(rows[1].last_close, 10.5);
    }
}
