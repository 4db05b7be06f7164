//! Candle Aggregator - turns a closed window into an immutable batch
//!
//! Per window: swap the partial windows out of the Tick Buffer, validate
//! OHLC, report instruments without ticks, run the ATR pass and hand the
//! batch plus the refreshed `atr_state` rows to the Write Queue. The window
//! pointer advances even when the ATR pass fails, so one bad window never
//! stalls the session.

use super::atr::{AtrEngine, AtrError};
use super::tick_buffer::TickBuffer;
use super::types::{generate_row_id, Candle, EventLevel, MarketTime, PartialWindow, SystemEvent, WriteBatch};
use super::write_queue::{QueueClosed, WriteQueue};
use crate::instruments::InstrumentUniverse;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Names listed in a MISSING_INSTRUMENTS event before it is truncated
const MISSING_PREVIEW: usize = 10;

/// State that survives restarts through checkpoints
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub atr: AtrEngine,
    pub last_processed_window: Option<MarketTime>,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Atr(#[from] AtrError),
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub window_start: MarketTime,
    /// Already at or before the last processed window; nothing was done
    pub skipped: bool,
    pub candles: usize,
    pub missing: Vec<String>,
    pub rejected: Vec<String>,
    pub flagged: Vec<String>,
    pub seeded: usize,
    /// ATR pass failed; no batch was enqueued for this window
    pub atr_failed: bool,
}

impl WindowReport {
    fn new(window_start: MarketTime) -> Self {
        Self {
            window_start,
            skipped: false,
            candles: 0,
            missing: Vec::new(),
            rejected: Vec::new(),
            flagged: Vec::new(),
            seeded: 0,
            atr_failed: false,
        }
    }
}

/// OHLC consistency: finite positive prices with low <= open, close <= high
pub(crate) fn validate_ohlc(partial: &PartialWindow) -> Result<(), String> {
    let prices = [partial.open, partial.high, partial.low, partial.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(format!(
            "non-positive or non-finite price (O {} H {} L {} C {})",
            partial.open, partial.high, partial.low, partial.close
        ));
    }
    if partial.low > partial.high
        || partial.open < partial.low
        || partial.open > partial.high
        || partial.close < partial.low
        || partial.close > partial.high
    {
        return Err(format!(
            "inconsistent OHLC (O {} H {} L {} C {})",
            partial.open, partial.high, partial.low, partial.close
        ));
    }
    Ok(())
}

fn anomaly_event(candle: &Candle, window_start: MarketTime) -> SystemEvent {
    SystemEvent::new(
        EventLevel::Warning,
        "ATR_ANOMALY",
        format!(
            "{}: ATR {} with TR {} (more than 3x the previous ATR)",
            candle.instrument_id,
            candle.atr.unwrap_or_default(),
            candle.true_range
        ),
    )
    .with_window(window_start)
}

pub struct CandleAggregator {
    universe: Arc<InstrumentUniverse>,
    tick_buffer: Arc<TickBuffer>,
    state: Arc<Mutex<PipelineState>>,
    queue: WriteQueue,
}

impl CandleAggregator {
    pub fn new(
        universe: Arc<InstrumentUniverse>,
        tick_buffer: Arc<TickBuffer>,
        state: Arc<Mutex<PipelineState>>,
        queue: WriteQueue,
    ) -> Self {
        Self {
            universe,
            tick_buffer,
            state,
            queue,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_processed_window(&self) -> Option<MarketTime> {
        self.lock_state().last_processed_window
    }

    /// Finalize one window. Only a fatal ATR error or a closed queue is
    /// returned as `Err`; everything else is reported and the session goes on.
    pub fn finalize(&self, window_start: MarketTime) -> Result<WindowReport, AggregatorError> {
        let mut report = WindowReport::new(window_start);

        if self
            .lock_state()
            .last_processed_window
            .is_some_and(|last| window_start <= last)
        {
            log::debug!("Window {} already processed, skipping", window_start.format("%H:%M"));
            report.skipped = true;
            return Ok(report);
        }

        let partials = self.tick_buffer.finalize_window(window_start);
        self.finalize_partials(window_start, partials)
    }

    /// Turn already collected partial windows into the window's batch.
    /// `finalize` feeds it from the Tick Buffer; the skip check is its job.
    pub(crate) fn finalize_partials(
        &self,
        window_start: MarketTime,
        mut partials: HashMap<String, PartialWindow>,
    ) -> Result<WindowReport, AggregatorError> {
        let mut report = WindowReport::new(window_start);
        let created_at = Utc::now();
        let mut candles = Vec::with_capacity(self.universe.len());

        for instrument in self.universe.instruments() {
            let Some(partial) = partials.remove(&instrument.symbol) else {
                report.missing.push(instrument.symbol.clone());
                continue;
            };
            if let Err(reason) = validate_ohlc(&partial) {
                self.queue.alert(
                    SystemEvent::new(
                        EventLevel::Error,
                        "CANDLE_REJECTED",
                        format!("{}: {}", instrument.symbol, reason),
                    )
                    .with_window(window_start),
                );
                report.rejected.push(instrument.symbol.clone());
                continue;
            }
            candles.push(Candle {
                id: generate_row_id(&instrument.symbol, &window_start),
                window_start,
                instrument_id: instrument.symbol.clone(),
                segment: instrument.segment.clone(),
                open: partial.open,
                high: partial.high,
                low: partial.low,
                close: partial.close,
                true_range: 0.0,
                atr: None,
                atr_flagged: false,
                volume: partial.volume,
                created_at,
            });
        }

        if !partials.is_empty() {
            let mut unknown: Vec<_> = partials.into_keys().collect();
            unknown.sort();
            log::warn!("⚠️  Ignoring ticks for {} unknown instruments: {:?}", unknown.len(), unknown);
        }

        if !report.missing.is_empty() {
            let preview: Vec<&str> = report
                .missing
                .iter()
                .take(MISSING_PREVIEW)
                .map(String::as_str)
                .collect();
            let more = report.missing.len().saturating_sub(MISSING_PREVIEW);
            self.queue.alert(
                SystemEvent::new(
                    EventLevel::Warning,
                    "MISSING_INSTRUMENTS",
                    format!(
                        "{} of {} instruments without ticks: {}{}",
                        report.missing.len(),
                        self.universe.len(),
                        preview.join(", "),
                        if more > 0 { format!(" (+{} more)", more) } else { String::new() }
                    ),
                )
                .with_window(window_start),
            );
        }

        // ATR pass under the state lock; the pointer advances either way.
        // The batch is queued before the lock drops so a checkpoint never
        // records the pointer ahead of a batch the writer has not seen.
        let atr_result = {
            let mut state = self.lock_state();
            let result = state.atr.process_window(window_start, &mut candles);
            state.last_processed_window = Some(window_start);
            match result {
                Ok(atr_report) => {
                    report.candles = candles.len();
                    let anomalies: Vec<SystemEvent> = candles
                        .iter()
                        .filter(|c| c.atr_flagged)
                        .map(|candle| anomaly_event(candle, window_start))
                        .collect();
                    if !candles.is_empty() {
                        self.queue.push_batch(WriteBatch { window_start, candles })?;
                        self.queue.push_atr_state(state.atr.state_rows())?;
                    }
                    Ok((atr_report, anomalies))
                }
                Err(e) => Err(e),
            }
        };

        let (atr_report, anomalies) = match atr_result {
            Ok(done) => done,
            Err(e) => {
                self.queue.alert(
                    SystemEvent::new(EventLevel::Critical, "ATR_FAILURE", e.to_string()).with_window(window_start),
                );
                if e.is_fatal() {
                    return Err(e.into());
                }
                report.atr_failed = true;
                return Ok(report);
            }
        };

        report.seeded = atr_report.seeded.len();
        report.flagged = atr_report.flagged;
        for event in anomalies {
            self.queue.alert(event);
        }

        log::info!("🕯️  Window {} finalized", window_start.format("%Y-%m-%d %H:%M"));
        log::info!("   ├─ Candles: {}/{}", report.candles, self.universe.len());
        log::info!(
            "   ├─ Missing: {}, rejected: {}",
            report.missing.len(),
            report.rejected.len()
        );
        log::info!("   └─ ATR seeded: {}, flagged: {}", report.seeded, report.flagged.len());

        self.queue.push_event(
            SystemEvent::new(
                EventLevel::Info,
                "WINDOW_COMPLETE",
                format!(
                    "{} candles, {} missing, {} rejected",
                    report.candles,
                    report.missing.len(),
                    report.rejected.len()
                ),
            )
            .with_window(window_start),
        )?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::Instrument;
    use crate::pipeline::atr::AtrState;
    use crate::pipeline::clock::{parse_hhmm, SessionClock, SessionHours, IST_OFFSET_SECONDS};
    use crate::pipeline::write_queue::{write_queue, WriteItem, WriteQueueReceiver};
    use chrono::{DateTime, FixedOffset, TimeZone};

    fn clock() -> SessionClock {
        let hours = SessionHours::new(parse_hhmm("09:15").unwrap(), parse_hhmm("15:30").unwrap()).unwrap();
        SessionClock::new(IST_OFFSET_SECONDS, hours).unwrap()
    }

    fn ist(h: u32, m: u32, s: u32) -> MarketTime {
        FixedOffset::east_opt(19_800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 15, h, m, s)
            .unwrap()
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        ist(h, m, s).with_timezone(&Utc)
    }

    fn universe(symbols: &[&str]) -> Arc<InstrumentUniverse> {
        Arc::new(
            InstrumentUniverse::from_instruments(
                symbols
                    .iter()
                    .enumerate()
                    .map(|(n, s)| Instrument {
                        token: n.to_string(),
                        symbol: s.to_string(),
                        segment: "NSE_EQ".to_string(),
                    })
                    .collect(),
            )
            .unwrap(),
        )
    }

    fn setup(
        symbols: &[&str],
        state: PipelineState,
    ) -> (CandleAggregator, Arc<TickBuffer>, Arc<Mutex<PipelineState>>, WriteQueueReceiver) {
        let buffer = Arc::new(TickBuffer::new(clock()));
        let state = Arc::new(Mutex::new(state));
        let (queue, rx) = write_queue(12);
        let aggregator = CandleAggregator::new(universe(symbols), buffer.clone(), state.clone(), queue);
        (aggregator, buffer, state, rx)
    }

    /// Everything queued so far; closes the receiver
    async fn drain(rx: &mut WriteQueueReceiver) -> Vec<WriteItem> {
        rx.close();
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    fn warm(id: &str, prev_close: f64, prev_atr: f64, last: MarketTime) -> AtrState {
        AtrState {
            instrument_id: id.to_string(),
            prev_close: Some(prev_close),
            prev_atr: Some(prev_atr),
            tr_history: Vec::new(),
            candle_count: 20,
            last_window: Some(last),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_window_to_batch() {
        let state = PipelineState {
            atr: AtrEngine::from_states([warm("A", 101.0, 2.5, ist(9, 15, 0))]).unwrap(),
            last_processed_window: Some(ist(9, 15, 0)),
        };
        let (aggregator, buffer, state, mut rx) = setup(&["A", "B"], state);

        for (s, price) in [(1, 100.0), (60, 105.0), (120, 98.0), (299, 102.0)] {
            buffer.record_tick("A", price, utc(9, 20, 0) + chrono::Duration::seconds(s - 1), None);
        }

        let report = aggregator.finalize(ist(9, 20, 0)).unwrap();
        assert_eq!(report.candles, 1);
        assert_eq!(report.missing, vec!["B".to_string()]);
        assert!(!report.atr_failed);
        assert_eq!(state.lock().unwrap().last_processed_window, Some(ist(9, 20, 0)));

        let items = drain(&mut rx).await;
        let batch = items
            .iter()
            .find_map(|item| match item {
                WriteItem::Batch(batch) => Some(batch.clone()),
                _ => None,
            })
            .unwrap();
        let candle = &batch.candles[0];
        assert_eq!(candle.id, "A_20240315_0920");
        assert_eq!((candle.open, candle.high, candle.low, candle.close), (100.0, 105.0, 98.0, 102.0));
        assert_eq!(candle.true_range, 7.0);
        assert_eq!(candle.atr, Some(2.8214));

        // Batch first, then its atr_state rows
        let batch_pos = items.iter().position(|i| matches!(i, WriteItem::Batch(_))).unwrap();
        let rows_pos = items.iter().position(|i| matches!(i, WriteItem::AtrState(_))).unwrap();
        assert!(batch_pos < rows_pos);

        let events: Vec<String> = items
            .iter()
            .filter_map(|i| match i {
                WriteItem::Event(e) => Some(e.event.clone()),
                _ => None,
            })
            .collect();
        assert!(events.contains(&"MISSING_INSTRUMENTS".to_string()));
        assert!(events.contains(&"WINDOW_COMPLETE".to_string()));
    }

    #[tokio::test]
    async fn test_processed_window_is_skipped() {
        let state = PipelineState {
            atr: AtrEngine::new(),
            last_processed_window: Some(ist(9, 25, 0)),
        };
        let (aggregator, _buffer, _state, mut rx) = setup(&["A"], state);

        let report = aggregator.finalize(ist(9, 20, 0)).unwrap();
        assert!(report.skipped);
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_atr_failure_advances_pointer_without_batch() {
        // ATR state ahead of the window pointer: out-of-order for this window
        let state = PipelineState {
            atr: AtrEngine::from_states([warm("A", 100.0, 1.0, ist(9, 30, 0))]).unwrap(),
            last_processed_window: None,
        };
        let (aggregator, buffer, state, mut rx) = setup(&["A"], state);
        buffer.record_tick("A", 100.0, utc(9, 21, 0), None);

        let report = aggregator.finalize(ist(9, 20, 0)).unwrap();
        assert!(report.atr_failed);
        assert_eq!(state.lock().unwrap().last_processed_window, Some(ist(9, 20, 0)));

        let items = drain(&mut rx).await;
        assert!(!items.iter().any(|i| matches!(i, WriteItem::Batch(_))));
        assert!(items.iter().any(|i| matches!(
            i,
            WriteItem::Event(e) if e.event == "ATR_FAILURE" && e.level == EventLevel::Critical
        )));
    }

    #[tokio::test]
    async fn test_empty_window_is_an_explicit_gap() {
        let (aggregator, _buffer, _state, mut rx) = setup(&["A", "B"], PipelineState::default());

        let report = aggregator.finalize(ist(9, 20, 0)).unwrap();
        assert_eq!(report.candles, 0);
        assert_eq!(report.missing.len(), 2);
        assert!(!drain(&mut rx).await.iter().any(|i| matches!(i, WriteItem::Batch(_))));
    }

    #[tokio::test]
    async fn test_inconsistent_candle_is_dropped_before_atr() {
        let state = PipelineState {
            atr: AtrEngine::from_states([
                warm("A", 101.0, 2.5, ist(9, 15, 0)),
                warm("B", 50.0, 1.0, ist(9, 15, 0)),
            ])
            .unwrap(),
            last_processed_window: Some(ist(9, 15, 0)),
        };
        let (aggregator, _buffer, state, mut rx) = setup(&["A", "B"], state);
        let b_before = state.lock().unwrap().atr.state("B").cloned().unwrap();

        let mut good = PartialWindow::open_with("A", ist(9, 20, 0), 100.0, None);
        good.apply(103.0, None);
        let mut bad = PartialWindow::open_with("B", ist(9, 20, 0), 50.0, None);
        bad.apply(51.0, None);
        bad.close = 60.0;

        let partials = HashMap::from([("A".to_string(), good), ("B".to_string(), bad)]);
        let report = aggregator.finalize_partials(ist(9, 20, 0), partials).unwrap();
        assert_eq!(report.candles, 1);
        assert_eq!(report.rejected, vec!["B".to_string()]);
        assert!(report.missing.is_empty());

        {
            let guard = state.lock().unwrap();
            assert_eq!(guard.atr.state("B"), Some(&b_before));
            assert_eq!(guard.atr.state("A").unwrap().last_window, Some(ist(9, 20, 0)));
        }

        let items = drain(&mut rx).await;
        let batch = items
            .iter()
            .find_map(|item| match item {
                WriteItem::Batch(batch) => Some(batch.clone()),
                _ => None,
            })
            .unwrap();
        let ids: Vec<&str> = batch.candles.iter().map(|c| c.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);

        let rejected: Vec<&SystemEvent> = items
            .iter()
            .filter_map(|i| match i {
                WriteItem::Event(e) if e.event == "CANDLE_REJECTED" => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].level, EventLevel::Error);
        assert!(rejected[0].details.starts_with("B: inconsistent OHLC"));
    }

    #[test]
    fn test_ohlc_validation() {
        let mut partial = PartialWindow::open_with("A", ist(9, 20, 0), 100.0, None);
        partial.apply(105.0, None);
        assert!(validate_ohlc(&partial).is_ok());

        partial.close = 110.0;
        assert!(validate_ohlc(&partial).is_err());

        let mut partial = PartialWindow::open_with("A", ist(9, 20, 0), 100.0, None);
        partial.low = f64::NAN;
        assert!(validate_ohlc(&partial).is_err());
    }
}
