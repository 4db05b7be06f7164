//! Tick Buffer - in-progress candles per instrument
//!
//! Ticks are bucketed by the window their exchange timestamp falls in, so a
//! tick for the next window that arrives before the scheduler finalizes the
//! previous one is kept rather than mixed into the closing candle. The lock
//! is held only for the map update or the finalize swap.

use super::clock::{ClockError, DayWindows, SessionClock};
use super::types::{MarketTime, PartialWindow, Tick};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    /// Window already finalized; the tick is dropped
    Late,
    OutsideSession,
    /// Non-finite or non-positive price
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickBufferStats {
    pub accepted: u64,
    pub late: u64,
    pub outside_session: u64,
    pub rejected: u64,
    /// Partial windows discarded because an older window was never finalized
    pub stale_discarded: u64,
}

#[derive(Default)]
struct BufferState {
    day: Option<DayWindows>,
    windows: BTreeMap<MarketTime, HashMap<String, PartialWindow>>,
    last_finalized: Option<MarketTime>,
    stats: TickBufferStats,
}

impl BufferState {
    fn locate(&mut self, clock: &SessionClock, local: &MarketTime) -> Result<MarketTime, ClockError> {
        let date = local.date_naive();
        let day = match self.day.take() {
            Some(day) if day.date() == date => day,
            _ => clock.day_windows(date)?,
        };
        let window = day.locate(local);
        self.day = Some(day);
        window
    }
}

pub struct TickBuffer {
    clock: SessionClock,
    inner: Mutex<BufferState>,
}

impl TickBuffer {
    pub fn new(clock: SessionClock) -> Self {
        Self {
            clock,
            inner: Mutex::new(BufferState::default()),
        }
    }

    /// Buffer that treats everything up to `last_finalized` as already closed
    /// (used when resuming from a checkpoint)
    pub fn resume_after(clock: SessionClock, last_finalized: Option<MarketTime>) -> Self {
        let buffer = Self::new(clock);
        buffer.lock().last_finalized = last_finalized;
        buffer
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, tick: &Tick) -> RecordOutcome {
        self.record_tick(&tick.instrument_id, tick.price, tick.timestamp, tick.volume)
    }

    pub fn record_tick(
        &self,
        instrument_id: &str,
        price: f64,
        timestamp: DateTime<Utc>,
        volume: Option<f64>,
    ) -> RecordOutcome {
        let local = self.clock.to_local(timestamp);
        let mut state = self.lock();

        if !price.is_finite() || price <= 0.0 {
            state.stats.rejected += 1;
            return RecordOutcome::Rejected;
        }

        let window = match state.locate(&self.clock, &local) {
            Ok(window) => window,
            Err(_) => {
                state.stats.outside_session += 1;
                return RecordOutcome::OutsideSession;
            }
        };

        if state.last_finalized.is_some_and(|last| window <= last) {
            state.stats.late += 1;
            return RecordOutcome::Late;
        }

        state.stats.accepted += 1;
        let volume = volume.filter(|v| v.is_finite() && *v >= 0.0);
        match state.windows.entry(window).or_default().entry(instrument_id.to_string()) {
            Entry::Occupied(mut partial) => {
                partial.get_mut().apply(price, volume);
                RecordOutcome::Updated
            }
            Entry::Vacant(slot) => {
                slot.insert(PartialWindow::open_with(instrument_id, window, price, volume));
                RecordOutcome::Created
            }
        }
    }

    /// Swap out every partial window for `window_start`.
    ///
    /// Instruments without ticks are absent from the result. Buckets older
    /// than `window_start` can only exist if a boundary was skipped; they
    /// are discarded and counted.
    pub fn finalize_window(&self, window_start: MarketTime) -> HashMap<String, PartialWindow> {
        let (closed, stale) = {
            let mut state = self.lock();
            let closed = state.windows.remove(&window_start).unwrap_or_default();
            let newer = state.windows.split_off(&window_start);
            let stale: usize = state.windows.values().map(HashMap::len).sum();
            state.windows = newer;
            state.stats.stale_discarded += stale as u64;
            state.last_finalized = Some(match state.last_finalized {
                Some(last) if last > window_start => last,
                _ => window_start,
            });
            (closed, stale)
        };

        if stale > 0 {
            log::warn!(
                "⚠️  Discarded {} partial windows older than {}",
                stale,
                window_start.format("%H:%M")
            );
        }
        closed
    }

    pub fn last_finalized(&self) -> Option<MarketTime> {
        self.lock().last_finalized
    }

    /// Instruments with at least one tick in `window_start`
    pub fn pending_instruments(&self, window_start: &MarketTime) -> usize {
        self.lock().windows.get(window_start).map_or(0, HashMap::len)
    }

    pub fn stats(&self) -> TickBufferStats {
        self.lock().stats
    }
}
