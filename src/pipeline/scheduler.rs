//! Session scheduler - fires the aggregator once per 5-minute boundary
//!
//! Fire times come from the session's precomputed boundary list and the
//! task sleeps until each one (plus a small grace for in-flight ticks).
//! Windows whose fire time had already passed when the session started are
//! skipped: their ticks were never seen by this process.

use super::aggregator::{AggregatorError, CandleAggregator};
use super::clock::{ClockError, SessionClock};
use crate::shutdown::{wait_for_shutdown, ShutdownSignal};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Source of wall-clock time; swapped out in tests
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Final window finalized at close
    Completed,
    /// Shutdown requested; the in-progress window was left unfinalized
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub windows_finalized: usize,
    /// Already processed before a restart, or missed while the process was down
    pub windows_skipped: usize,
}

pub struct SessionScheduler {
    clock: SessionClock,
    aggregator: Arc<CandleAggregator>,
    grace: Duration,
    now_fn: NowFn,
}

impl SessionScheduler {
    pub fn new(clock: SessionClock, aggregator: Arc<CandleAggregator>, grace: Duration) -> Self {
        Self {
            clock,
            aggregator,
            grace,
            now_fn: Arc::new(Utc::now),
        }
    }

    pub fn with_now_fn(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    fn until(&self, fire_at: DateTime<Utc>) -> Duration {
        let remaining = fire_at - (self.now_fn)();
        remaining.to_std().unwrap_or(Duration::ZERO) + self.grace
    }

    /// Finalize every window of `date`'s session in order
    pub async fn run_session(
        &self,
        date: NaiveDate,
        mut shutdown: ShutdownSignal,
    ) -> Result<SessionSummary, SchedulerError> {
        let schedule = self.clock.finalization_times(date)?;
        let started_at = (self.now_fn)();
        let mut summary = SessionSummary {
            outcome: SessionOutcome::Completed,
            windows_finalized: 0,
            windows_skipped: 0,
        };

        log::info!("⏰ Session scheduler started for {}", date);
        log::info!("   ├─ Windows: {}", schedule.len());
        log::info!(
            "   └─ Close: {}",
            schedule
                .last()
                .map(|(_, fires)| fires.format("%H:%M").to_string())
                .unwrap_or_default()
        );

        let last_processed = self.aggregator.last_processed_window();
        for (window_start, fires_at) in schedule {
            if last_processed.is_some_and(|last| window_start <= last) {
                summary.windows_skipped += 1;
                continue;
            }
            let fires_at = fires_at.with_timezone(&Utc);
            if fires_at <= started_at {
                log::warn!(
                    "⚠️  Window {} closed before the session started, skipping",
                    window_start.format("%H:%M")
                );
                summary.windows_skipped += 1;
                continue;
            }

            let wait = self.until(fires_at);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    log::info!(
                        "🛑 Shutdown before {} closed, leaving it unfinalized",
                        window_start.format("%H:%M")
                    );
                    summary.outcome = SessionOutcome::Interrupted;
                    return Ok(summary);
                }
            }

            let report = self.aggregator.finalize(window_start)?;
            if !report.skipped {
                summary.windows_finalized += 1;
            }
        }

        log::info!(
            "✅ Session {} complete: {} windows finalized, {} skipped",
            date,
            summary.windows_finalized,
            summary.windows_skipped
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{Instrument, InstrumentUniverse};
    use crate::pipeline::aggregator::PipelineState;
    use crate::pipeline::clock::{parse_hhmm, SessionHours, IST_OFFSET_SECONDS};
    use crate::pipeline::tick_buffer::TickBuffer;
    use crate::pipeline::types::MarketTime;
    use crate::pipeline::write_queue::{write_queue, WriteItem};
    use crate::shutdown::shutdown_channel;
    use chrono::{FixedOffset, TimeZone};
    use std::sync::Mutex;

    fn ist(h: u32, m: u32) -> MarketTime {
        FixedOffset::east_opt(19_800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 15, h, m, 0)
            .unwrap()
    }

    /// Wall clock that follows tokio's paused clock from `start`
    fn paused_now(start: MarketTime) -> NowFn {
        let origin = tokio::time::Instant::now();
        let start = start.with_timezone(&Utc);
        Arc::new(move || {
            start + chrono::Duration::from_std(origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
        })
    }

    fn setup(
        open: &str,
        close: &str,
        state: PipelineState,
    ) -> (SessionClock, Arc<CandleAggregator>, Arc<TickBuffer>, crate::pipeline::write_queue::WriteQueueReceiver) {
        let hours = SessionHours::new(parse_hhmm(open).unwrap(), parse_hhmm(close).unwrap()).unwrap();
        let clock = SessionClock::new(IST_OFFSET_SECONDS, hours).unwrap();
        let universe = Arc::new(
            InstrumentUniverse::from_instruments(vec![Instrument {
                token: "1".to_string(),
                symbol: "A".to_string(),
                segment: "NSE_EQ".to_string(),
            }])
            .unwrap(),
        );
        let buffer = Arc::new(TickBuffer::new(clock.clone()));
        let (queue, rx) = write_queue(12);
        let aggregator = Arc::new(CandleAggregator::new(
            universe,
            buffer.clone(),
            Arc::new(Mutex::new(state)),
            queue,
        ));
        (clock, aggregator, buffer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_boundary_through_close() {
        let (clock, aggregator, buffer, mut rx) = setup("09:15", "09:30", PipelineState::default());
        let scheduler = SessionScheduler::new(clock, aggregator.clone(), Duration::from_millis(500))
            .with_now_fn(paused_now(ist(9, 10)));

        for (m, price) in [(16, 100.0), (21, 101.0), (29, 102.0)] {
            buffer.record_tick("A", price, ist(9, m).with_timezone(&Utc), None);
        }

        let (_tx, shutdown) = shutdown_channel();
        let summary = scheduler.run_session(ist(9, 15).date_naive(), shutdown).await.unwrap();

        assert_eq!(summary.outcome, SessionOutcome::Completed);
        assert_eq!(summary.windows_finalized, 3);
        assert_eq!(aggregator.last_processed_window(), Some(ist(9, 25)));

        rx.close();
        let mut windows = Vec::new();
        while let Some(item) = rx.recv().await {
            if let WriteItem::Batch(batch) = item {
                windows.push(batch.window_start);
            }
        }
        assert_eq!(windows, vec![ist(9, 15), ist(9, 20), ist(9, 25)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_current_window_open() {
        let (clock, aggregator, _buffer, _rx) = setup("09:15", "15:30", PipelineState::default());
        let scheduler = SessionScheduler::new(clock, aggregator.clone(), Duration::from_millis(500))
            .with_now_fn(paused_now(ist(9, 15)));

        let (tx, shutdown) = shutdown_channel();
        let handle = tokio::spawn(async move { scheduler.run_session(ist(9, 15).date_naive(), shutdown).await });

        // Past the 09:20 boundary, before 09:25
        tokio::time::sleep(Duration::from_secs(7 * 60)).await;
        tx.send(true).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Interrupted);
        assert_eq!(summary.windows_finalized, 1);
        assert_eq!(aggregator.last_processed_window(), Some(ist(9, 15)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_skips_processed_and_missed_windows() {
        let state = PipelineState {
            last_processed_window: Some(ist(9, 15)),
            ..PipelineState::default()
        };
        let (clock, aggregator, _buffer, _rx) = setup("09:15", "09:45", state);
        // Restarted at 09:32: 09:20 and 09:25 closed while down
        let scheduler = SessionScheduler::new(clock, aggregator.clone(), Duration::ZERO)
            .with_now_fn(paused_now(ist(9, 32)));

        let (_tx, shutdown) = shutdown_channel();
        let summary = scheduler.run_session(ist(9, 15).date_naive(), shutdown).await.unwrap();

        assert_eq!(summary.windows_skipped, 3);
        assert_eq!(summary.windows_finalized, 3);
        assert_eq!(aggregator.last_processed_window(), Some(ist(9, 40)));
    }
}
