//! Pipeline runtime - wires the tasks of one trading session and runs the
//! day loop
//!
//! Per session:
//! - Writer task drains the Write Queue into the backend
//! - Ingestion task moves ticks from the feed channel into the Tick Buffer
//! - Feed task holds the subscription and reconnects on its own
//! - Checkpoint task snapshots state every interval
//! - The scheduler finalizes windows in the foreground
//!
//! Shutdown is sequenced: scheduler done, writer drained, final checkpoint,
//! then the feed is disconnected.
//!
//! Before the first session the restored checkpoint is reconciled against
//! the backend, and the holiday calendar is reloaded whenever the local
//! year moves on.

use super::aggregator::{CandleAggregator, PipelineState};
use super::batch_writer::{BatchWriter, RetryPolicy, WriterStats};
use super::calendar::{CalendarError, TradingCalendar};
use super::checkpoint::{
    checkpoint_task, reconcile_with_backend, restore_pipeline_state, Checkpoint, CheckpointError, CheckpointManager,
    ReconcileSource, Reconciliation, RestoredState,
};
use super::clock::{ClockError, SessionClock};
use super::fallback::FallbackStore;
use super::ingestion::{start_tick_ingestion, IngestionStats};
use super::scheduler::{NowFn, SchedulerError, SessionOutcome, SessionScheduler, SessionSummary};
use super::tick_buffer::TickBuffer;
use super::types::{EventLevel, SystemEvent};
use super::write_queue::write_queue;
use crate::backend::{BackendError, PersistenceBackend};
use crate::config::RuntimeConfig;
use crate::feed::{FeedClient, FeedClientConfig, FeedStats, FeedTransport, SessionAuthenticator};
use crate::instruments::InstrumentUniverse;
use crate::shutdown::{is_shutdown, shutdown_channel, wait_for_shutdown, ShutdownSignal};
use chrono::{Datelike, NaiveDate, Utc};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{0} is not a trading day")]
    NotTradingDay(NaiveDate),
    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },
}

/// Builds a fresh transport for each session
pub type TransportFactory = Arc<dyn Fn(Arc<InstrumentUniverse>) -> Box<dyn FeedTransport> + Send + Sync>;

pub struct FeedSource {
    pub authenticator: Arc<dyn SessionAuthenticator>,
    pub transport: TransportFactory,
    pub config: FeedClientConfig,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tick_channel_buffer: usize,
    pub queue_alert_depth: usize,
    pub retry_policy: RetryPolicy,
    pub checkpoint_interval: Duration,
    pub finalize_grace: Duration,
    /// How long before the open the feed is connected
    pub feed_lead: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_channel_buffer: 10_000,
            queue_alert_depth: 12,
            retry_policy: RetryPolicy::default(),
            checkpoint_interval: Duration::from_secs(300),
            finalize_grace: Duration::from_millis(500),
            feed_lead: Duration::from_secs(300),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            tick_channel_buffer: config.tick_channel_buffer.max(1),
            queue_alert_depth: config.write_queue_alert_depth,
            retry_policy: config.retry_policy(),
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs.max(1)),
            finalize_grace: Duration::from_millis(config.finalize_grace_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub date: NaiveDate,
    pub summary: SessionSummary,
    pub writer: WriterStats,
    pub ingestion: IngestionStats,
    pub feed: Option<FeedStats>,
}

pub struct Pipeline {
    clock: SessionClock,
    calendar: RwLock<TradingCalendar>,
    universe: Arc<InstrumentUniverse>,
    backend: Arc<dyn PersistenceBackend>,
    fallback: FallbackStore,
    checkpoints: Arc<CheckpointManager>,
    state: Arc<Mutex<PipelineState>>,
    /// Whether the restored checkpoint had all its batches written
    restored_write_confirmed: bool,
    settings: PipelineSettings,
    feed: Option<FeedSource>,
    now_fn: NowFn,
}

impl Pipeline {
    /// Restores pipeline state from the latest checkpoint
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: SessionClock,
        calendar: TradingCalendar,
        universe: Arc<InstrumentUniverse>,
        backend: Arc<dyn PersistenceBackend>,
        fallback: FallbackStore,
        checkpoints: CheckpointManager,
        settings: PipelineSettings,
        fresh_start: bool,
    ) -> Result<Self, PipelineError> {
        let restored = restore_pipeline_state(&checkpoints, fresh_start)?;
        Ok(Self {
            clock,
            calendar: RwLock::new(calendar),
            universe,
            backend,
            fallback,
            checkpoints: Arc::new(checkpoints),
            state: Arc::new(Mutex::new(restored.state)),
            restored_write_confirmed: restored.write_confirmed,
            settings,
            feed: None,
            now_fn: Arc::new(Utc::now),
        })
    }

    pub fn with_feed(mut self, feed: FeedSource) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_now_fn(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn state(&self) -> Arc<Mutex<PipelineState>> {
        self.state.clone()
    }

    fn calendar(&self) -> RwLockReadGuard<'_, TradingCalendar> {
        self.calendar.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Reload the holiday files when the local year differs from the one
    /// the calendar was loaded for. A failed reload keeps the current
    /// calendar and is tried again on the next pass of the day loop.
    fn refresh_calendar(&self, today: NaiveDate) -> bool {
        let reloaded = self.calendar().reload_for_year(today.year());
        match reloaded {
            Ok(Some(calendar)) => {
                log::info!("📅 Calendar reloaded for {:?}", calendar.loaded_years());
                *self.calendar.write().unwrap_or_else(|p| p.into_inner()) = calendar;
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::error!("❌ Calendar reload for {} failed, keeping the current one: {}", today.year(), e);
                false
            }
        }
    }

    /// Cross-check the restored checkpoint against what the backend holds
    /// and adopt whichever side is further along. `run` does this once
    /// before the first session.
    pub async fn reconcile(&self) -> Result<Reconciliation, PipelineError> {
        let mut restored = RestoredState {
            state: self.state.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            write_confirmed: self.restored_write_confirmed,
        };
        let outcome = reconcile_with_backend(&mut restored, self.backend.as_ref()).await?;
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = restored.state;

        if outcome.source == ReconcileSource::BackendAhead || !outcome.adopted.is_empty() {
            self.save_checkpoint()?;
        }
        if let Some(event) = &outcome.event {
            event.log();
            // No writer runs yet, so the event goes straight to the backend
            if let Err(e) = self.backend.append_log(std::slice::from_ref(event)).await {
                log::warn!("Failed to record {}: {}", event.event, e);
            }
        }
        Ok(outcome)
    }

    fn save_checkpoint(&self) -> Result<(), CheckpointError> {
        let checkpoint = {
            let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
            Checkpoint::capture(&guard)
        };
        self.checkpoints.save(&checkpoint)
    }

    /// Run one trading session from feed connect to sequenced shutdown
    pub async fn run_session(&self, date: NaiveDate, shutdown: ShutdownSignal) -> Result<SessionReport, PipelineError> {
        let hours = self
            .calendar()
            .session_hours(date)
            .ok_or(PipelineError::NotTradingDay(date))?;
        let clock = self.clock.with_hours(hours);

        log::info!("🚀 Starting session {}", date);
        log::info!("   ├─ Hours: {} - {}", hours.open.format("%H:%M"), hours.close.format("%H:%M"));
        log::info!("   ├─ Instruments: {}", self.universe.len());
        log::info!("   └─ Backend: {}", self.backend.backend_type());

        // 1. Writer
        let (queue, queue_rx) = write_queue(self.settings.queue_alert_depth);
        let writer = BatchWriter::new(
            self.backend.clone(),
            self.fallback.clone(),
            self.settings.retry_policy.clone(),
        );
        let (writer_stop, writer_stop_rx) = shutdown_channel();
        let writer_handle = tokio::spawn(writer.run(queue_rx, writer_stop_rx));

        // 2. Ingestion
        let last_processed = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_processed_window;
        let tick_buffer = Arc::new(TickBuffer::resume_after(clock.clone(), last_processed));
        let (tick_tx, tick_rx) = mpsc::channel(self.settings.tick_channel_buffer);
        let ingestion_handle = tokio::spawn(start_tick_ingestion(
            tick_rx,
            tick_buffer.clone(),
            self.settings.tick_channel_buffer,
        ));

        // 3. Feed
        let (feed_stop, feed_stop_rx) = shutdown_channel();
        let feed_handle = self.feed.as_ref().map(|source| {
            let (client, _state_rx) = FeedClient::new(
                (source.transport)(self.universe.clone()),
                source.authenticator.clone(),
                self.universe.clone(),
                tick_tx.clone(),
                queue.clone(),
                source.config.clone(),
            );
            tokio::spawn(client.run(feed_stop_rx))
        });
        // The feed holds the only sender; ingestion ends when it stops
        drop(tick_tx);

        // 4. Periodic checkpoints
        let (checkpoint_stop, checkpoint_stop_rx) = shutdown_channel();
        let checkpoint_handle = tokio::spawn(checkpoint_task(
            self.checkpoints.clone(),
            self.state.clone(),
            queue.progress(),
            self.settings.checkpoint_interval,
            checkpoint_stop_rx,
        ));

        queue.alert(SystemEvent::new(
            EventLevel::Info,
            "SESSION_START",
            format!(
                "{} {}-{} ({} instruments)",
                date,
                hours.open.format("%H:%M"),
                hours.close.format("%H:%M"),
                self.universe.len()
            ),
        ));

        // 5. Scheduler in the foreground
        let aggregator = Arc::new(CandleAggregator::new(
            self.universe.clone(),
            tick_buffer.clone(),
            self.state.clone(),
            queue.clone(),
        ));
        let scheduler = SessionScheduler::new(clock, aggregator, self.settings.finalize_grace)
            .with_now_fn(self.now_fn.clone());
        let scheduled = scheduler.run_session(date, shutdown).await;

        let stats = tick_buffer.stats();
        queue.alert(SystemEvent::new(
            EventLevel::Info,
            "SESSION_END",
            match &scheduled {
                Ok(summary) => format!(
                    "{:?}: {} windows finalized, {} skipped, {} late ticks",
                    summary.outcome, summary.windows_finalized, summary.windows_skipped, stats.late
                ),
                Err(e) => format!("aborted: {}", e),
            },
        ));

        // Sequenced shutdown
        log::info!("🛑 Shutting down session {}", date);
        let _ = checkpoint_stop.send(true);
        if let Err(e) = checkpoint_handle.await {
            log::warn!("Checkpoint task ended abnormally: {}", e);
        }

        log::info!("   ├─ Flushing write queue ({} batches)", queue.batch_depth());
        let _ = writer_stop.send(true);
        let writer_stats = writer_handle.await.map_err(|e| PipelineError::Task {
            task: "writer",
            reason: e.to_string(),
        })?;

        log::info!("   ├─ Saving final checkpoint");
        self.save_checkpoint()?;

        log::info!("   ├─ Disconnecting feed");
        let _ = feed_stop.send(true);
        let feed_stats = match feed_handle {
            Some(handle) => Some(handle.await.map_err(|e| PipelineError::Task {
                task: "feed",
                reason: e.to_string(),
            })?),
            None => None,
        };
        let ingestion_stats = ingestion_handle.await.map_err(|e| PipelineError::Task {
            task: "ingestion",
            reason: e.to_string(),
        })?;
        log::info!("   └─ Session {} closed", date);

        Ok(SessionReport {
            date,
            summary: scheduled?,
            writer: writer_stats,
            ingestion: ingestion_stats,
            feed: feed_stats,
        })
    }

    /// Day loop: run each trading session, idle in between, until shutdown
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        self.reconcile().await?;

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            let now = (self.now_fn)();
            let today = self.clock.local_date(now);
            self.refresh_calendar(today);
            let (date, hours) = {
                let calendar = self.calendar();
                let date = match calendar.session_hours(today) {
                    Some(hours) if now < self.clock.with_hours(hours).session_bounds(today)?.1 => today,
                    _ => calendar.next_trading_day(today)?,
                };
                let hours = calendar
                    .session_hours(date)
                    .ok_or(PipelineError::NotTradingDay(date))?;
                (date, hours)
            };
            let (open, _) = self.clock.with_hours(hours).session_bounds(date)?;

            let start_at = open.with_timezone(&Utc)
                - chrono::Duration::from_std(self.settings.feed_lead).unwrap_or_else(|_| chrono::Duration::zero());
            if let Ok(idle) = (start_at - now).to_std() {
                if !idle.is_zero() {
                    log::info!("💤 Idle until {} (session {})", start_at.with_timezone(&self.clock.offset()), date);
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => continue,
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }

            let report = self.run_session(date, shutdown.clone()).await?;
            log::info!("📊 Session {} summary", report.date);
            log::info!("   ├─ Windows finalized: {}", report.summary.windows_finalized);
            log::info!(
                "   ├─ Batches written: {} (fallback: {})",
                report.writer.batches_written,
                report.writer.batches_to_fallback
            );
            log::info!("   └─ Ticks accepted: {}", report.ingestion.accepted);

            if report.summary.outcome == SessionOutcome::Interrupted {
                break;
            }
        }

        log::info!("👋 Pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SchemaMetadata, SqliteBackend};
    use crate::pipeline::clock::{parse_hhmm, SessionHours, IST_OFFSET_SECONDS};
    use crate::instruments::Instrument;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn hours() -> SessionHours {
        SessionHours::new(parse_hhmm("09:15").unwrap(), parse_hhmm("15:30").unwrap()).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pipeline(dir: &Path, calendar: TradingCalendar) -> Pipeline {
        let backend: Arc<dyn PersistenceBackend> =
            Arc::new(SqliteBackend::new(dir.join("atrflow.db"), &SchemaMetadata::default()).unwrap());
        Pipeline::new(
            SessionClock::new(IST_OFFSET_SECONDS, hours()).unwrap(),
            calendar,
            Arc::new(
                InstrumentUniverse::from_instruments(vec![Instrument {
                    token: "1".to_string(),
                    symbol: "A".to_string(),
                    segment: "NSE_EQ".to_string(),
                }])
                .unwrap(),
            ),
            backend,
            FallbackStore::new(dir.join("fallback")).unwrap(),
            CheckpointManager::new(dir.join("checkpoints"), 3).unwrap(),
            PipelineSettings::default(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_calendar_follows_the_year_change() {
        let dir = tempdir().unwrap();
        let holidays = dir.path().join("calendar");
        fs::create_dir_all(&holidays).unwrap();
        let calendar = TradingCalendar::load(&holidays, hours(), [2025, 2026]).unwrap();
        let pipeline = pipeline(dir.path(), calendar);

        fs::write(
            holidays.join("holidays_2027.json"),
            r#"{ "holidays": [{ "date": "2027-01-26", "name": "Republic Day" }] }"#,
        )
        .unwrap();

        // Still 2025: nothing to do
        assert!(!pipeline.refresh_calendar(d(2025, 12, 31)));
        assert!(pipeline.calendar().is_trading_day(d(2027, 1, 26)));

        assert!(pipeline.refresh_calendar(d(2026, 1, 1)));
        assert_eq!(pipeline.calendar().loaded_years(), &[2026, 2027]);
        assert!(!pipeline.calendar().is_trading_day(d(2027, 1, 26)));

        // Loaded once per year
        assert!(!pipeline.refresh_calendar(d(2026, 1, 2)));
    }

    #[test]
    fn test_calendar_built_in_code_is_never_reloaded() {
        let dir = tempdir().unwrap();
        let mut calendar = TradingCalendar::new(hours());
        calendar.add_holiday(d(2026, 1, 26), "Republic Day");
        let pipeline = pipeline(dir.path(), calendar);

        assert!(!pipeline.refresh_calendar(d(2026, 1, 1)));
        assert_eq!(pipeline.calendar().holiday_name(d(2026, 1, 26)), Some("Republic Day"));
    }
}
