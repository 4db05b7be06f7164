//! Tick ingestion - drains the feed's channel into the Tick Buffer
//!
//! Runs until every sender is dropped. The buffer lock is taken per tick,
//! only for the map update.

use super::tick_buffer::{RecordOutcome, TickBuffer};
use super::types::Tick;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub received: u64,
    pub accepted: u64,
    pub late: u64,
    pub outside_session: u64,
    pub rejected: u64,
}

impl IngestionStats {
    fn record(&mut self, outcome: RecordOutcome) {
        self.received += 1;
        match outcome {
            RecordOutcome::Created | RecordOutcome::Updated => self.accepted += 1,
            RecordOutcome::Late => self.late += 1,
            RecordOutcome::OutsideSession => self.outside_session += 1,
            RecordOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Consume ticks until the channel closes
///
/// Arguments:
/// - `rx`: Receiver end of the tick channel
/// - `tick_buffer`: Buffer shared with the aggregator
/// - `channel_capacity`: Capacity the channel was created with, for usage logging
pub async fn start_tick_ingestion(
    mut rx: mpsc::Receiver<Tick>,
    tick_buffer: Arc<TickBuffer>,
    channel_capacity: usize,
) -> IngestionStats {
    log::info!("🚀 Starting tick ingestion");
    log::info!("   └─ Channel capacity: {}", channel_capacity);

    let mut report_timer = interval(REPORT_INTERVAL);
    report_timer.tick().await;
    let mut stats = IngestionStats::default();
    let mut since_report = 0u64;
    let mut last_report = tokio::time::Instant::now();

    loop {
        tokio::select! {
            tick = rx.recv() => {
                let Some(tick) = tick else { break };
                stats.record(tick_buffer.record(&tick));
                since_report += 1;
            }

            _ = report_timer.tick() => {
                let elapsed = last_report.elapsed().as_secs_f64().max(1.0);
                let channel_usage = rx.len();
                log::info!(
                    "📊 Ingestion rate: {:.1} ticks/sec | channel: {}/{} | late: {} | rejected: {}",
                    since_report as f64 / elapsed,
                    channel_usage,
                    channel_capacity,
                    stats.late,
                    stats.rejected
                );

                // Warn if channel is filling up (> 50% capacity)
                if channel_usage > channel_capacity / 2 {
                    log::warn!(
                        "⚠️  Channel usage high: {}/{} ({}%)",
                        channel_usage,
                        channel_capacity,
                        channel_usage * 100 / channel_capacity.max(1)
                    );
                }
                since_report = 0;
                last_report = tokio::time::Instant::now();
            }
        }
    }

    log::info!("🛑 Tick ingestion stopped");
    log::info!("   ├─ Received: {}", stats.received);
    log::info!("   ├─ Accepted: {}", stats.accepted);
    log::info!(
        "   └─ Late: {}, outside session: {}, rejected: {}",
        stats.late,
        stats.outside_session,
        stats.rejected
    );
    stats
}
