//! Batch Writer - drains the Write Queue into the persistence backend
//!
//! The only context allowed to sleep through multi-second backoff. It owns
//! the backend handle and the fallback store and shares no lock with the
//! feed or the scheduler.
//!
//! Per write cycle (one queued batch):
//! 1. Re-append pending fallback records, oldest first, one attempt each
//! 2. Append the new batch, up to 5 attempts with 1/2/4/8s backoff between them
//! 3. On exhaustion serialize the batch to the fallback store and move on

use super::fallback::{FallbackRecord, FallbackStore};
use super::types::{AtrStateRow, EventLevel, SystemEvent, WriteBatch};
use super::write_queue::{WriteItem, WriteQueueReceiver};
use crate::backend::{AppendReceipt, BackendError, PersistenceBackend};
use crate::backoff::ExponentialBackoff;
use crate::shutdown::{wait_for_shutdown, ShutdownSignal};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backend calls per batch, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// One wait between each pair of attempts, none after the last
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay, self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches_written: u64,
    pub batches_to_fallback: u64,
    pub fallback_recovered: u64,
    pub rows_inserted: u64,
    pub rows_ignored: u64,
    pub atr_syncs: u64,
    pub events_written: u64,
    pub events_dropped: u64,
}

pub struct BatchWriter {
    backend: Arc<dyn PersistenceBackend>,
    fallback: FallbackStore,
    policy: RetryPolicy,
    stats: WriterStats,
}

impl BatchWriter {
    pub fn new(backend: Arc<dyn PersistenceBackend>, fallback: FallbackStore, policy: RetryPolicy) -> Self {
        Self {
            backend,
            fallback,
            policy,
            stats: WriterStats::default(),
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Consume the queue until it is closed and drained.
    ///
    /// When `shutdown` fires the queue stops accepting new items; everything
    /// already queued is still written (or sent to fallback) before returning.
    pub async fn run(mut self, mut rx: WriteQueueReceiver, mut shutdown: ShutdownSignal) -> WriterStats {
        log::info!("🚀 Starting batch writer ({} backend)", self.backend.backend_type());
        log::info!(
            "   └─ Retry policy: {} attempts, {:?} base delay",
            self.policy.max_attempts,
            self.policy.base_delay
        );

        let mut closing = false;
        loop {
            let item = if closing {
                rx.recv().await
            } else {
                tokio::select! {
                    item = rx.recv() => item,
                    _ = wait_for_shutdown(&mut shutdown) => {
                        log::info!("🔄 Writer draining {} queued batches...", rx.batch_depth());
                        rx.close();
                        closing = true;
                        continue;
                    }
                }
            };

            let Some(item) = item else { break };
            match item {
                WriteItem::Batch(batch) => {
                    self.retry_fallback().await;
                    self.write_batch(batch).await;
                    rx.settle_batch();
                }
                WriteItem::AtrState(rows) => self.sync_atr_state(&rows).await,
                WriteItem::Event(event) => self.write_event(event).await,
            }
        }

        // Final chance for anything still parked locally
        self.retry_fallback().await;

        log::info!(
            "✅ Batch writer stopped: {} batches written, {} to fallback, {} recovered",
            self.stats.batches_written,
            self.stats.batches_to_fallback,
            self.stats.fallback_recovered
        );
        self.stats
    }

    async fn append_once(&self, batch: &WriteBatch) -> Result<AppendReceipt, BackendError> {
        let receipt = self.backend.append_batch(batch).await?;
        if receipt.total() != batch.len() {
            return Err(BackendError::PartialWrite {
                expected: batch.len(),
                inserted: receipt.inserted,
                ignored: receipt.ignored,
            });
        }
        Ok(receipt)
    }

    fn record_receipt(&mut self, receipt: AppendReceipt) {
        self.stats.rows_inserted += receipt.inserted as u64;
        self.stats.rows_ignored += receipt.ignored as u64;
    }

    /// Append with retry; returns false when the batch went to fallback
    pub async fn write_batch(&mut self, batch: WriteBatch) -> bool {
        if batch.is_empty() {
            log::warn!(
                "⚠️  Window {} produced no candles, nothing to append",
                batch.window_start.format("%H:%M")
            );
            return true;
        }

        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.append_once(&batch).await {
                Ok(receipt) => {
                    self.record_receipt(receipt);
                    self.stats.batches_written += 1;
                    log::info!(
                        "✅ Window {} persisted: {} rows ({} duplicates ignored, attempt {})",
                        batch.window_start.format("%H:%M"),
                        receipt.inserted,
                        receipt.ignored,
                        attempts
                    );
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  Append failed for window {} (attempt {}): {}",
                        batch.window_start.format("%H:%M"),
                        attempts,
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        break;
                    }
                }
            }
        }

        let window = batch.window_start;
        let rows = batch.len();
        let record = FallbackRecord {
            batch,
            failed_at: Utc::now(),
            attempts,
        };

        let event = match self.fallback.push(&record) {
            Ok(()) => {
                self.stats.batches_to_fallback += 1;
                SystemEvent::new(
                    EventLevel::Error,
                    "WRITE_FALLBACK",
                    format!("{} rows saved locally after {} attempts", rows, attempts),
                )
            }
            Err(e) => SystemEvent::new(
                EventLevel::Critical,
                "WRITE_LOST",
                format!("{} rows could not be saved to fallback: {}", rows, e),
            ),
        };
        self.write_event(event.with_window(window)).await;
        false
    }

    /// One attempt per pending record, oldest first. The first failure ends
    /// the pass so the remaining records keep their order.
    pub async fn retry_fallback(&mut self) -> usize {
        let records = match self.fallback.load() {
            Ok(records) => records,
            Err(e) => {
                log::error!("❌ Cannot read fallback store {}: {}", self.fallback.path().display(), e);
                return 0;
            }
        };
        if records.is_empty() {
            return 0;
        }

        log::info!("♻️  Retrying {} fallback batches", records.len());
        let mut remaining = Vec::new();
        let mut recovered = 0;
        let mut blocked = false;

        for mut record in records {
            if blocked {
                remaining.push(record);
                continue;
            }
            match self.append_once(&record.batch).await {
                Ok(receipt) => {
                    self.record_receipt(receipt);
                    recovered += 1;
                    log::info!(
                        "✅ Recovered window {} from fallback ({} new, {} already present)",
                        record.batch.window_start.format("%Y-%m-%d %H:%M"),
                        receipt.inserted,
                        receipt.ignored
                    );
                }
                Err(e) => {
                    log::warn!("⚠️  Fallback retry still failing: {}", e);
                    record.attempts += 1;
                    blocked = true;
                    remaining.push(record);
                }
            }
        }

        if let Err(e) = self.fallback.replace(&remaining) {
            log::error!("❌ Failed to update fallback store: {}", e);
        }
        self.stats.fallback_recovered += recovered as u64;
        recovered
    }

    async fn sync_atr_state(&mut self, rows: &[AtrStateRow]) {
        match self.backend.sync_atr_state(rows).await {
            Ok(()) => self.stats.atr_syncs += 1,
            // The next window's snapshot supersedes this one
            Err(e) => log::warn!("⚠️  ATR state sync failed ({} rows): {}", rows.len(), e),
        }
    }

    async fn write_event(&mut self, event: SystemEvent) {
        match self.backend.append_log(std::slice::from_ref(&event)).await {
            Ok(()) => self.stats.events_written += 1,
            Err(e) => {
                self.stats.events_dropped += 1;
                log::debug!("System log write failed for {}: {}", event.event, e);
            }
        }
    }
}
