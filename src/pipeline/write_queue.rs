//! Write Queue - ordered hand-off from the aggregator to the Batch Writer
//!
//! Unbounded: enqueueing never blocks the scheduler. A backlog deeper than
//! the alert depth (in batches) is reported once per episode, and nothing
//! is ever dropped.

use super::types::{AtrStateRow, EventLevel, SystemEvent, WriteBatch};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteItem {
    Batch(WriteBatch),
    AtrState(Vec<AtrStateRow>),
    Event(SystemEvent),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("write queue is closed")]
pub struct QueueClosed;

#[derive(Debug)]
struct QueueCounters {
    batches: AtomicUsize,
    /// Enqueued batches the writer has not yet appended or parked in fallback
    unsettled: AtomicUsize,
    alerting: AtomicBool,
}

/// Read-only view of how far the writer has caught up
#[derive(Debug, Clone)]
pub struct WriteProgress {
    counters: Arc<QueueCounters>,
}

impl WriteProgress {
    pub fn unsettled_batches(&self) -> usize {
        self.counters.unsettled.load(Ordering::SeqCst)
    }

    /// Every batch handed to the queue is either in the backend or in the
    /// fallback store
    pub fn is_settled(&self) -> bool {
        self.unsettled_batches() == 0
    }
}

/// Producer handle; cheap to clone
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteItem>,
    counters: Arc<QueueCounters>,
    alert_depth: usize,
}

pub struct WriteQueueReceiver {
    rx: mpsc::UnboundedReceiver<WriteItem>,
    counters: Arc<QueueCounters>,
}

pub fn write_queue(alert_depth: usize) -> (WriteQueue, WriteQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(QueueCounters {
        batches: AtomicUsize::new(0),
        unsettled: AtomicUsize::new(0),
        alerting: AtomicBool::new(false),
    });
    (
        WriteQueue {
            tx,
            counters: counters.clone(),
            alert_depth: alert_depth.max(1),
        },
        WriteQueueReceiver { rx, counters },
    )
}

impl WriteQueue {
    pub fn push_batch(&self, batch: WriteBatch) -> Result<(), QueueClosed> {
        // Count before sending so the receiver never decrements past zero
        let depth = self.counters.batches.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.unsettled.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(WriteItem::Batch(batch)).is_err() {
            self.counters.batches.fetch_sub(1, Ordering::SeqCst);
            self.counters.unsettled.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueClosed);
        }

        if depth > self.alert_depth && !self.counters.alerting.swap(true, Ordering::SeqCst) {
            self.alert(SystemEvent::new(
                EventLevel::Warning,
                "WRITE_QUEUE_BACKLOG",
                format!("{} batches waiting (alert depth {})", depth, self.alert_depth),
            ));
        }
        Ok(())
    }

    pub fn push_atr_state(&self, rows: Vec<AtrStateRow>) -> Result<(), QueueClosed> {
        self.tx.send(WriteItem::AtrState(rows)).map_err(|_| QueueClosed)
    }

    pub fn push_event(&self, event: SystemEvent) -> Result<(), QueueClosed> {
        self.tx.send(WriteItem::Event(event)).map_err(|_| QueueClosed)
    }

    /// Log the event and queue it for the `system_log` table
    pub fn alert(&self, event: SystemEvent) {
        event.log();
        if self.push_event(event).is_err() {
            log::debug!("Write queue closed, alert kept in application log only");
        }
    }

    /// Batches enqueued but not yet taken by the writer
    pub fn batch_depth(&self) -> usize {
        self.counters.batches.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> WriteProgress {
        WriteProgress {
            counters: self.counters.clone(),
        }
    }
}

impl WriteQueueReceiver {
    pub async fn recv(&mut self) -> Option<WriteItem> {
        let item = self.rx.recv().await?;
        if matches!(item, WriteItem::Batch(_)) {
            let depth = self.counters.batches.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            if depth == 0 && self.counters.alerting.swap(false, Ordering::SeqCst) {
                log::info!("✅ Write queue backlog cleared");
            }
        }
        Some(item)
    }

    /// Stop accepting new items; buffered items are still delivered
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn batch_depth(&self) -> usize {
        self.counters.batches.load(Ordering::SeqCst)
    }

    /// Called by the writer once a received batch is appended or parked
    pub fn settle_batch(&self) {
        let _ = self
            .counters
            .unsettled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn batch(minute: u32) -> WriteBatch {
        WriteBatch {
            window_start: FixedOffset::east_opt(19_800)
                .unwrap()
                .with_ymd_and_hms(2024, 3, 15, 9, minute, 0)
                .unwrap(),
            candles: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_preserves_enqueue_order() {
        let (queue, mut rx) = write_queue(12);
        for minute in [15, 20, 25] {
            queue.push_batch(batch(minute)).unwrap();
        }
        queue.push_atr_state(Vec::new()).unwrap();
        drop(queue);

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                WriteItem::Batch(b) => seen.push(b.window_start.format("%H:%M").to_string()),
                WriteItem::AtrState(_) => seen.push("atr".to_string()),
                WriteItem::Event(_) => {}
            }
        }
        assert_eq!(seen, vec!["09:15", "09:20", "09:25", "atr"]);
    }

    #[tokio::test]
    async fn test_backlog_alert_fires_once() {
        let (queue, mut rx) = write_queue(2);
        for minute in [15, 20, 25, 30] {
            queue.push_batch(batch(minute)).unwrap();
        }
        assert_eq!(queue.batch_depth(), 4);
        drop(queue);

        let mut batches = 0;
        let mut alerts = 0;
        while let Some(item) = rx.recv().await {
            match item {
                WriteItem::Batch(_) => batches += 1,
                WriteItem::Event(e) => {
                    assert_eq!(e.event, "WRITE_QUEUE_BACKLOG");
                    alerts += 1;
                }
                WriteItem::AtrState(_) => {}
            }
        }
        assert_eq!(batches, 4, "backlog never drops batches");
        assert_eq!(alerts, 1);
        assert_eq!(rx.batch_depth(), 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_drains_then_rejects() {
        let (queue, mut rx) = write_queue(12);
        queue.push_batch(batch(15)).unwrap();
        rx.close();

        assert_eq!(queue.push_batch(batch(20)), Err(QueueClosed));
        assert!(matches!(rx.recv().await, Some(WriteItem::Batch(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_batches_stay_unsettled_until_the_writer_finishes() {
        let (queue, mut rx) = write_queue(12);
        let progress = queue.progress();
        assert!(progress.is_settled());

        queue.push_batch(batch(15)).unwrap();
        queue.push_batch(batch(20)).unwrap();
        assert!(matches!(rx.recv().await, Some(WriteItem::Batch(_))));
        // Taken off the queue is not the same as written
        assert_eq!(queue.batch_depth(), 1);
        assert_eq!(progress.unsettled_batches(), 2);

        rx.settle_batch();
        rx.recv().await.unwrap();
        rx.settle_batch();
        assert!(progress.is_settled());

        rx.settle_batch();
        assert_eq!(progress.unsettled_batches(), 0);
    }
}
