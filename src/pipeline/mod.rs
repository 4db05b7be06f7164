//! # 5-Minute Candle & ATR Pipeline
//!
//! Streams ticks for a fixed instrument universe, closes IST-aligned
//! 5-minute candles, computes a 14-period ATR per instrument and appends
//! each window's candles to the backend in one call.
//!
//! ## Data flow
//!
//! 1. Feed client forwards ticks into a bounded channel
//! 2. Ingestion records each tick in the Tick Buffer (window keyed by
//!    exchange timestamp)
//! 3. The scheduler wakes at every boundary; the aggregator finalizes the
//!    window, validates OHLC and runs the ATR pass
//! 4. The batch goes onto the Write Queue; the Batch Writer appends it with
//!    retries, falling back to a local store
//! 5. Checkpoints snapshot ATR state so a restart resumes without
//!    recomputing history
//!
//! ## Module Organization
//!
//! - `types` - Tick, PartialWindow, Candle, WriteBatch, SystemEvent
//! - `clock` / `calendar` - window boundaries and trading days
//! - `tick_buffer` - in-progress candles
//! - `atr` - True Range and Wilder smoothing
//! - `aggregator` - window finalization
//! - `write_queue` / `batch_writer` / `fallback` - delivery to the backend
//! - `checkpoint` - crash-safe state snapshots
//! - `ingestion` / `scheduler` / `runtime` - tasks and their wiring

pub mod aggregator;
pub mod atr;
pub mod batch_writer;
pub mod calendar;
pub mod checkpoint;
pub mod clock;
pub mod fallback;
pub mod ingestion;
pub mod runtime;
pub mod scheduler;
pub mod tick_buffer;
pub mod types;
pub mod write_queue;

// Re-export commonly used types
pub use aggregator::{CandleAggregator, PipelineState, WindowReport};
pub use atr::{AtrEngine, AtrError, AtrState};
pub use batch_writer::{BatchWriter, RetryPolicy, WriterStats};
pub use calendar::TradingCalendar;
pub use checkpoint::{Checkpoint, CheckpointManager, ReconcileSource, Reconciliation};
pub use clock::{SessionClock, SessionHours};
pub use fallback::FallbackStore;
pub use runtime::{FeedSource, Pipeline, PipelineSettings, SessionReport};
pub use scheduler::{SessionOutcome, SessionScheduler};
pub use tick_buffer::TickBuffer;
pub use types::{Candle, MarketTime, SystemEvent, Tick, WriteBatch};
pub use write_queue::{write_queue, WriteProgress, WriteQueue};
