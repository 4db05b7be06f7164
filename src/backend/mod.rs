//! Persistence backend boundary
//!
//! The writer's contract is "attempt append"; the backend's contract is
//! "one atomic append per call, ignore ids it already holds, never update or
//! delete a market_data row".

pub mod sqlite;

use crate::pipeline::types::{AtrStateRow, MarketTime, SystemEvent, WriteBatch};
use async_trait::async_trait;
use thiserror::Error;

pub use sqlite::{SchemaMetadata, SqliteBackend};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("partial write: {inserted} inserted + {ignored} ignored != {expected} rows")]
    PartialWrite {
        expected: usize,
        inserted: usize,
        ignored: usize,
    },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// What an append did with the rows it was given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendReceipt {
    pub inserted: usize,
    /// Rows whose id was already present
    pub ignored: usize,
}

impl AppendReceipt {
    pub fn total(&self) -> usize {
        self.inserted + self.ignored
    }
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Append one window's candles atomically
    async fn append_batch(&self, batch: &WriteBatch) -> Result<AppendReceipt, BackendError>;

    /// Overwrite the one-row-per-instrument ATR state table
    async fn sync_atr_state(&self, rows: &[AtrStateRow]) -> Result<(), BackendError>;

    /// Append rows to the system log
    async fn append_log(&self, events: &[SystemEvent]) -> Result<(), BackendError>;

    /// Latest window start present in market_data
    async fn last_window(&self) -> Result<Option<MarketTime>, BackendError>;

    /// Current contents of the ATR state table
    async fn load_atr_state(&self) -> Result<Vec<AtrStateRow>, BackendError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}
