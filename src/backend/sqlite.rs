use super::{AppendReceipt, BackendError, PersistenceBackend};
use crate::pipeline::atr::ATR_PERIOD;
use crate::pipeline::types::{AtrStateRow, MarketTime, SystemEvent, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub const SCHEMA_VERSION: &str = "1.0";

/// Schema files, applied in order. Each uses IF NOT EXISTS so reruns are no-ops.
const SCHEMA_FILES: &[(&str, &str)] = &[
    ("01_market_data.sql", include_str!("../../sql/01_market_data.sql")),
    ("02_atr_state.sql", include_str!("../../sql/02_atr_state.sql")),
    ("03_system_log.sql", include_str!("../../sql/03_system_log.sql")),
    ("04_metadata.sql", include_str!("../../sql/04_metadata.sql")),
];

/// Values seeded into the `metadata` table
#[derive(Debug, Clone)]
pub struct SchemaMetadata {
    pub timezone: String,
    pub instrument_count: usize,
}

impl Default for SchemaMetadata {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            instrument_count: 178,
        }
    }
}

/// Run schema migrations (idempotent)
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), BackendError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("🔧 Running schema migrations");

    for (name, sql) in SCHEMA_FILES {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }

    log::info!("   └─ ✅ {} schema files applied", SCHEMA_FILES.len());
    Ok(())
}

fn seed_metadata(conn: &Connection, metadata: &SchemaMetadata) -> Result<(), BackendError> {
    let entries = [
        ("schema_version", SCHEMA_VERSION.to_string()),
        ("atr_period", ATR_PERIOD.to_string()),
        ("timezone", metadata.timezone.clone()),
        ("instrument_count", metadata.instrument_count.to_string()),
    ];
    for (key, value) in entries {
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
    }
    Ok(())
}

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn new(db_path: impl AsRef<Path>, metadata: &SchemaMetadata) -> Result<Self, BackendError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path.as_ref())?;
        run_schema_migrations(&mut conn)?;
        seed_metadata(&conn, metadata)?;

        log::info!(
            "✅ SQLite database initialized with WAL mode ({})",
            db_path.as_ref().display()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PersistenceBackend for SqliteBackend {
    async fn append_batch(&self, batch: &WriteBatch) -> Result<AppendReceipt, BackendError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut receipt = AppendReceipt::default();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO market_data
                 (id, timestamp, instrument_id, segment, open, high, low, close,
                  true_range, atr, atr_flag, volume, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;

            for candle in &batch.candles {
                let changed = stmt.execute(params![
                    candle.id,
                    candle.window_start.to_rfc3339(),
                    candle.instrument_id,
                    candle.segment,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.true_range,
                    candle.atr,
                    candle.atr_flagged,
                    candle.volume,
                    candle.created_at.to_rfc3339(),
                ])?;
                if changed == 0 {
                    receipt.ignored += 1;
                } else {
                    receipt.inserted += 1;
                }
            }
        }

        tx.commit()?;

        log::debug!(
            "✅ Appended window {} to SQLite ({} new, {} already present)",
            batch.window_start.format("%H:%M"),
            receipt.inserted,
            receipt.ignored
        );
        Ok(receipt)
    }

    async fn sync_atr_state(&self, rows: &[AtrStateRow]) -> Result<(), BackendError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO atr_state (instrument_id, last_close, last_atr, last_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(instrument_id) DO UPDATE SET
                    last_close = excluded.last_close,
                    last_atr = excluded.last_atr,
                    last_timestamp = excluded.last_timestamp,
                    updated_at = excluded.updated_at",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.instrument_id,
                    row.last_close,
                    row.last_atr,
                    row.last_timestamp.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn append_log(&self, events: &[SystemEvent]) -> Result<(), BackendError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO system_log (timestamp, level, event, \"window\", details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.timestamp.to_rfc3339(),
                    event.level.as_str(),
                    event.event,
                    event.window.map(|w| w.to_rfc3339()),
                    event.details,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn last_window(&self) -> Result<Option<MarketTime>, BackendError> {
        let conn = self.lock();
        // Every row carries the same offset, so text order is time order
        let latest: Option<String> =
            conn.query_row("SELECT MAX(timestamp) FROM market_data", [], |row| row.get(0))?;
        Ok(latest.map(|ts| DateTime::parse_from_rfc3339(&ts)).transpose()?)
    }

    async fn load_atr_state(&self) -> Result<Vec<AtrStateRow>, BackendError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT instrument_id, last_close, last_atr, last_timestamp, updated_at
             FROM atr_state ORDER BY instrument_id",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (instrument_id, last_close, last_atr, last_timestamp, updated_at) in raw {
            rows.push(AtrStateRow {
                instrument_id,
                last_close,
                last_atr,
                last_timestamp: DateTime::parse_from_rfc3339(&last_timestamp)?,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
            });
        }
        Ok(rows)
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
