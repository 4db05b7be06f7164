//! Local fallback store for batches that exhausted their retries
//!
//! JSON lines, one `FallbackRecord` per line, appended with an fsync so a
//! crash right after a failed write does not lose the batch. Removing
//! records rewrites the file through a temp file and rename; the file is
//! deleted once nothing is pending.

use super::types::WriteBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FALLBACK_FILE_NAME: &str = "unsent_batches.jsonl";

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt fallback record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub batch: WriteBatch,
    pub failed_at: DateTime<Utc>,
    /// Append attempts made so far, including the original retry cycle
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct FallbackStore {
    path: PathBuf,
}

impl FallbackStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, FallbackError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            path: dir.as_ref().join(FALLBACK_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn push(&self, record: &FallbackRecord) -> Result<(), FallbackError> {
        let json = serde_json::to_string(record)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        log::warn!(
            "💾 Saved window {} ({} rows) to fallback store {}",
            record.batch.window_start.format("%Y-%m-%d %H:%M"),
            record.batch.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Pending records, oldest first
    pub fn load(&self) -> Result<Vec<FallbackRecord>, FallbackError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| FallbackError::Corrupt {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn is_empty(&self) -> Result<bool, FallbackError> {
        Ok(self.load()?.is_empty())
    }

    /// Replace the pending set; an empty set removes the file
    pub fn replace(&self, records: &[FallbackRecord]) -> Result<(), FallbackError> {
        if records.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
                log::info!("🧹 Fallback store cleared");
            }
            return Ok(());
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                writeln!(writer, "{}", serde_json::to_string(record)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
