//! Checkpoint Manager - crash-safe snapshots of ATR state and window progress
//!
//! `checkpoint.json` is replaced atomically (temp file, fsync, rename).
//! The previous snapshots are kept as `checkpoint.1.json`, `checkpoint.2.json`
//! for manual recovery. Startup restores ATR state directly from the
//! snapshot; history is never recomputed.
//!
//! Each snapshot records whether every batch up to it had reached the
//! backend or the fallback store. At startup the snapshot is reconciled
//! against what the backend actually holds.

use super::aggregator::PipelineState;
use super::atr::{AtrEngine, AtrError, AtrState};
use super::types::{EventLevel, MarketTime, SystemEvent};
use super::write_queue::WriteProgress;
use crate::backend::{BackendError, PersistenceBackend};
use crate::shutdown::{wait_for_shutdown, ShutdownSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::interval;

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub last_processed_window: Option<MarketTime>,
    pub atr_states: BTreeMap<String, AtrState>,
    pub saved_at: DateTime<Utc>,
    /// No batch up to `last_processed_window` was still waiting for the writer
    #[serde(default = "confirmed_by_default")]
    pub write_confirmed: bool,
}

fn confirmed_by_default() -> bool {
    true
}

impl Checkpoint {
    pub fn capture(state: &PipelineState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            write_confirmed: true,
            last_processed_window: state.last_processed_window,
            atr_states: state
                .atr
                .snapshot()
                .into_iter()
                .map(|s| (s.instrument_id.clone(), s))
                .collect(),
            saved_at: Utc::now(),
        }
    }

    pub fn with_write_confirmed(mut self, confirmed: bool) -> Self {
        self.write_confirmed = confirmed;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        for (key, state) in &self.atr_states {
            if *key != state.instrument_id {
                return Err(format!("entry {} holds state for {}", key, state.instrument_id));
            }
        }
        Ok(())
    }

    pub fn into_state(self) -> Result<PipelineState, AtrError> {
        Ok(PipelineState {
            atr: AtrEngine::from_states(self.atr_states.into_values())?,
            last_processed_window: self.last_processed_window,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_files: usize,
}

impl CheckpointManager {
    /// `max_files` counts the live checkpoint plus its rotated copies
    pub fn new(dir: impl AsRef<Path>, max_files: usize) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            max_files: max_files.max(1),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE_NAME)
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("checkpoint.{}.json", n))
    }

    /// Rotated copies that currently exist, newest first
    pub fn backups(&self) -> Vec<PathBuf> {
        (1..self.max_files)
            .map(|n| self.backup_path(n))
            .filter(|p| p.exists())
            .collect()
    }

    fn rotate(&self) -> Result<(), CheckpointError> {
        let primary = self.path();
        let keep = self.max_files - 1;
        if keep == 0 || !primary.exists() {
            return Ok(());
        }
        for n in (1..keep).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        // Copy, not rename: the live checkpoint must exist at every instant
        fs::copy(&primary, self.backup_path(1))?;
        Ok(())
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp_path = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE_NAME));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        self.rotate()?;
        fs::rename(&tmp_path, self.path())?;

        log::debug!(
            "💾 Checkpoint saved: {} instruments, last window {}, confirmed {}",
            checkpoint.atr_states.len(),
            format_window(checkpoint.last_processed_window),
            checkpoint.write_confirmed
        );
        Ok(())
    }

    /// `Ok(None)` when no checkpoint was ever written
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path();
        if !path.exists() {
            log::info!("No existing checkpoint found: {}", path.display());
            return Ok(None);
        }

        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.clone(),
            reason,
        };
        let raw = fs::read_to_string(&path).map_err(|e| corrupt(e.to_string()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;
        checkpoint.validate().map_err(corrupt)?;

        log::info!(
            "📂 Loaded checkpoint from {} ({} instruments, saved {})",
            path.display(),
            checkpoint.atr_states.len(),
            checkpoint.saved_at.to_rfc3339()
        );
        Ok(Some(checkpoint))
    }

    /// Move an unreadable checkpoint out of the way
    pub fn quarantine(&self) -> Result<Option<PathBuf>, CheckpointError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let target = self.dir.join(format!(
            "checkpoint.corrupt.{}.json",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        fs::rename(&path, &target)?;
        Ok(Some(target))
    }
}

fn format_window(window: Option<MarketTime>) -> String {
    window
        .map(|w| w.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// What startup recovered from disk
#[derive(Debug, Clone, Default)]
pub struct RestoredState {
    pub state: PipelineState,
    /// Taken from the checkpoint; true on a cold start
    pub write_confirmed: bool,
}

/// Restore pipeline state at startup.
///
/// An unreadable or invalid checkpoint is fatal unless `fresh_start` is set,
/// in which case it is quarantined and the engine starts cold.
pub fn restore_pipeline_state(
    manager: &CheckpointManager,
    fresh_start: bool,
) -> Result<RestoredState, CheckpointError> {
    let loaded = manager.load().and_then(|checkpoint| match checkpoint {
        Some(checkpoint) => {
            let write_confirmed = checkpoint.write_confirmed;
            checkpoint
                .into_state()
                .map(|state| Some(RestoredState { state, write_confirmed }))
                .map_err(|e| CheckpointError::Corrupt {
                    path: manager.path(),
                    reason: e.to_string(),
                })
        }
        None => Ok(None),
    });

    let cold = RestoredState {
        state: PipelineState::default(),
        write_confirmed: true,
    };
    match loaded {
        Ok(Some(restored)) => {
            let summary = restored.state.atr.summary();
            log::info!("✅ ATR state restored from checkpoint");
            log::info!("   ├─ Instruments: {} ({} warm, {} warming)", summary.instruments, summary.warm, summary.warming);
            log::info!("   ├─ Writes confirmed: {}", restored.write_confirmed);
            log::info!(
                "   └─ Last processed window: {}",
                format_window(restored.state.last_processed_window)
            );
            Ok(restored)
        }
        Ok(None) => {
            log::info!("🆕 No checkpoint, ATR engine starts cold (14-window warmup)");
            Ok(cold)
        }
        Err(e) if fresh_start => {
            log::warn!("⚠️  {}", e);
            if let Some(moved) = manager.quarantine()? {
                log::warn!("   └─ Fresh start requested, moved aside to {}", moved.display());
            }
            Ok(cold)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    /// Neither side holds any state
    Fresh,
    /// Backend is empty; the checkpoint is used as is
    CheckpointOnly,
    /// Both sides agree on the last window
    Consistent,
    /// The checkpoint got past the last persisted window
    CheckpointAhead,
    /// The backend persisted windows the checkpoint never saw
    BackendAhead,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub source: ReconcileSource,
    pub checkpoint_window: Option<MarketTime>,
    pub backend_window: Option<MarketTime>,
    /// Instruments whose state was taken from the backend's atr_state table
    pub adopted: Vec<String>,
    /// Instruments where both sides cover the same window but disagree
    pub divergent: Vec<String>,
    pub event: Option<SystemEvent>,
}

fn values_differ(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() > 1e-9,
        (None, None) => false,
        _ => true,
    }
}

/// Cross-check restored state against the backend and keep whichever side
/// is further along.
///
/// Per instrument, an `atr_state` row newer than the restored state replaces
/// it. The last processed window becomes the later of the two. A checkpoint
/// ahead of the backend is kept but reported, since the windows in between
/// were either empty, parked in fallback or lost with the process.
pub async fn reconcile_with_backend(
    restored: &mut RestoredState,
    backend: &dyn PersistenceBackend,
) -> Result<Reconciliation, BackendError> {
    let backend_window = backend.last_window().await?;
    let rows = backend.load_atr_state().await?;
    let state = &mut restored.state;
    let checkpoint_window = state.last_processed_window;

    let mut adopted = Vec::new();
    let mut divergent = Vec::new();
    for row in &rows {
        let local = state.atr.state(&row.instrument_id);
        match local.and_then(|s| s.last_window) {
            Some(last) if last > row.last_timestamp => {}
            Some(last) if last == row.last_timestamp => {
                if let Some(local) = local {
                    if values_differ(local.prev_close, Some(row.last_close))
                        || values_differ(local.prev_atr, row.last_atr)
                    {
                        divergent.push(row.instrument_id.clone());
                    }
                }
            }
            _ => {
                let candidate = AtrState::from_row(row);
                match state.atr.restore(candidate) {
                    Ok(()) => adopted.push(row.instrument_id.clone()),
                    Err(e) => log::warn!("⚠️  Ignoring stored ATR state for {}: {}", row.instrument_id, e),
                }
            }
        }
    }

    let source = match (checkpoint_window, backend_window) {
        (None, None) if adopted.is_empty() => ReconcileSource::Fresh,
        (_, None) => ReconcileSource::CheckpointOnly,
        (Some(local), Some(remote)) if local == remote => ReconcileSource::Consistent,
        (Some(local), Some(remote)) if local > remote => ReconcileSource::CheckpointAhead,
        _ => ReconcileSource::BackendAhead,
    };
    if source == ReconcileSource::BackendAhead {
        state.last_processed_window = backend_window;
    }

    let details = format!(
        "checkpoint={} backend={} write_confirmed={} adopted={} divergent={}",
        format_window(checkpoint_window),
        format_window(backend_window),
        restored.write_confirmed,
        adopted.len(),
        divergent.len()
    );
    let event = match source {
        ReconcileSource::Fresh | ReconcileSource::CheckpointOnly => None,
        ReconcileSource::Consistent if divergent.is_empty() && adopted.is_empty() => {
            Some(SystemEvent::new(EventLevel::Info, "RECONCILIATION_CONSISTENT", details))
        }
        ReconcileSource::Consistent => {
            Some(SystemEvent::new(EventLevel::Warning, "RECONCILIATION_CONSISTENT", details))
        }
        ReconcileSource::CheckpointAhead => {
            let level = if restored.write_confirmed {
                EventLevel::Warning
            } else {
                EventLevel::Error
            };
            Some(SystemEvent::new(level, "RECONCILIATION_CHECKPOINT_AHEAD", details))
        }
        ReconcileSource::BackendAhead => {
            Some(SystemEvent::new(EventLevel::Warning, "RECONCILIATION_BACKEND_AHEAD", details))
        }
    };

    log::info!("🔍 Startup reconciliation: {:?}", source);
    log::info!("   ├─ Checkpoint window: {}", format_window(checkpoint_window));
    log::info!("   ├─ Backend window: {}", format_window(backend_window));
    log::info!("   └─ Adopted from backend: {}, divergent: {}", adopted.len(), divergent.len());

    Ok(Reconciliation {
        source,
        checkpoint_window,
        backend_window,
        adopted,
        divergent,
        event,
    })
}

/// Background task that snapshots pipeline state on a fixed interval
pub async fn checkpoint_task(
    manager: Arc<CheckpointManager>,
    state: Arc<Mutex<PipelineState>>,
    progress: WriteProgress,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut timer = interval(every);
    // First tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                // Batches are queued under the state lock, so progress read
                // here covers exactly the windows the snapshot records
                let checkpoint = {
                    let guard = state.lock().unwrap_or_else(|p| p.into_inner());
                    Checkpoint::capture(&guard).with_write_confirmed(progress.is_settled())
                };
                if let Err(e) = manager.save(&checkpoint) {
                    log::warn!("Failed to save checkpoint: {}", e);
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}
