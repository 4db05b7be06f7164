//! Pipeline Runtime - live 5-minute candle and ATR capture
//!
//! - Loads the instrument universe and trading calendar
//! - Opens the SQLite backend (schema applied on open)
//! - Restores ATR state from the latest checkpoint
//! - Runs one session per trading day until CTRL+C
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime [-- --fresh-start]
//!
//! Environment variables (see `RuntimeConfig`):
//!   FEED_URL, FEED_ACCESS_TOKEN - required
//!   ATRFLOW_DB_PATH - SQLite database path (default: data/atrflow.db)
//!   CHECKPOINT_DIR, FALLBACK_DIR, CALENDAR_DIR, INSTRUMENTS_PATH
//!   FRESH_START - quarantine an unreadable checkpoint instead of exiting

use atrflow::backend::{PersistenceBackend, SchemaMetadata, SqliteBackend};
use atrflow::config::RuntimeConfig;
use atrflow::feed::{FeedClientConfig, FeedTransport, StaticTokenAuthenticator, WsTransport};
use atrflow::instruments::InstrumentUniverse;
use atrflow::pipeline::{
    CheckpointManager, FallbackStore, FeedSource, Pipeline, PipelineSettings, SessionClock, TradingCalendar,
};
use atrflow::shutdown::shutdown_channel;
use chrono::{Datelike, Utc};
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: rustls needs an explicit provider when several are compiled in
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    info!("🚀 Pipeline Runtime - 5-minute candles with 14-period ATR");

    let config = RuntimeConfig::from_env()?;
    config.log_summary();
    let (feed_url, feed_token) = config.require_feed()?;

    let universe = Arc::new(InstrumentUniverse::load(
        &config.instruments_path,
        config.expected_instruments,
    )?);

    let clock = SessionClock::new(config.utc_offset_seconds(), config.session_hours)?;
    let this_year = clock.local_date(Utc::now()).year();
    let calendar = TradingCalendar::load(&config.calendar_dir, config.session_hours, [this_year, this_year + 1])?;

    info!("🔧 Initializing database...");
    let backend: Arc<dyn PersistenceBackend> = Arc::new(SqliteBackend::new(
        &config.db_path,
        &SchemaMetadata {
            instrument_count: universe.len(),
            ..SchemaMetadata::default()
        },
    )?);
    info!("✅ Database initialized ({})", backend.backend_type());

    let fallback = FallbackStore::new(&config.fallback_dir)?;
    let checkpoints = CheckpointManager::new(&config.checkpoint_dir, config.max_checkpoint_files)?;

    let pipeline = Pipeline::new(
        clock,
        calendar,
        universe,
        backend,
        fallback,
        checkpoints,
        PipelineSettings::from_config(&config),
        config.fresh_start,
    )?
    .with_feed(FeedSource {
        authenticator: Arc::new(StaticTokenAuthenticator::new(feed_token)),
        transport: Arc::new(move |universe: Arc<InstrumentUniverse>| {
            Box::new(WsTransport::new(feed_url.clone(), universe)) as Box<dyn FeedTransport>
        }),
        config: FeedClientConfig {
            silence_timeout: Duration::from_secs(config.feed_silence_timeout_secs),
            subscribe_batch_size: config.feed_subscribe_batch_size,
            ..FeedClientConfig::default()
        },
    });

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("");
                info!("⚠️  Received CTRL+C, shutting down...");
            }
            Err(err) => {
                error!("❌ Failed to listen for CTRL+C: {}", err);
            }
        }
        let _ = shutdown_tx.send(true);
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");
    pipeline.run(shutdown_rx).await?;

    info!("✅ Pipeline runtime stopped");
    Ok(())
}
