//! Reconnecting feed client
//!
//! Ticks are forwarded with `try_send`: a full ingestion channel drops the
//! tick (counted) instead of stalling the transport read loop. The silence
//! watchdog is armed by the first tick of the session, so a quiet feed
//! before the open does not cause reconnect churn.

use super::auth::SessionAuthenticator;
use super::{FeedError, FeedEvent, FeedState, FeedTransport};
use crate::backoff::ExponentialBackoff;
use crate::instruments::InstrumentUniverse;
use crate::pipeline::types::{EventLevel, SystemEvent, Tick};
use crate::pipeline::write_queue::WriteQueue;
use crate::shutdown::{is_shutdown, wait_for_shutdown, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub silence_timeout: Duration,
    pub subscribe_batch_size: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Consecutive failed attempts before alerts escalate to CRITICAL
    pub critical_after: u32,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(30),
            subscribe_batch_size: 50,
            reconnect_base: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            critical_after: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub ticks_forwarded: u64,
    pub ticks_dropped: u64,
    pub connects: u64,
    pub failed_attempts: u64,
    pub transport_errors: u64,
}

enum StreamEnd {
    Shutdown,
    Silence,
    Closed,
}

pub struct FeedClient {
    transport: Box<dyn FeedTransport>,
    authenticator: Arc<dyn SessionAuthenticator>,
    universe: Arc<InstrumentUniverse>,
    tick_tx: mpsc::Sender<Tick>,
    queue: WriteQueue,
    config: FeedClientConfig,
    state_tx: watch::Sender<FeedState>,
    stats: FeedStats,
    /// Set by the first tick of the session; arms the silence watchdog
    streaming_seen: bool,
}

impl FeedClient {
    pub fn new(
        transport: Box<dyn FeedTransport>,
        authenticator: Arc<dyn SessionAuthenticator>,
        universe: Arc<InstrumentUniverse>,
        tick_tx: mpsc::Sender<Tick>,
        queue: WriteQueue,
        config: FeedClientConfig,
    ) -> (Self, watch::Receiver<FeedState>) {
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        (
            Self {
                transport,
                authenticator,
                universe,
                tick_tx,
                queue,
                config,
                state_tx,
                stats: FeedStats::default(),
                streaming_seen: false,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: FeedState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Feed state: {:?} → {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Authenticate, connect and subscribe the whole universe in batches
    async fn establish(&mut self) -> Result<(), FeedError> {
        let session = self.authenticator.establish().await?;
        self.transport.connect(&session).await?;

        let batch_size = self.config.subscribe_batch_size.max(1);
        let mut batches = 0;
        for chunk in self.universe.instruments().chunks(batch_size) {
            self.transport.subscribe(chunk).await?;
            batches += 1;
        }
        log::info!(
            "📡 Subscribed to {} instruments in {} batches",
            self.universe.len(),
            batches
        );
        Ok(())
    }

    async fn stream(&mut self, shutdown: &mut ShutdownSignal) -> StreamEnd {
        let mut last_tick = Instant::now();

        loop {
            let armed = self.streaming_seen;
            let deadline = last_tick + self.config.silence_timeout;
            let watchdog = async move {
                if armed {
                    sleep_until(deadline).await
                } else {
                    std::future::pending::<()>().await
                }
            };

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => return StreamEnd::Shutdown,
                _ = watchdog => return StreamEnd::Silence,
                event = self.transport.next_event() => match event {
                    FeedEvent::Tick(tick) => {
                        last_tick = Instant::now();
                        if !self.streaming_seen {
                            self.streaming_seen = true;
                            log::info!("✅ First tick received, silence watchdog armed ({}s)", self.config.silence_timeout.as_secs());
                        }
                        self.set_state(FeedState::Streaming);
                        self.forward(tick);
                    }
                    FeedEvent::Error(e) => {
                        self.stats.transport_errors += 1;
                        log::warn!("⚠️  Feed transport error: {}", e);
                    }
                    FeedEvent::Closed => return StreamEnd::Closed,
                },
            }
        }
    }

    fn forward(&mut self, tick: Tick) {
        match self.tick_tx.try_send(tick) {
            Ok(()) => self.stats.ticks_forwarded += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.ticks_dropped += 1;
                if self.stats.ticks_dropped % 1000 == 1 {
                    log::warn!(
                        "⚠️  Tick channel full, {} ticks dropped so far",
                        self.stats.ticks_dropped
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.ticks_dropped += 1;
                log::debug!("Tick channel closed, dropping tick");
            }
        }
    }

    fn report_failure(&self, failures: u32, error: &FeedError) {
        let level = if failures >= self.config.critical_after {
            EventLevel::Critical
        } else {
            EventLevel::Warning
        };
        self.queue.alert(SystemEvent::new(
            level,
            "FEED_CONNECT_FAILED",
            format!("attempt {}: {}", failures, error),
        ));
    }

    /// Run until the shutdown signal fires
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> FeedStats {
        let mut backoff = ExponentialBackoff::new(self.config.reconnect_base, self.config.reconnect_max, u32::MAX)
            .with_jitter();
        let mut failures: u32 = 0;
        let mut had_session = false;

        log::info!("🚀 Feed client starting ({} instruments)", self.universe.len());

        loop {
            if is_shutdown(&shutdown) {
                break;
            }
            self.set_state(if had_session {
                FeedState::Reconnecting
            } else {
                FeedState::Connecting
            });

            let attempt = tokio::select! {
                result = self.establish() => result,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match attempt {
                Ok(()) => {
                    self.stats.connects += 1;
                    if failures > 0 {
                        self.queue.alert(SystemEvent::new(
                            EventLevel::Info,
                            "FEED_RECOVERED",
                            format!("connected after {} failed attempts", failures),
                        ));
                    }
                    failures = 0;
                    had_session = true;
                    self.set_state(FeedState::Subscribed);

                    let ticks_before = self.stats.ticks_forwarded + self.stats.ticks_dropped;
                    let end = self.stream(&mut shutdown).await;
                    self.transport.close().await;
                    if self.stats.ticks_forwarded + self.stats.ticks_dropped > ticks_before {
                        backoff.reset();
                    }

                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Silence => self.queue.alert(SystemEvent::new(
                            EventLevel::Warning,
                            "FEED_SILENCE",
                            format!(
                                "no tick for {}s, reconnecting",
                                self.config.silence_timeout.as_secs()
                            ),
                        )),
                        StreamEnd::Closed => self.queue.alert(SystemEvent::new(
                            EventLevel::Warning,
                            "FEED_CLOSED",
                            "transport closed, reconnecting",
                        )),
                    }
                    self.set_state(FeedState::Reconnecting);
                }
                Err(e) => {
                    failures += 1;
                    self.stats.failed_attempts += 1;
                    self.transport.close().await;
                    self.report_failure(failures, &e);
                    if !had_session {
                        self.set_state(FeedState::Disconnected);
                    }
                }
            }

            tokio::select! {
                _ = backoff.sleep() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.transport.close().await;
        self.set_state(FeedState::ShutDown);
        log::info!("🛑 Feed client stopped");
        log::info!("   ├─ Ticks forwarded: {}", self.stats.ticks_forwarded);
        log::info!("   ├─ Ticks dropped: {}", self.stats.ticks_dropped);
        log::info!("   └─ Connects: {} ({} failed attempts)", self.stats.connects, self.stats.failed_attempts);
        self.stats
    }
}
