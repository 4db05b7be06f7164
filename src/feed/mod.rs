//! Market feed: session auth, transport and the reconnecting client
//!
//! The transport surfaces the feed's callbacks as an explicit `FeedEvent`
//! stream; `FeedClient` owns the state machine
//! `Disconnected → Connecting → Subscribed → Streaming → Reconnecting → Subscribed …`
//! and only ends in `ShutDown` when asked to.

pub mod auth;
pub mod client;
pub mod ws;

use crate::instruments::Instrument;
use crate::pipeline::types::Tick;
use async_trait::async_trait;
use thiserror::Error;

pub use auth::{FeedSession, SessionAuthenticator, StaticTokenAuthenticator};
pub use client::{FeedClient, FeedClientConfig, FeedStats};
pub use ws::WsTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Reconnecting,
    ShutDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    /// Non-fatal transport error; the connection may still deliver
    Error(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Protocol(String),
}

/// One connection to the tick feed
#[async_trait]
pub trait FeedTransport: Send {
    async fn connect(&mut self, session: &FeedSession) -> Result<(), FeedError>;

    /// Subscribe one batch of instruments
    async fn subscribe(&mut self, instruments: &[Instrument]) -> Result<(), FeedError>;

    /// Next event from the feed. Must be cancel-safe.
    async fn next_event(&mut self) -> FeedEvent;

    async fn close(&mut self);
}
