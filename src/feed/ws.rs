//! WebSocket transport for the tick feed
//!
//! Frames are JSON. After connecting the client sends
//! `{"type":"auth","token":...}`, then one
//! `{"type":"subscribe","instruments":[{"token","segment"}...]}` per batch.
//! Tick frames look like `{"tk":"2885","lp":"2450.35","ft":"1710474600","v":"120"}`;
//! numbers may arrive as JSON numbers or strings. `ft` is the exchange
//! timestamp in epoch seconds; frames without it are stamped on receipt.

use super::auth::FeedSession;
use super::{FeedError, FeedEvent, FeedTransport};
use crate::instruments::{Instrument, InstrumentUniverse};
use crate::pipeline::types::Tick;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode one text frame.
///
/// `Ok(None)` for frames that are not ticks (acks, heartbeats) or that name
/// a token outside the universe.
pub fn decode_frame(raw: &str, universe: &InstrumentUniverse) -> Result<Option<Tick>, FeedError> {
    let frame: Value = serde_json::from_str(raw).map_err(|e| FeedError::Protocol(e.to_string()))?;

    let Some(token) = frame.get("tk").and_then(text) else {
        return Ok(None);
    };
    let Some(symbol) = universe.symbol_for_token(&token) else {
        log::debug!("Tick for unknown token {}", token);
        return Ok(None);
    };
    let price = frame
        .get("lp")
        .and_then(number)
        .ok_or_else(|| FeedError::Protocol(format!("tick for {} without a price", token)))?;

    let timestamp = match frame.get("ft").and_then(number) {
        Some(secs) => DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .ok_or_else(|| FeedError::Protocol(format!("feed time {} out of range", secs)))?,
        None => Utc::now(),
    };

    Ok(Some(Tick {
        instrument_id: symbol.to_string(),
        price,
        timestamp,
        volume: frame.get("v").and_then(number),
    }))
}

pub struct WsTransport {
    url: String,
    universe: Arc<InstrumentUniverse>,
    stream: Option<WsStream>,
    decode_errors: u64,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, universe: Arc<InstrumentUniverse>) -> Self {
        Self {
            url: url.into(),
            universe,
            stream: None,
            decode_errors: 0,
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    async fn send_json(&mut self, frame: Value) -> Result<(), FeedError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Transport("not connected".to_string()))?;
        stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&mut self, session: &FeedSession) -> Result<(), FeedError> {
        self.close().await;
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        log::info!("🔌 Connected to feed at {}", self.url);
        self.stream = Some(stream);

        self.send_json(json!({ "type": "auth", "token": session.access_token }))
            .await
            .map_err(|e| FeedError::Auth(e.to_string()))
    }

    async fn subscribe(&mut self, instruments: &[Instrument]) -> Result<(), FeedError> {
        let list: Vec<Value> = instruments
            .iter()
            .map(|i| json!({ "token": i.token, "segment": i.segment }))
            .collect();
        self.send_json(json!({ "type": "subscribe", "instruments": list }))
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))
    }

    async fn next_event(&mut self) -> FeedEvent {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return FeedEvent::Closed;
            };
            match stream.next().await {
                Some(Ok(Message::Text(raw))) => match decode_frame(raw.as_str(), &self.universe) {
                    Ok(Some(tick)) => return FeedEvent::Tick(tick),
                    Ok(None) => continue,
                    Err(e) => {
                        self.decode_errors += 1;
                        log::debug!("Skipping frame: {}", e);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    log::warn!("Feed sent close frame: {:?}", frame);
                    self.stream = None;
                    return FeedEvent::Closed;
                }
                // Pings are answered by tungstenite on the next read
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return FeedEvent::Error(e.to_string());
                }
                None => {
                    self.stream = None;
                    return FeedEvent::Closed;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                log::debug!("Error closing feed socket: {}", e);
            }
        }
    }
}
