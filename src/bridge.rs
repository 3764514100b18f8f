//! Relay ("bridge") client.
//!
//! The bridge only ever sees base64 ciphertext. Sending is a plain HTTP POST;
//! receiving is a server-sent event stream resumed from the last event id.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::crypto::SessionId;
use crate::error::BridgeError;

/// One encrypted body addressed to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub from: SessionId,
    pub to: String,
    pub ttl_secs: u64,
    pub body: String,
}

/// A message an app posted for one of our sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    #[serde(default)]
    pub id: String,
    /// App client id.
    pub from: String,
    /// Base64 ciphertext.
    pub message: String,
}

#[async_trait]
pub trait BridgeClient: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), BridgeError>;
}

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser; chunks may split anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() && frame.id.is_none() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

impl BridgeEvent {
    /// Turn a frame into an event. Heartbeats and empty frames yield `None`.
    pub fn from_frame(frame: SseFrame) -> Option<Result<Self, BridgeError>> {
        if frame.event.as_deref() == Some("heartbeat") || frame.data.trim().is_empty() {
            return None;
        }
        let parsed = serde_json::from_str::<BridgeEvent>(&frame.data)
            .map(|mut event| {
                if let Some(id) = frame.id {
                    event.id = id;
                }
                event
            })
            .map_err(|e| BridgeError::StreamFailed {
                reason: format!("undecodable bridge event: {e}"),
            });
        Some(parsed)
    }
}

pub struct HttpBridgeClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpBridgeClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Open the event stream for `client_ids`, resuming after `last_event_id`.
    pub async fn subscribe(
        &self,
        client_ids: &[SessionId],
        last_event_id: Option<&str>,
    ) -> Result<BoxStream<'static, Result<BridgeEvent, BridgeError>>, BridgeError> {
        let ids = client_ids
            .iter()
            .map(SessionId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let mut query = vec![("client_id", ids)];
        if let Some(last) = last_event_id {
            query.push(("last_event_id", last.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/events", self.base_url))
            .header("Accept", "text/event-stream")
            .query(&query)
            .send()
            .await
            .map_err(|e| BridgeError::StreamFailed {
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::StreamFailed {
                reason: format!("HTTP {status}"),
            });
        }

        tracing::info!(
            sessions = client_ids.len(),
            last_event_id = last_event_id.unwrap_or("-"),
            "Subscribed to bridge events"
        );

        let events = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let batch: Vec<Result<BridgeEvent, BridgeError>> = match chunk {
                    Ok(bytes) => decoder
                        .push(&bytes)
                        .into_iter()
                        .filter_map(BridgeEvent::from_frame)
                        .collect(),
                    Err(e) => vec![Err(BridgeError::StreamFailed {
                        reason: e.to_string(),
                    })],
                };
                futures::future::ready(Some(stream::iter(batch)))
            })
            .flatten()
            .boxed();
        Ok(events)
    }
}

#[async_trait]
impl BridgeClient for HttpBridgeClient {
    async fn send(&self, message: OutgoingMessage) -> Result<(), BridgeError> {
        let send_failed = |reason: String| BridgeError::SendFailed {
            to: message.to.clone(),
            reason,
        };

        let ttl = message.ttl_secs.to_string();
        let response = self
            .client
            .post(format!("{}/message", self.base_url))
            .timeout(self.request_timeout)
            .query(&[
                ("client_id", message.from.as_str()),
                ("to", message.to.as_str()),
                ("ttl", ttl.as_str()),
            ])
            .header("Content-Type", "text/plain")
            .body(message.body.clone())
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(send_failed(format!("HTTP {status}: {body}")));
        }

        tracing::debug!(from = %message.from, to = %message.to, "Posted bridge message");
        Ok(())
    }
}
