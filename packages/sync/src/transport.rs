//! # Event Transport
//!
//! One long-lived `text/event-stream` connection per session.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──opened──▶ Open ──closed──▶ Disconnected
//! ```
//!
//! The transport never retries on its own. Reopening is the session's call,
//! and every connection starts with a full snapshot from the server, since an
//! incremental stream resumed after a gap may have missed releases.

use crate::errors::{SyncError, SyncResult};
use crate::model::{ClientId, Message};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;

/// Raw byte chunks of one event-stream connection
pub type ByteStream = Pin<Box<dyn Stream<Item = SyncResult<Vec<u8>>> + Send + 'static>>;

/// Event name the server uses for keep-alives
pub const PING_EVENT: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// Parameters of one event-stream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub client_id: ClientId,
    pub document_id: String,
}

impl StreamRequest {
    pub fn new(client_id: ClientId, document_id: impl Into<String>) -> Self {
        Self {
            client_id,
            document_id: document_id.into(),
        }
    }

    pub fn query(&self) -> String {
        format!("uid={}&page={}", self.client_id, self.document_id)
    }
}

/// Opens event-stream connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> SyncResult<ByteStream>;
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Decode the payload; `None` for keep-alives and empty events
    pub fn message(&self) -> Option<SyncResult<Message>> {
        if self.event.as_deref() == Some(PING_EVENT) {
            tracing::trace!("SSE ping");
            return None;
        }
        if self.data.trim().is_empty() {
            return None;
        }
        Some(Message::from_json(&self.data).map_err(SyncError::from))
    }
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the events it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent { event, data });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Notifications from a connection task to the session
#[derive(Debug)]
pub enum TransportEvent {
    Opened { connection: u64 },
    Message { connection: u64, message: Message },
    Closed { connection: u64, error: Option<String> },
}

/// Connection state plus the task reading the current connection
#[derive(Debug)]
pub struct Transport {
    state: ConnectionState,
    connection: u64,
    opened_at: Option<Instant>,
    reader: Option<JoinHandle<()>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection: 0,
            opened_at: None,
            reader: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open a new connection, superseding any current one
    pub fn connect(
        &mut self,
        connector: Arc<dyn Connector>,
        request: StreamRequest,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        self.disconnect();
        self.connection += 1;
        self.state = ConnectionState::Connecting;
        let connection = self.connection;
        tracing::debug!("Connecting event stream ({})", request.query());

        self.reader = Some(tokio::spawn(async move {
            let mut stream = match connector.open(&request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::Closed {
                        connection,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            if events.send(TransportEvent::Opened { connection }).is_err() {
                return;
            }

            let mut decoder = SseDecoder::new();
            let mut error = None;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error = Some(e.to_string());
                        break;
                    }
                };
                for event in decoder.feed(&chunk) {
                    match event.message() {
                        Some(Ok(message)) => {
                            tracing::trace!("Received: {}", event.data);
                            if events.send(TransportEvent::Message { connection, message }).is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => tracing::warn!("Dropping malformed event: {}", e),
                        None => {}
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed { connection, error });
        }));
    }

    /// Stop reading the current connection
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Whether an event belongs to the current connection
    pub fn is_current(&self, connection: u64) -> bool {
        connection == self.connection
    }

    pub fn on_opened(&mut self, connection: u64) {
        if !self.is_current(connection) {
            return;
        }
        let now = Instant::now();
        match self.opened_at {
            Some(previous) => tracing::debug!(
                "SSE opened [{}sec]",
                now.saturating_duration_since(previous).as_secs()
            ),
            None => tracing::debug!("SSE opened [first]"),
        }
        self.opened_at = Some(now);
        self.state = ConnectionState::Open;
    }

    pub fn on_closed(&mut self, connection: u64, error: Option<&str>) {
        if !self.is_current(connection) {
            return;
        }
        match error {
            Some(e) => tracing::warn!("Event stream failed: {}", e),
            None => tracing::debug!("Event stream closed"),
        }
        self.reader = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
