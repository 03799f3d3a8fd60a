//! Transport endpoint: URL normalization, the provider seam, and the
//! default WebSocket implementation.
//!
//! The connection state machine only sees [`Endpoint`] handles and
//! [`EndpointEvent`] streams. [`EndpointProvider`] is the seam that lets
//! tests drive the machine with an in-memory channel while production uses
//! `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::TransportError;

/// Capacity of the inbound event channel per endpoint. A slow consumer
/// backpressures the reader task rather than growing without bound.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events surfaced by an endpoint to the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The channel is established and writable.
    Open,
    /// A text payload arrived.
    Message(String),
    /// The transport failed; a `Closed` event follows.
    Error(String),
    /// The channel is gone, deliberately or not.
    Closed,
}

/// Commands accepted by an endpoint's write side.
#[derive(Debug)]
pub enum EndpointCommand {
    /// Write a text payload.
    Text(String),
    /// Close the channel.
    Close,
}

/// Write-side handle to a connected endpoint.
///
/// The read side is the [`EndpointEvent`] receiver returned alongside this
/// handle by [`EndpointProvider::connect`].
#[derive(Debug, Clone)]
pub struct Endpoint {
    commands: mpsc::UnboundedSender<EndpointCommand>,
    open: Arc<AtomicBool>,
}

impl Endpoint {
    /// Assembles an endpoint from its command channel and writability flag.
    /// Providers (including test harnesses) use this to hand the write side
    /// to the connection.
    #[must_use]
    pub fn from_parts(
        commands: mpsc::UnboundedSender<EndpointCommand>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self { commands, open }
    }

    /// Enqueues a text payload. Returns `false` when the endpoint is gone.
    pub fn send(&self, text: String) -> bool {
        self.commands.send(EndpointCommand::Text(text)).is_ok()
    }

    /// Requests the channel be closed. The `Closed` event arrives through
    /// the event stream once the transport has shut down.
    pub fn close(&self) {
        let _ = self.commands.send(EndpointCommand::Close);
    }

    /// Whether the channel is currently writable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.commands.is_closed()
    }
}

/// Connects endpoints on behalf of the connection state machine.
#[async_trait]
pub trait EndpointProvider: Send + Sync + 'static {
    /// Opens a channel to `url`, returning the write handle and the event
    /// stream. The provider emits [`EndpointEvent::Open`] as the first
    /// event once the channel is writable.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Endpoint, mpsc::Receiver<EndpointEvent>), TransportError>;
}

/// Production provider backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsEndpointProvider;

#[async_trait]
impl EndpointProvider for WsEndpointProvider {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Endpoint, mpsc::Receiver<EndpointEvent>), TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        // Write loop: drains commands into the socket sink.
        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    EndpointCommand::Text(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    EndpointCommand::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        // Read loop: forwards text frames and terminates with `Closed`.
        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            if event_tx.send(EndpointEvent::Open).await.is_err() {
                return;
            }
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if event_tx
                            .send(EndpointEvent::Message(text.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        reader_open.store(false, Ordering::SeqCst);
                        let _ = event_tx.send(EndpointEvent::Error(err.to_string())).await;
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(EndpointEvent::Closed).await;
        });

        Ok((Endpoint::from_parts(command_tx, open), event_rx))
    }
}

/// Normalizes an endpoint URL.
///
/// `ws://` and `wss://` pass through; `http(s)://` is rejected; a
/// schemeless URL and the `//host` form default to `ws://`; `default_path`
/// is appended when the URL carries no path.
///
/// # Errors
///
/// [`TransportError::InvalidUrl`] for empty URLs, unsupported schemes, or
/// a missing host.
pub fn normalize_url(url: &str, default_path: &str) -> Result<String, TransportError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(TransportError::InvalidUrl {
            url: url.to_owned(),
            reason: "empty url".to_owned(),
        });
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Err(TransportError::InvalidUrl {
            url: url.to_owned(),
            reason: "http(s) is not a message channel scheme, use ws(s)".to_owned(),
        });
    }

    let with_scheme = if let Some(rest) = trimmed.strip_prefix("//") {
        format!("ws://{rest}")
    } else if lower.starts_with("ws://") || lower.starts_with("wss://") {
        trimmed.to_owned()
    } else if trimmed.contains("://") {
        return Err(TransportError::InvalidUrl {
            url: url.to_owned(),
            reason: "unsupported scheme".to_owned(),
        });
    } else {
        format!("ws://{trimmed}")
    };

    let host_start = match with_scheme.find("://") {
        Some(index) => index + 3,
        None => 0,
    };
    let host_and_path = &with_scheme[host_start..];
    if host_and_path.is_empty() {
        return Err(TransportError::InvalidUrl {
            url: url.to_owned(),
            reason: "missing host".to_owned(),
        });
    }

    if host_and_path.contains('/') {
        Ok(with_scheme)
    } else if default_path.starts_with('/') {
        Ok(format!("{with_scheme}{default_path}"))
    } else {
        Ok(format!("{with_scheme}/{default_path}"))
    }
}
