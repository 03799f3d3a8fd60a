//! The client shell: owns the options, the connection, and the record
//! handler, and re-emits connection state and error events.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use syncwire_core::{ConnectionState, Topic};

use crate::connection::Connection;
use crate::endpoint::{EndpointProvider, WsEndpointProvider};
use crate::error::{ClientError, ErrorEvent, TransportError};
use crate::events::{Emitter, SubscriptionId};
use crate::handler::RecordHandler;
use crate::options::ClientOptions;

/// A realtime record-synchronization client.
///
/// Connecting starts the handshake immediately; call [`Client::login`] to
/// authenticate and unlock the `OPEN` state. Records are reached through
/// [`Client::records`]. Construction spawns background tasks, so it must
/// happen inside a tokio runtime.
pub struct Client {
    connection: Connection,
    records: RecordHandler,
    state_events: Emitter<ConnectionState>,
    errors: Emitter<ErrorEvent>,
}

impl Client {
    /// Connects to `url` with default options over WebSocket.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidUrl`] when the URL cannot be normalized.
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        Self::with_options(url, ClientOptions::default())
    }

    /// Connects to `url` with explicit options over WebSocket.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidUrl`] when the URL cannot be normalized.
    pub fn with_options(url: &str, options: ClientOptions) -> Result<Self, TransportError> {
        Self::with_provider(url, options, Arc::new(WsEndpointProvider))
    }

    /// Connects through a custom [`EndpointProvider`]. This is the seam
    /// test harnesses use to drive the client with an in-memory channel.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidUrl`] when the URL cannot be normalized.
    pub fn with_provider(
        url: &str,
        options: ClientOptions,
        provider: Arc<dyn EndpointProvider>,
    ) -> Result<Self, TransportError> {
        let options = Arc::new(options);
        let state_events: Emitter<ConnectionState> = Emitter::new();
        let errors: Emitter<ErrorEvent> = Emitter::new();

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            url,
            Arc::clone(&options),
            provider,
            router_tx,
            state_events.clone(),
            errors.clone(),
        )?;
        let records = RecordHandler::new(&options, connection.clone(), &state_events, errors.clone());

        spawn_router(router_rx, &records, errors.clone());

        Ok(Self {
            connection,
            records,
            state_events,
            errors,
        })
    }

    /// Authenticates with the server. Resolves with the server's optional
    /// auth payload; if the connection was deliberately closed it is
    /// re-opened first.
    ///
    /// # Errors
    ///
    /// See [`Connection::authenticate`].
    pub async fn login(&self, params: Value) -> Result<Option<Value>, ClientError> {
        self.connection.authenticate(params).await
    }

    /// The record registry and convenience API.
    #[must_use]
    pub fn records(&self) -> &RecordHandler {
        &self.records
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribes to connection state transitions.
    pub fn on_connection_state(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.state_events.subscribe(move |state| callback(*state))
    }

    /// Subscribes to the error channel: `(topic, event code, message)`.
    pub fn on_error(
        &self,
        callback: impl Fn(&ErrorEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.errors.subscribe(callback)
    }

    /// Deliberately closes the connection. Records are destroyed once the
    /// close completes; reconnection is not attempted.
    pub fn close(&self) {
        self.connection.close();
    }
}

/// Routes non-connection topics: records to the handler, server error
/// frames to the error channel. Subsystems this crate does not implement
/// (events, RPC) are logged and dropped.
fn spawn_router(
    mut router_rx: mpsc::UnboundedReceiver<syncwire_core::Message>,
    records: &RecordHandler,
    errors: Emitter<ErrorEvent>,
) {
    let router = records.router_handle();
    tokio::spawn(async move {
        while let Some(message) = router_rx.recv().await {
            match message.topic {
                Topic::Record => {
                    if !router.route(&message) {
                        break;
                    }
                }
                Topic::Error => {
                    errors.emit(&ErrorEvent {
                        topic: Topic::Error,
                        event: message.field(0).unwrap_or_default().to_owned(),
                        message: message.field(1).unwrap_or_default().to_owned(),
                    });
                }
                _ => {
                    tracing::debug!(topic = %message.topic, "message for unsupported subsystem");
                }
            }
        }
    });
}
