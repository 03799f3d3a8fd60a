//! Connection state machine over a message-channel endpoint.
//!
//! All connection state lives in a single actor task; the [`Connection`]
//! handle is a cheap clone that feeds it commands through a mailbox. The
//! actor owns the endpoint, the handshake and authentication flows, the
//! heartbeat, the conflating send buffer, and reconnection with linear
//! backoff. Inbound frames for topics other than `CONNECTION`/`AUTH` are
//! forwarded to the client's router.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval};

use syncwire_core::{
    build_message, parse_messages, parse_typed, Action, ConnectionState, Event, Message, Topic,
};

use crate::endpoint::{normalize_url, Endpoint, EndpointEvent, EndpointProvider};
use crate::error::{ClientError, ErrorEvent, TransportError};
use crate::events::Emitter;
use crate::options::ClientOptions;

/// Inbound frames dispatched per scheduling slice before yielding back to
/// the executor, so a large batch cannot monopolize the task.
const INBOUND_BATCH: usize = 64;

/// Commands accepted by the connection actor.
enum Command {
    /// Enqueue a pre-built frame on the send buffer.
    Send(String),
    /// Store credentials and run the authentication round-trip.
    Authenticate {
        params: Value,
        reply: oneshot::Sender<Result<Option<Value>, ClientError>>,
    },
    /// Deliberately close the connection.
    Close,
}

/// Handle to the connection actor.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Normalizes `url` and spawns the connection actor.
    ///
    /// Frames for topics the connection does not handle itself are
    /// forwarded through `router_tx`; state transitions are published on
    /// the returned handle's watch and on `state_events`.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidUrl`] when the URL cannot be normalized.
    pub(crate) fn spawn(
        url: &str,
        options: Arc<ClientOptions>,
        provider: Arc<dyn EndpointProvider>,
        router_tx: mpsc::UnboundedSender<Message>,
        state_events: Emitter<ConnectionState>,
        errors: Emitter<ErrorEvent>,
    ) -> Result<Self, TransportError> {
        let normalized = normalize_url(url, &options.path)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let actor = ConnectionActor {
            options,
            provider,
            state_tx,
            state_events,
            router_tx,
            errors,
            original_url: normalized.clone(),
            url: normalized,
            endpoint: None,
            events: None,
            inbound: VecDeque::new(),
            queue: VecDeque::new(),
            flush_at: None,
            reconnect_at: None,
            reconnect_attempts: 0,
            heartbeat: None,
            last_heartbeat: Instant::now(),
            deliberate_close: false,
            redirecting: false,
            challenge_denied: false,
            too_many_auth_attempts: false,
            authentication_timeout: false,
            auth_params: None,
            pending_auth: None,
        };
        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands: command_tx,
            state_rx,
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A watch on state transitions, for await-style consumers.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Builds a frame and enqueues it on the conflating send buffer.
    pub(crate) fn send_message(&self, topic: Topic, action: Action, data: &[&str]) {
        let frame = build_message(topic, action, data);
        let _ = self.commands.send(Command::Send(frame));
    }

    /// Stores credentials and runs the authentication round-trip.
    ///
    /// Resolves with the server's optional auth payload once `AUTH/ACK`
    /// arrives. If the connection was deliberately closed it is re-opened
    /// first; the stored credentials are re-submitted automatically on any
    /// later handshake.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidArgument`] when `params` is not an object.
    /// - [`ClientError::ConnectionClosed`] when a terminal failure
    ///   (too many auth attempts, challenge denied, authentication
    ///   timeout) has latched.
    /// - [`ClientError::AuthenticationFailed`] when the server rejects the
    ///   credentials without a terminal flag.
    pub async fn authenticate(&self, params: Value) -> Result<Option<Value>, ClientError> {
        if !params.is_object() {
            return Err(ClientError::InvalidArgument(
                "authentication params must be an object".to_owned(),
            ));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Authenticate {
                params,
                reply: reply_tx,
            })
            .map_err(|_| ClientError::Stopped)?;
        reply_rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Deliberately closes the connection: the buffer is flushed, timers
    /// reset, and no reconnection is attempted.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Linear backoff: `increment * attempt`, capped at `max_reconnect_interval`.
/// `attempt` is 1-based; the first retry already waits one increment.
fn reconnect_delay(options: &ClientOptions, attempt: u32) -> Duration {
    (options.reconnect_interval_increment * attempt).min(options.max_reconnect_interval)
}

struct ConnectionActor {
    options: Arc<ClientOptions>,
    provider: Arc<dyn EndpointProvider>,
    state_tx: watch::Sender<ConnectionState>,
    state_events: Emitter<ConnectionState>,
    router_tx: mpsc::UnboundedSender<Message>,
    errors: Emitter<ErrorEvent>,

    original_url: String,
    url: String,
    endpoint: Option<Endpoint>,
    events: Option<mpsc::Receiver<EndpointEvent>>,
    inbound: VecDeque<Message>,

    queue: VecDeque<String>,
    flush_at: Option<Instant>,

    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,

    heartbeat: Option<Interval>,
    last_heartbeat: Instant,

    deliberate_close: bool,
    redirecting: bool,
    challenge_denied: bool,
    too_many_auth_attempts: bool,
    authentication_timeout: bool,

    auth_params: Option<Value>,
    pending_auth: Option<oneshot::Sender<Result<Option<Value>, ClientError>>>,
}

impl ConnectionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.open_endpoint().await;

        loop {
            // Work through parsed inbound frames in bounded slices so a
            // large payload cannot monopolize the executor.
            if !self.inbound.is_empty() {
                self.drain_inbound();
                tokio::task::yield_now().await;
                continue;
            }

            let flush_at = self.flush_at;
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = recv_event(&mut self.events) => match event {
                    Some(event) => self.handle_endpoint_event(event),
                    None => {
                        // Event channel dropped without a close frame.
                        self.events = None;
                        self.handle_endpoint_event(EndpointEvent::Closed);
                    }
                },
                () = sleep_until_opt(flush_at) => {
                    self.flush_at = None;
                    self.flush();
                },
                () = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_endpoint().await;
                },
                () = tick_opt(&mut self.heartbeat) => self.on_heartbeat_tick(),
            }
        }
    }

    // ---- endpoint lifecycle ----

    async fn open_endpoint(&mut self) {
        match self.provider.connect(&self.url).await {
            Ok((endpoint, events)) => {
                self.endpoint = Some(endpoint);
                self.events = Some(events);
            }
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "endpoint connect failed");
                self.on_close();
            }
        }
    }

    fn handle_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Open => self.on_open(),
            EndpointEvent::Message(payload) => self.on_payload(&payload),
            EndpointEvent::Error(err) => self.on_transport_error(err),
            EndpointEvent::Closed => self.on_close(),
        }
    }

    fn on_open(&mut self) {
        self.reconnect_attempts = 0;
        self.last_heartbeat = Instant::now();
        let period = self.options.heartbeat_interval;
        self.heartbeat = Some(tokio::time::interval_at(Instant::now() + period, period));
        self.set_state(ConnectionState::AwaitingConnection);
    }

    fn on_payload(&mut self, payload: &str) {
        for parsed in parse_messages(payload) {
            match parsed {
                Ok(message) => self.inbound.push_back(message),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unparseable frame");
                    self.report_error(
                        Topic::Error,
                        Event::MessageParseError.as_str(),
                        &err.to_string(),
                    );
                }
            }
        }
    }

    fn on_transport_error(&mut self, err: String) {
        self.flush_at = None;
        self.heartbeat = None;
        self.set_state(ConnectionState::Error);
        // Report on the next tick so the close/reconnect path runs before
        // user callbacks observe the failure.
        let errors = self.errors.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            errors.emit(&ErrorEvent {
                topic: Topic::Connection,
                event: Event::ConnectionError.as_str().to_owned(),
                message: err,
            });
        });
    }

    fn on_close(&mut self) {
        self.heartbeat = None;
        self.endpoint = None;
        self.events = None;

        if self.redirecting {
            self.redirecting = false;
            // Reopen at the redirect target on the next scheduler turn;
            // `url` still points there, `original_url` is untouched.
            self.reconnect_at = Some(Instant::now());
        } else if self.deliberate_close {
            self.fail_pending_auth();
            self.set_state(ConnectionState::Closed);
        } else {
            self.try_reconnect();
        }
    }

    fn try_reconnect(&mut self) {
        if self.reconnect_attempts < self.options.max_reconnect_attempts {
            self.set_state(ConnectionState::Reconnecting);
            // A redirect only lasts for the lifetime of its endpoint.
            self.url = self.original_url.clone();
            self.reconnect_attempts += 1;
            let delay = reconnect_delay(&self.options, self.reconnect_attempts);
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            tracing::warn!(
                attempts = self.reconnect_attempts,
                "giving up on reconnection"
            );
            self.queue.clear();
            self.flush_at = None;
            self.deliberate_close = true;
            self.report_error(
                Topic::Connection,
                Event::MaxReconnectionAttemptsReached.as_str(),
                "max reconnection attempts reached",
            );
            self.fail_pending_auth();
            self.set_state(ConnectionState::Closed);
        }
    }

    /// A close that latches before `AUTH/ACK` must not leave the caller's
    /// authentication future pending.
    fn fail_pending_auth(&mut self) {
        if let Some(reply) = self.pending_auth.take() {
            let _ = reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(frame) => self.enqueue(frame),
            Command::Authenticate { params, reply } => self.authenticate(params, reply).await,
            Command::Close => self.close_deliberately(),
        }
    }

    async fn authenticate(
        &mut self,
        params: Value,
        reply: oneshot::Sender<Result<Option<Value>, ClientError>>,
    ) {
        if self.terminal_failure() {
            let _ = reply.send(Err(ClientError::ConnectionClosed));
            return;
        }
        self.auth_params = Some(params);

        let state = *self.state_tx.borrow();
        if state == ConnectionState::Open {
            // Already authenticated; the fresh credentials are kept for
            // the next handshake.
            let _ = reply.send(Ok(None));
            return;
        }
        self.pending_auth = Some(reply);
        if state == ConnectionState::AwaitingAuthentication {
            self.send_auth_request();
        } else if state == ConnectionState::Closed && self.deliberate_close {
            self.deliberate_close = false;
            self.reconnect_attempts = 0;
            self.open_endpoint().await;
        }
        // Any other state: credentials are submitted on CONNECTION/ACK.
    }

    fn close_deliberately(&mut self) {
        self.deliberate_close = true;
        self.flush();
        self.flush_at = None;
        self.heartbeat = None;
        self.reconnect_at = None;
        match &self.endpoint {
            Some(endpoint) => endpoint.close(),
            None => self.set_state(ConnectionState::Closed),
        }
    }

    fn shutdown(&mut self) {
        self.deliberate_close = true;
        if let Some(endpoint) = &self.endpoint {
            endpoint.close();
        }
        self.set_state(ConnectionState::Closed);
    }

    // ---- heartbeat ----

    fn on_heartbeat_tick(&mut self) {
        let factor = self.options.heartbeat_tolerance_factor.max(2);
        let tolerance = self.options.heartbeat_interval * factor;
        if self.last_heartbeat.elapsed() > tolerance {
            tracing::warn!("heartbeat not received in time, closing endpoint");
            self.heartbeat = None;
            self.report_error(
                Topic::Connection,
                Event::HeartbeatTimeout.as_str(),
                "heartbeat not received",
            );
            if let Some(endpoint) = &self.endpoint {
                endpoint.close();
            }
        } else {
            self.send_direct(build_message(Topic::Connection, Action::Ping, &[]));
        }
    }

    // ---- send buffer ----

    fn enqueue(&mut self, frame: String) {
        self.queue.push_back(frame);
        if self.queue.len() > self.options.max_messages_per_packet {
            self.flush_at = None;
            self.flush();
        } else if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.options.send_delay);
        }
    }

    /// Writes the queued frames, conflating up to `max_messages_per_packet`
    /// per transport write. No-op unless the state is `OPEN` and the
    /// endpoint is writable.
    fn flush(&mut self) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        if *self.state_tx.borrow() != ConnectionState::Open || !endpoint.is_open() {
            return;
        }
        let mut packet = String::new();
        let mut count = 0;
        while let Some(frame) = self.queue.pop_front() {
            packet.push_str(&frame);
            count += 1;
            if count == self.options.max_messages_per_packet {
                endpoint.send(std::mem::take(&mut packet));
                count = 0;
            }
        }
        if !packet.is_empty() {
            endpoint.send(packet);
        }
    }

    /// Writes a frame immediately, bypassing the conflation buffer. Used
    /// by the handshake, authentication, and heartbeat flows, which run
    /// before the state machine reaches `OPEN`.
    fn send_direct(&self, frame: String) {
        if let Some(endpoint) = &self.endpoint {
            if endpoint.is_open() {
                endpoint.send(frame);
            }
        }
    }

    // ---- inbound dispatch ----

    fn drain_inbound(&mut self) {
        for _ in 0..INBOUND_BATCH {
            let Some(message) = self.inbound.pop_front() else {
                break;
            };
            tracing::trace!(topic = %message.topic, action = %message.action, "inbound message");
            match message.topic {
                Topic::Connection => self.on_connection_message(&message),
                Topic::Auth => self.on_auth_message(&message),
                _ => {
                    let _ = self.router_tx.send(message);
                }
            }
        }
    }

    fn on_connection_message(&mut self, message: &Message) {
        match message.action {
            Action::Ping => {
                self.last_heartbeat = Instant::now();
                self.send_direct(build_message(Topic::Connection, Action::Pong, &[]));
            }
            Action::Pong => {
                self.last_heartbeat = Instant::now();
            }
            Action::Challenge => {
                let url = self.original_url.clone();
                self.send_direct(build_message(
                    Topic::Connection,
                    Action::ChallengeResponse,
                    &[&url],
                ));
                self.set_state(ConnectionState::Challenging);
            }
            Action::Ack => {
                self.set_state(ConnectionState::AwaitingAuthentication);
                if self.auth_params.is_some() {
                    self.send_auth_request();
                }
            }
            Action::Redirect => match message.field(0) {
                Some(url) => {
                    self.redirecting = true;
                    self.url = url.to_owned();
                    if let Some(endpoint) = &self.endpoint {
                        endpoint.close();
                    }
                }
                None => self.report_error(
                    Topic::Connection,
                    Event::MessageParseError.as_str(),
                    "redirect without a target url",
                ),
            },
            Action::Rejection => {
                self.challenge_denied = true;
                self.deliberate_close = true;
                if let Some(endpoint) = &self.endpoint {
                    endpoint.close();
                }
            }
            Action::Error => {
                let event = message.field(0).unwrap_or_default().to_owned();
                let detail = message.field(1).unwrap_or("connection error").to_owned();
                if Event::parse(&event) == Some(Event::AuthenticationTimeout) {
                    self.authentication_timeout = true;
                    self.deliberate_close = true;
                    if let Some(endpoint) = &self.endpoint {
                        endpoint.close();
                    }
                }
                self.report_error(Topic::Connection, &event, &detail);
            }
            _ => {
                tracing::debug!(action = %message.action, "unexpected connection action");
            }
        }
    }

    fn send_auth_request(&mut self) {
        if let Some(params) = &self.auth_params {
            let encoded = params.to_string();
            self.send_direct(build_message(Topic::Auth, Action::Request, &[&encoded]));
            self.set_state(ConnectionState::Authenticating);
        }
    }

    fn on_auth_message(&mut self, message: &Message) {
        match message.action {
            Action::Ack => {
                self.set_state(ConnectionState::Open);
                self.flush();
                let data = self.parse_auth_data(message.field(0));
                if let Some(reply) = self.pending_auth.take() {
                    let _ = reply.send(Ok(data));
                }
            }
            Action::Error => {
                let reason = message.field(0).unwrap_or_default().to_owned();
                let data = self.parse_auth_data(message.field(1));
                if Event::parse(&reason) == Some(Event::TooManyAuthAttempts) {
                    self.too_many_auth_attempts = true;
                    self.deliberate_close = true;
                    if let Some(endpoint) = &self.endpoint {
                        endpoint.close();
                    }
                } else {
                    self.set_state(ConnectionState::AwaitingAuthentication);
                }
                if let Some(reply) = self.pending_auth.take() {
                    let _ = reply.send(Err(ClientError::AuthenticationFailed { reason, data }));
                }
            }
            _ => {
                tracing::debug!(action = %message.action, "unexpected auth action");
            }
        }
    }

    fn parse_auth_data(&self, field: Option<&str>) -> Option<Value> {
        let field = field?;
        if field.is_empty() {
            return None;
        }
        match parse_typed(field) {
            Ok(value) => Some(value),
            Err(err) => {
                self.report_error(Topic::Auth, Event::MessageParseError.as_str(), &err.to_string());
                None
            }
        }
    }

    // ---- shared helpers ----

    fn terminal_failure(&self) -> bool {
        self.too_many_auth_attempts || self.challenge_denied || self.authentication_timeout
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        tracing::debug!(state = %state, "connection state changed");
        let _ = self.state_tx.send(state);
        self.state_events.emit(&state);
    }

    fn report_error(&self, topic: Topic, event: &str, message: &str) {
        tracing::warn!(topic = %topic, event, message, "client error");
        self.errors.emit(&ErrorEvent {
            topic,
            event: event.to_owned(),
            message: message.to_owned(),
        });
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<EndpointEvent>>) -> Option<EndpointEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
