//! In-memory endpoint harness: lets tests play the server side of the
//! message channel without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use syncwire_client::{
    Client, ClientOptions, Endpoint, EndpointCommand, EndpointEvent, EndpointProvider,
    TransportError,
};
use syncwire_core::{build_message, parse_messages, Action, Message, Topic};

// Generous because the suites run under tokio's paused clock, where waits
// spanning heartbeat intervals elapse instantly.
const WAIT: Duration = Duration::from_secs(600);

/// Server side of one in-memory endpoint.
pub struct ServerConn {
    /// URL the client connected to.
    pub url: String,
    events: mpsc::Sender<EndpointEvent>,
    payloads: mpsc::UnboundedReceiver<String>,
    parsed: VecDeque<Message>,
    open: Arc<AtomicBool>,
    client_closed: Arc<AtomicBool>,
}

impl ServerConn {
    /// Completes the channel open: the client sees the `Open` event.
    pub async fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.events
            .send(EndpointEvent::Open)
            .await
            .expect("client endpoint gone");
    }

    /// Delivers a raw payload to the client.
    pub async fn send_raw(&self, payload: String) {
        self.events
            .send(EndpointEvent::Message(payload))
            .await
            .expect("client endpoint gone");
    }

    /// Builds and delivers a single frame to the client.
    pub async fn send_msg(&self, topic: Topic, action: Action, data: &[&str]) {
        self.send_raw(build_message(topic, action, data)).await;
    }

    /// Simulates a transport failure followed by the close.
    pub async fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(EndpointEvent::Error(reason.to_owned()))
            .await;
        let _ = self.events.send(EndpointEvent::Closed).await;
    }

    /// Drops the channel from the server side.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(EndpointEvent::Closed).await;
    }

    /// Whether the client asked the endpoint to close.
    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    /// Waits until the client closes the endpoint from its side.
    pub async fn wait_client_close(&mut self) {
        timeout(WAIT, async {
            while !self.client_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never closed the endpoint");
    }

    /// Next frame written by the client, heartbeats skipped.
    pub async fn expect_message(&mut self) -> Message {
        loop {
            let message = self.next_message().await;
            if message.topic == Topic::Connection
                && matches!(message.action, Action::Ping | Action::Pong)
            {
                continue;
            }
            return message;
        }
    }

    /// Next frame written by the client, heartbeats included.
    pub async fn next_message(&mut self) -> Message {
        loop {
            if let Some(message) = self.parsed.pop_front() {
                return message;
            }
            let payload = timeout(WAIT, self.payloads.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client endpoint gone");
            for frame in parse_messages(&payload) {
                self.parsed.push_back(frame.expect("client sent malformed frame"));
            }
        }
    }

    /// Asserts the client writes nothing (but heartbeats) for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let result = timeout(window, self.expect_message()).await;
        assert!(result.is_err(), "expected no client frame, got {result:?}");
    }
}

struct ProviderInner {
    pending: VecDeque<ServerConn>,
    waiting: VecDeque<oneshot::Sender<ServerConn>>,
    fail_connects: usize,
    connects: usize,
}

/// An [`EndpointProvider`] whose endpoints are in-memory channel pairs
/// handed to the test as [`ServerConn`]s.
#[derive(Clone)]
pub struct MemoryProvider {
    inner: Arc<Mutex<ProviderInner>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProviderInner {
                pending: VecDeque::new(),
                waiting: VecDeque::new(),
                fail_connects: 0,
                connects: 0,
            })),
        }
    }
}

impl MemoryProvider {
    /// Makes the next `count` connect attempts fail at the transport.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().fail_connects = count;
    }

    /// Total connect attempts observed (including failed ones).
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connects
    }

    /// Waits for the client's next connect attempt.
    pub async fn expect_connection(&self) -> ServerConn {
        let receiver = {
            let mut inner = self.inner.lock();
            if let Some(conn) = inner.pending.pop_front() {
                return conn;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiting.push_back(tx);
            rx
        };
        timeout(WAIT, receiver)
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("provider dropped")
    }
}

#[async_trait]
impl EndpointProvider for MemoryProvider {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Endpoint, mpsc::Receiver<EndpointEvent>), TransportError> {
        {
            let mut inner = self.inner.lock();
            inner.connects += 1;
            if inner.fail_connects > 0 {
                inner.fail_connects -= 1;
                return Err(TransportError::Connect("synthetic connect failure".to_owned()));
            }
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let client_closed = Arc::new(AtomicBool::new(false));

        // Translate endpoint commands into captured payloads; a close
        // command completes immediately with the Closed event.
        let task_open = Arc::clone(&open);
        let task_closed = Arc::clone(&client_closed);
        let task_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    EndpointCommand::Text(text) => {
                        let _ = payload_tx.send(text);
                    }
                    EndpointCommand::Close => {
                        task_open.store(false, Ordering::SeqCst);
                        task_closed.store(true, Ordering::SeqCst);
                        let _ = task_events.send(EndpointEvent::Closed).await;
                        break;
                    }
                }
            }
        });

        let conn = ServerConn {
            url: url.to_owned(),
            events: event_tx,
            payloads: payload_rx,
            parsed: VecDeque::new(),
            open: Arc::clone(&open),
            client_closed,
        };

        {
            let mut inner = self.inner.lock();
            if let Some(waiter) = inner.waiting.pop_front() {
                let _ = waiter.send(conn);
            } else {
                inner.pending.push_back(conn);
            }
        }

        Ok((Endpoint::from_parts(command_tx, open), event_rx))
    }
}

/// Options tuned for tests: short delays, quick pruning.
pub fn test_options() -> ClientOptions {
    ClientOptions {
        send_delay: Duration::from_millis(5),
        prune_interval: Duration::from_millis(500),
        reconnect_interval_increment: Duration::from_millis(100),
        max_reconnect_interval: Duration::from_millis(400),
        ..ClientOptions::default()
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spins up a client against a fresh in-memory provider.
pub fn connect_client(url: &str, options: ClientOptions) -> (Client, MemoryProvider) {
    init_tracing();
    let provider = MemoryProvider::default();
    let client = Client::with_provider(url, options, Arc::new(provider.clone()))
        .expect("client connects");
    (client, provider)
}

/// Runs the full handshake and authentication dance, leaving the
/// connection `OPEN`.
pub async fn open_and_login(client: &Client, provider: &MemoryProvider) -> ServerConn {
    let mut conn = provider.expect_connection().await;
    conn.open().await;
    conn.send_msg(Topic::Connection, Action::Ack, &[]).await;

    let login = client.login(json!({"username": "test"}));
    let serve = async {
        loop {
            let message = conn.expect_message().await;
            if message.topic == Topic::Auth && message.action == Action::Request {
                break;
            }
        }
        conn.send_msg(Topic::Auth, Action::Ack, &[]).await;
    };
    let (result, ()) = tokio::join!(login, serve);
    result.expect("login failed");
    conn
}
