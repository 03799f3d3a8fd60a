//! Record registry: reference counting, idle pruning, inbound routing, and
//! the one-shot convenience API.
//!
//! The registry holds at most one live [`Record`] per name, plus a parallel
//! ordered sequence so the pruner can scan and swap-remove without touching
//! the map's iteration order. Convenience operations acquire a handle,
//! await readiness, perform the operation, and always release the handle --
//! including on failure.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use syncwire_core::{Action, ConnectionState, Event, Message, Topic};

use crate::connection::Connection;
use crate::error::{ClientError, ErrorEvent};
use crate::events::{Emitter, SubscriptionId};
use crate::listener::Listener;
use crate::options::ClientOptions;
use crate::record::Record;

struct Registry {
    by_name: HashMap<String, Record>,
    /// Parallel sequence enabling swap-and-pop pruning scans.
    order: Vec<Record>,
}

struct HandlerInner {
    connection: Connection,
    errors: Emitter<ErrorEvent>,
    registry: Mutex<Registry>,
    listeners: Mutex<HashMap<String, Arc<Listener>>>,
}

/// Registry and convenience API for records.
#[derive(Clone)]
pub struct RecordHandler {
    inner: Arc<HandlerInner>,
}

impl RecordHandler {
    pub(crate) fn new(
        options: &Arc<ClientOptions>,
        connection: Connection,
        state_events: &Emitter<ConnectionState>,
        errors: Emitter<ErrorEvent>,
    ) -> Self {
        let handler = Self {
            inner: Arc::new(HandlerInner {
                connection,
                errors,
                registry: Mutex::new(Registry {
                    by_name: HashMap::new(),
                    order: Vec::new(),
                }),
                listeners: Mutex::new(HashMap::new()),
            }),
        };

        let weak = Arc::downgrade(&handler.inner);
        state_events.subscribe(move |state| {
            if let Some(inner) = weak.upgrade() {
                on_connection_state(&inner, *state);
            }
        });

        spawn_pruner(Arc::downgrade(&handler.inner), options.prune_interval);
        handler
    }

    /// Returns the record for `name`, creating it (and sending the initial
    /// `READ`) on first use. Every call takes one handle; release it with
    /// [`Record::discard`].
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidArgument`] for an empty name.
    pub fn get_record(&self, name: &str) -> Result<Record, ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "record name must not be empty".to_owned(),
            ));
        }
        let mut registry = self.inner.registry.lock();
        if let Some(record) = registry.by_name.get(name) {
            record.retain();
            return Ok(record.clone());
        }
        let record = Record::new(name, self.inner.connection.clone(), self.inner.errors.clone());
        record.retain();
        registry.by_name.insert(name.to_owned(), record.clone());
        registry.order.push(record.clone());
        Ok(record)
    }

    // ---- one-shot convenience API ----

    /// Reads the value at `path` (or the whole document) once the record
    /// is ready, then releases the handle.
    ///
    /// # Errors
    ///
    /// Propagates readiness and path failures; the handle is released
    /// either way.
    pub async fn get(&self, name: &str, path: Option<&str>) -> Result<Option<Value>, ClientError> {
        let record = self.get_record(name)?;
        let result = async {
            record.when_ready().await?;
            match path {
                Some(path) => record.get_path(path),
                None => record.get().map(Some),
            }
        }
        .await;
        record.discard();
        result
    }

    /// Replaces the document root once the record is ready, then releases
    /// the handle. The write resolves when the local apply completes; the
    /// send is asynchronous.
    ///
    /// # Errors
    ///
    /// Propagates readiness and validation failures.
    pub async fn set(&self, name: &str, value: Value) -> Result<(), ClientError> {
        let record = self.get_record(name)?;
        let result = async {
            record.when_ready().await?;
            record.set(value)
        }
        .await;
        record.discard();
        result
    }

    /// Writes `value` at `path` once the record is ready, then releases
    /// the handle.
    ///
    /// # Errors
    ///
    /// Propagates readiness and path failures.
    pub async fn set_path(&self, name: &str, path: &str, value: Value) -> Result<(), ClientError> {
        let record = self.get_record(name)?;
        let result = async {
            record.when_ready().await?;
            record.set_path(path, value)
        }
        .await;
        record.discard();
        result
    }

    /// Awaits readiness, feeds the current value at `path` (root when
    /// `None`) through `updater`, and writes the result back. `updater`
    /// must be pure with respect to the record.
    ///
    /// # Errors
    ///
    /// Propagates readiness, path, and validation failures.
    pub async fn update(
        &self,
        name: &str,
        path: Option<&str>,
        updater: impl FnOnce(Option<Value>) -> Value + Send,
    ) -> Result<(), ClientError> {
        let record = self.get_record(name)?;
        let result = async {
            record.when_ready().await?;
            let current = match path {
                Some(path) => record.get_path(path)?,
                None => Some(record.get()?),
            };
            let next = updater(current);
            match path {
                Some(path) => record.set_path(path, next),
                None => record.set(next),
            }
        }
        .await;
        record.discard();
        result
    }

    /// Streams the record's document: the current value immediately, then
    /// every root change. Dropping the stream unsubscribes and releases
    /// the handle.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidArgument`] for an empty name.
    pub fn observe(&self, name: &str) -> Result<ObserveStream, ClientError> {
        let record = self.get_record(name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = match record.subscribe(
            move |value| {
                let _ = tx.send(value.cloned().unwrap_or(Value::Null));
            },
            true,
        ) {
            Ok(subscription) => subscription,
            Err(err) => {
                record.discard();
                return Err(err);
            }
        };
        Ok(ObserveStream {
            record: Some(record),
            subscription,
            rx,
        })
    }

    // ---- listen ----

    /// Registers a pattern listener. `callback(name, found)` fires when a
    /// record matching the pattern gains its first subscriber (`true`) or
    /// loses its last (`false`). One listener per pattern.
    ///
    /// # Errors
    ///
    /// [`ClientError::ListenerExists`] on a duplicate pattern; the
    /// condition is also reported on the error channel.
    pub fn listen(
        &self,
        pattern: &str,
        callback: impl Fn(&str, bool) + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.contains_key(pattern) {
            drop(listeners);
            self.report(Event::ListenerExists, pattern);
            return Err(ClientError::ListenerExists(pattern.to_owned()));
        }
        let listener = Listener::new(pattern, self.inner.connection.clone(), callback);
        listeners.insert(pattern.to_owned(), Arc::new(listener));
        Ok(())
    }

    /// Starts tearing down the listener for `pattern`. The listener stays
    /// registered until the server acknowledges the `UNLISTEN`.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotListening`] when no listener exists; also
    /// reported on the error channel.
    pub fn unlisten(&self, pattern: &str) -> Result<(), ClientError> {
        let listener = self.inner.listeners.lock().get(pattern).cloned();
        match listener {
            Some(listener) => {
                listener.send_destroy();
                Ok(())
            }
            None => {
                self.report(Event::NotListening, pattern);
                Err(ClientError::NotListening(pattern.to_owned()))
            }
        }
    }

    // ---- inbound routing ----

    pub(crate) fn route(&self, message: &Message) {
        match message.action {
            Action::Ack => self.route_ack(message),
            Action::Error => self.route_error(message),
            Action::SubscriptionForPatternFound | Action::SubscriptionForPatternRemoved => {
                self.route_pattern(message);
            }
            _ => self.route_to_record(message),
        }
    }

    /// Ack frames carry `[original action, name-or-pattern]`. Listener
    /// acks settle the two-phase destroy; everything else is an ack for a
    /// record and is routed to it by name.
    fn route_ack(&self, message: &Message) {
        let original = message.field(0).and_then(Action::parse);
        let subject = message.field(1).unwrap_or_default();
        match original {
            Some(Action::Unlisten) => {
                let mut listeners = self.inner.listeners.lock();
                if listeners
                    .get(subject)
                    .is_some_and(|listener| listener.is_destroy_pending())
                {
                    if let Some(listener) = listeners.remove(subject) {
                        listener.ack_destroy();
                    }
                }
            }
            Some(Action::Listen) => {
                tracing::debug!(pattern = subject, "listen acknowledged");
            }
            _ => self.deliver_to_record(subject, message),
        }
    }

    /// Error frames carry `[event code, name]`. `MESSAGE_DENIED` stays
    /// internal; everything else reaches the client error channel.
    fn route_error(&self, message: &Message) {
        let event = message.field(0).unwrap_or_default();
        let name = message.field(1).unwrap_or_default();
        if Event::parse(event) == Some(Event::MessageDenied) {
            tracing::debug!(name, "record operation denied");
            return;
        }
        self.inner.errors.emit(&ErrorEvent {
            topic: Topic::Record,
            event: event.to_owned(),
            message: name.to_owned(),
        });
    }

    fn route_pattern(&self, message: &Message) {
        let pattern = message.field(0).unwrap_or_default();
        let Some(name) = message.field(1) else {
            return;
        };
        let found = message.action == Action::SubscriptionForPatternFound;
        let listener = self.inner.listeners.lock().get(pattern).cloned();
        if let Some(listener) = listener {
            listener.on_subscription_changed(name, found);
        }
    }

    fn route_to_record(&self, message: &Message) {
        let Some(name) = message.field(0) else {
            return;
        };
        self.deliver_to_record(name, message);
    }

    fn deliver_to_record(&self, name: &str, message: &Message) {
        let record = self.inner.registry.lock().by_name.get(name).cloned();
        match record {
            Some(record) => record.on_message(message),
            None => {
                // Usually a late frame for a record the pruner already
                // dropped; the server learns about it via UNSUBSCRIBE.
                tracing::debug!(name, action = %message.action, "message for unknown record");
            }
        }
    }

    fn report(&self, event: Event, pattern: &str) {
        tracing::warn!(event = event.as_str(), pattern, "listener error");
        self.inner.errors.emit(&ErrorEvent {
            topic: Topic::Record,
            event: event.as_str().to_owned(),
            message: pattern.to_owned(),
        });
    }

    /// Number of live records in the registry.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.registry.lock().by_name.len()
    }

    /// Weak handle for the client's router task, so routing does not keep
    /// the registry alive after the client is dropped.
    pub(crate) fn router_handle(&self) -> RouterHandle {
        RouterHandle(Arc::downgrade(&self.inner))
    }
}

/// Weak routing handle held by the client's inbound dispatch task.
pub(crate) struct RouterHandle(Weak<HandlerInner>);

impl RouterHandle {
    /// Routes a record-topic message. Returns `false` once the handler is
    /// gone and the router task should stop.
    pub(crate) fn route(&self, message: &Message) -> bool {
        match self.0.upgrade() {
            Some(inner) => {
                RecordHandler { inner }.route(message);
                true
            }
            None => false,
        }
    }
}

/// Reacts to connection transitions on behalf of every live record.
///
/// A terminal close destroys all records silently (no `UNSUBSCRIBE` can be
/// delivered anyway) and clears the registry; any other transition is
/// forwarded so records can resubscribe or pause.
fn on_connection_state(inner: &Arc<HandlerInner>, state: ConnectionState) {
    match state {
        ConnectionState::Closed => {
            let doomed: Vec<Record> = {
                let mut registry = inner.registry.lock();
                registry.by_name.clear();
                registry.order.drain(..).collect()
            };
            for record in doomed {
                record.destroy(false);
            }
            inner.listeners.lock().clear();
        }
        other => {
            let records: Vec<Record> = inner.registry.lock().order.clone();
            for record in records {
                record.on_connection_state(other);
            }
        }
    }
}

/// Background scan destroying ready records nobody holds a handle to.
fn spawn_pruner(weak: Weak<HandlerInner>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let doomed = {
                let mut registry = inner.registry.lock();
                let mut doomed = Vec::new();
                let mut index = 0;
                while index < registry.order.len() {
                    let record = &registry.order[index];
                    if record.usages() == 0 && record.is_ready() && !record.is_destroyed() {
                        let record = registry.order.swap_remove(index);
                        registry.by_name.remove(record.name());
                        doomed.push(record);
                    } else {
                        index += 1;
                    }
                }
                doomed
            };
            for record in doomed {
                record.destroy(true);
            }
        }
    });
}

/// Lazy stream over a record's document, produced by
/// [`RecordHandler::observe`].
pub struct ObserveStream {
    record: Option<Record>,
    subscription: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Stream for ObserveStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ObserveStream {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let _ = record.unsubscribe(self.subscription);
            record.discard();
        }
    }
}
