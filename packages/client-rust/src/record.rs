//! Per-record synchronization state machine.
//!
//! A record is created lazily by the registry and immediately asks the
//! server for its current state with `READ`. Until the first `UPDATE`
//! arrives the record is not ready: local writes apply to the provisional
//! snapshot and are also queued, then replayed on top of the server's
//! snapshot at ready time. After that, local writes bump the version token
//! and dispatch updates, while remote updates are version-gated so stale
//! echoes and reordered frames are dropped.
//!
//! Subscriber callbacks fire after the data swap, so reading the record
//! from inside a callback observes the new state.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::watch;

use syncwire_core::{parse_typed, path, Action, Event, Message, Outcome, Topic, Version};

use crate::connection::Connection;
use crate::error::{ClientError, ErrorEvent};
use crate::events::{Emitter, SubscriptionId};

/// Where a record is in its lifecycle. Drives [`Record::when_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordPhase {
    Pending,
    Ready,
    Destroyed,
}

/// A write accepted before the record was ready, to be replayed on top of
/// the server's initial snapshot. `path: None` is a root replacement.
struct PatchQueueEntry {
    path: Option<String>,
    data: Value,
}

type PathCallback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

struct PathSubscription {
    id: u64,
    path: Option<String>,
    callback: PathCallback,
}

struct RecordState {
    data: Value,
    version: Option<Version>,
    is_ready: bool,
    is_subscribed: bool,
    is_destroyed: bool,
    has_provider: bool,
    patch_queue: Vec<PatchQueueEntry>,
    subscriptions: Vec<PathSubscription>,
    next_subscription: u64,
}

struct RecordInner {
    name: String,
    connection: Connection,
    errors: Emitter<ErrorEvent>,
    state: Mutex<RecordState>,
    usages: AtomicUsize,
    phase_tx: watch::Sender<RecordPhase>,
    ready_events: Emitter<()>,
    destroy_events: Emitter<()>,
    provider_events: Emitter<bool>,
}

/// A named, versioned JSON document synchronized with the server.
///
/// Cloning shares the underlying record; the registry tracks how many
/// handles are outstanding through the usage count, and the pruner
/// destroys ready records once that count reaches zero.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub(crate) fn new(name: &str, connection: Connection, errors: Emitter<ErrorEvent>) -> Self {
        let (phase_tx, _phase_rx) = watch::channel(RecordPhase::Pending);
        let record = Self {
            inner: Arc::new(RecordInner {
                name: name.to_owned(),
                connection,
                errors,
                state: Mutex::new(RecordState {
                    data: Value::Null,
                    version: None,
                    is_ready: false,
                    is_subscribed: true,
                    is_destroyed: false,
                    has_provider: false,
                    patch_queue: Vec::new(),
                    subscriptions: Vec::new(),
                    next_subscription: 1,
                }),
                usages: AtomicUsize::new(0),
                phase_tx,
                ready_events: Emitter::new(),
                destroy_events: Emitter::new(),
                provider_events: Emitter::new(),
            }),
        };
        record
            .inner
            .connection
            .send_message(Topic::Record, Action::Read, &[name]);
        record
    }

    // ---- accessors ----

    /// The record's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the initial server snapshot has been applied.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().is_ready
    }

    /// Whether the record has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().is_destroyed
    }

    /// Whether the server reported an authoritative provider for this record.
    #[must_use]
    pub fn has_provider(&self) -> bool {
        self.inner.state.lock().has_provider
    }

    /// The current version token, unset before the initial read completes.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.inner.state.lock().version.clone()
    }

    /// Number of outstanding handles tracked by the registry.
    #[must_use]
    pub fn usages(&self) -> usize {
        self.inner.usages.load(Ordering::SeqCst)
    }

    // ---- reads ----

    /// Returns the whole document.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn get(&self) -> Result<Value, ClientError> {
        let state = self.inner.state.lock();
        self.check_destroyed(&state)?;
        Ok(path::get(&state.data, "")?
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Returns the value at `path`, or `None` when the slot is absent.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction, or a path error
    /// when `path` descends through a primitive.
    pub fn get_path(&self, path: &str) -> Result<Option<Value>, ClientError> {
        let state = self.inner.state.lock();
        self.check_destroyed(&state)?;
        Ok(path::get(&state.data, path)?.cloned())
    }

    // ---- writes ----

    /// Replaces the whole document. The value must be an object.
    ///
    /// Before the record is ready the write clears the patch queue (it
    /// supersedes any queued patches) and is itself queued for replay on
    /// top of the server snapshot. A write that leaves the document
    /// structurally unchanged is a silent no-op.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidArgument`] for a non-object root value, or
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn set(&self, value: Value) -> Result<(), ClientError> {
        if !value.is_object() {
            return Err(ClientError::InvalidArgument(
                "root write requires an object".to_owned(),
            ));
        }
        self.apply_local(None, value)
    }

    /// Writes `value` at `path`.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidArgument`] for an empty path (use [`Record::set`]),
    /// [`ClientError::RecordDestroyed`] after destruction, or a path error.
    pub fn set_path(&self, path: &str, value: Value) -> Result<(), ClientError> {
        if path.is_empty() {
            return Err(ClientError::InvalidArgument(
                "path must not be empty, use set() for root writes".to_owned(),
            ));
        }
        self.apply_local(Some(path), value)
    }

    fn apply_local(&self, at: Option<&str>, value: Value) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock();
        self.check_destroyed(&state)?;

        let for_queue = (!state.is_ready).then(|| value.clone());
        let outcome = path::set(&state.data, at.unwrap_or(""), value)?;

        if let Some(data) = for_queue {
            match at {
                Some(p) => state.patch_queue.push(PatchQueueEntry {
                    path: Some(p.to_owned()),
                    data,
                }),
                None => {
                    // A root replacement supersedes everything queued so far.
                    state.patch_queue.clear();
                    state.patch_queue.push(PatchQueueEntry { path: None, data });
                }
            }
        }

        let Outcome::Changed(new_data) = outcome else {
            return Ok(());
        };
        let old_data = mem::replace(&mut state.data, new_data);

        let outbound = if state.is_ready {
            Some(Self::next_outbound(&mut state))
        } else {
            None
        };
        let notifications = Self::collect_notifications(&state, &old_data);
        drop(state);

        if let Some((version, prev, json)) = outbound {
            self.send_update(&version, prev.as_ref(), &json);
        }
        Self::fire(notifications);
        Ok(())
    }

    /// Bumps the version for a local write and snapshots what the update
    /// frame needs. Ready implies a version is present; the fallback keeps
    /// the bump total anyway.
    fn next_outbound(state: &mut RecordState) -> (Version, Option<Version>, String) {
        let prev = state.version.clone();
        let next = prev
            .as_ref()
            .map_or_else(|| Version::new(1, syncwire_core::fresh_nonce()), Version::next);
        state.version = Some(next.clone());
        (next, prev, state.data.to_string())
    }

    fn send_update(&self, version: &Version, prev: Option<&Version>, json: &str) {
        let version = version.to_string();
        match prev {
            Some(prev) => self.inner.connection.send_message(
                Topic::Record,
                Action::Update,
                &[&self.inner.name, &version, json, &prev.to_string()],
            ),
            None => self.inner.connection.send_message(
                Topic::Record,
                Action::Update,
                &[&self.inner.name, &version, json],
            ),
        }
    }

    // ---- subscriptions ----

    /// Subscribes to root changes. With `trigger_now`, the callback fires
    /// synchronously with the current document.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn subscribe(
        &self,
        callback: impl Fn(Option<&Value>) + Send + Sync + 'static,
        trigger_now: bool,
    ) -> Result<SubscriptionId, ClientError> {
        self.subscribe_inner(None, Arc::new(callback), trigger_now)
    }

    /// Subscribes to changes of the value at `path`.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn subscribe_path(
        &self,
        path: &str,
        callback: impl Fn(Option<&Value>) + Send + Sync + 'static,
        trigger_now: bool,
    ) -> Result<SubscriptionId, ClientError> {
        self.subscribe_inner(Some(path), Arc::new(callback), trigger_now)
    }

    fn subscribe_inner(
        &self,
        path: Option<&str>,
        callback: PathCallback,
        trigger_now: bool,
    ) -> Result<SubscriptionId, ClientError> {
        let mut state = self.inner.state.lock();
        self.check_destroyed(&state)?;
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.push(PathSubscription {
            id,
            path: path.map(str::to_owned),
            callback: Arc::clone(&callback),
        });
        let immediate = if trigger_now {
            path::get(&state.data, path.unwrap_or(""))
                .ok()
                .flatten()
                .cloned()
        } else {
            None
        };
        drop(state);
        if let Some(value) = immediate {
            callback(Some(&value));
        }
        Ok(SubscriptionId(id))
    }

    /// Removes one subscription. Returns `false` when the id is unknown.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, ClientError> {
        let mut state = self.inner.state.lock();
        self.check_destroyed(&state)?;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.id != id.0);
        Ok(state.subscriptions.len() != before)
    }

    /// Removes every subscription registered for `path` (`None` = root).
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] after destruction.
    pub fn unsubscribe_path(&self, path: Option<&str>) -> Result<usize, ClientError> {
        let mut state = self.inner.state.lock();
        self.check_destroyed(&state)?;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.path.as_deref() != path);
        Ok(before - state.subscriptions.len())
    }

    // ---- lifecycle ----

    /// Resolves once the initial server snapshot has been applied.
    ///
    /// # Errors
    ///
    /// [`ClientError::RecordDestroyed`] when the record is destroyed before
    /// (or after) becoming ready.
    pub async fn when_ready(&self) -> Result<(), ClientError> {
        let mut phase = self.inner.phase_tx.subscribe();
        loop {
            let current = *phase.borrow();
            match current {
                RecordPhase::Ready => return Ok(()),
                RecordPhase::Destroyed => {
                    return Err(ClientError::RecordDestroyed(self.inner.name.clone()));
                }
                RecordPhase::Pending => {}
            }
            if phase.changed().await.is_err() {
                return Err(ClientError::RecordDestroyed(self.inner.name.clone()));
            }
        }
    }

    /// Releases one handle. Destruction itself is the registry's job: the
    /// pruner destroys ready records whose usage count is zero.
    pub fn discard(&self) {
        let _ = self
            .inner
            .usages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |usages| {
                usages.checked_sub(1)
            });
    }

    pub(crate) fn retain(&self) {
        self.inner.usages.fetch_add(1, Ordering::SeqCst);
    }

    /// Fires when the record becomes ready.
    pub fn on_ready(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.inner.ready_events.subscribe(move |()| callback())
    }

    /// Fires when the record is destroyed.
    pub fn on_destroy(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.inner.destroy_events.subscribe(move |()| callback())
    }

    /// Fires when the server's provider indication changes.
    pub fn on_has_provider_changed(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.provider_events.subscribe(move |flag| callback(*flag))
    }

    /// Tears the record down. Sends `UNSUBSCRIBE` when requested and the
    /// record still holds a server subscription. Idempotent.
    pub(crate) fn destroy(&self, send_unsubscribe: bool) {
        let mut state = self.inner.state.lock();
        if state.is_destroyed {
            return;
        }
        state.is_destroyed = true;
        let was_subscribed = state.is_subscribed;
        state.is_subscribed = false;
        state.is_ready = false;
        state.subscriptions.clear();
        state.patch_queue.clear();
        drop(state);

        if send_unsubscribe && was_subscribed {
            self.inner
                .connection
                .send_message(Topic::Record, Action::Unsubscribe, &[&self.inner.name]);
        }
        let _ = self.inner.phase_tx.send(RecordPhase::Destroyed);
        self.inner.destroy_events.emit(&());
        tracing::debug!(name = %self.inner.name, "record destroyed");
    }

    // ---- inbound ----

    pub(crate) fn on_message(&self, message: &Message) {
        match message.action {
            Action::Update => self.on_remote_update(message),
            Action::SubscriptionHasProvider => self.on_has_provider(message),
            Action::Ack => {
                // Read/subscribe acks confirm delivery and carry no state.
                tracing::trace!(
                    name = %self.inner.name,
                    acked = message.field(0).unwrap_or_default(),
                    "record acknowledgment"
                );
            }
            _ => {
                tracing::debug!(
                    name = %self.inner.name,
                    action = %message.action,
                    "unexpected record action"
                );
            }
        }
    }

    fn on_remote_update(&self, message: &Message) {
        let (Some(version_raw), Some(json_raw)) = (message.field(1), message.field(2)) else {
            self.report_parse("update frame is missing version or body");
            return;
        };
        let version: Version = match version_raw.parse() {
            Ok(version) => version,
            Err(err) => {
                self.report_parse(&err.to_string());
                return;
            }
        };
        let data: Value = match serde_json::from_str(json_raw) {
            Ok(data) => data,
            Err(err) => {
                self.report_parse(&err.to_string());
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.is_destroyed {
            return;
        }
        if !state.is_ready {
            self.finish_read(state, version, data);
            return;
        }

        // Reconciliation: an update that is not strictly newer is a
        // duplicate or a reordered echo of this client's own write.
        if state.version.as_ref().is_some_and(|current| version <= *current) {
            tracing::debug!(
                name = %self.inner.name,
                incoming = %version,
                "dropping stale update"
            );
            return;
        }
        state.version = Some(version);
        match syncwire_core::patch(&state.data, data) {
            Outcome::Unchanged => {}
            Outcome::Changed(new_data) => {
                let old_data = mem::replace(&mut state.data, new_data);
                let notifications = Self::collect_notifications(&state, &old_data);
                drop(state);
                Self::fire(notifications);
            }
        }
    }

    /// Applies the initial server snapshot: queued patches replay in order
    /// on top of it, and if the replay changed anything the result is
    /// immediately dispatched back as a follow-up update.
    fn finish_read(
        &self,
        mut state: MutexGuard<'_, RecordState>,
        server_version: Version,
        server_data: Value,
    ) {
        let mut merged = server_data.clone();
        for entry in mem::take(&mut state.patch_queue) {
            let at = entry.path.as_deref().unwrap_or("");
            match path::set(&merged, at, entry.data) {
                Ok(Outcome::Changed(next)) => merged = next,
                Ok(Outcome::Unchanged) => {}
                Err(err) => {
                    tracing::debug!(
                        name = %self.inner.name,
                        error = %err,
                        "queued patch no longer applies, dropping it"
                    );
                }
            }
        }

        let diverged = merged != server_data;
        let old_data = mem::replace(&mut state.data, merged);
        state.is_ready = true;
        let outbound = if diverged {
            let next = server_version.next();
            state.version = Some(next.clone());
            Some((next, Some(server_version), state.data.to_string()))
        } else {
            state.version = Some(server_version);
            None
        };
        let notifications = Self::collect_notifications(&state, &old_data);
        drop(state);

        let _ = self.inner.phase_tx.send(RecordPhase::Ready);
        self.inner.ready_events.emit(&());
        if let Some((version, prev, json)) = outbound {
            self.send_update(&version, prev.as_ref(), &json);
        }
        Self::fire(notifications);
    }

    fn on_has_provider(&self, message: &Message) {
        let flag = message
            .field(1)
            .and_then(|raw| parse_typed(raw).ok())
            .and_then(|value| value.as_bool());
        let Some(flag) = flag else {
            self.report_parse("has-provider frame carries no boolean flag");
            return;
        };
        {
            let mut state = self.inner.state.lock();
            if state.is_destroyed || state.has_provider == flag {
                return;
            }
            state.has_provider = flag;
        }
        self.inner.provider_events.emit(&flag);
    }

    // ---- connection reactions ----

    pub(crate) fn on_connection_state(&self, state: syncwire_core::ConnectionState) {
        use syncwire_core::ConnectionState;
        match state {
            ConnectionState::Open => {
                let resubscribe = {
                    let mut guard = self.inner.state.lock();
                    if guard.is_destroyed || guard.is_subscribed {
                        false
                    } else {
                        guard.is_subscribed = true;
                        true
                    }
                };
                if resubscribe {
                    self.inner
                        .connection
                        .send_message(Topic::Record, Action::Read, &[&self.inner.name]);
                }
            }
            ConnectionState::Reconnecting => {
                self.inner.state.lock().is_subscribed = false;
            }
            _ => {}
        }
    }

    // ---- change propagation ----

    /// Pairs every subscription whose value changed with the new value.
    /// Runs under the state lock; the callbacks themselves are invoked by
    /// [`Record::fire`] after the lock is released.
    fn collect_notifications(
        state: &RecordState,
        old_data: &Value,
    ) -> Vec<(PathCallback, Option<Value>)> {
        state
            .subscriptions
            .iter()
            .filter_map(|sub| {
                let at = sub.path.as_deref().unwrap_or("");
                let old_value = path::get(old_data, at).ok().flatten();
                let new_value = path::get(&state.data, at).ok().flatten();
                if old_value == new_value {
                    None
                } else {
                    Some((Arc::clone(&sub.callback), new_value.cloned()))
                }
            })
            .collect()
    }

    fn fire(notifications: Vec<(PathCallback, Option<Value>)>) {
        for (callback, value) in notifications {
            callback(value.as_ref());
        }
    }

    fn check_destroyed(&self, state: &RecordState) -> Result<(), ClientError> {
        if state.is_destroyed {
            Err(ClientError::RecordDestroyed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    fn report_parse(&self, detail: &str) {
        tracing::warn!(name = %self.inner.name, detail, "record frame parse failure");
        self.inner.errors.emit(&ErrorEvent {
            topic: Topic::Record,
            event: Event::MessageParseError.as_str().to_owned(),
            message: format!("{}: {detail}", self.inner.name),
        });
    }
}
