//! Pattern listeners: server-side notifications when records matching a
//! pattern gain or lose subscribers.
//!
//! Destruction is two-phase: `UNLISTEN` is sent first, and the listener is
//! only dropped from the handler's map once the server acknowledges it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use syncwire_core::{Action, Topic};

use crate::connection::Connection;

type ListenCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

pub(crate) struct Listener {
    pattern: String,
    connection: Connection,
    callback: ListenCallback,
    destroy_pending: AtomicBool,
}

impl Listener {
    /// Registers the pattern with the server.
    pub(crate) fn new(
        pattern: &str,
        connection: Connection,
        callback: impl Fn(&str, bool) + Send + Sync + 'static,
    ) -> Self {
        connection.send_message(Topic::Record, Action::Listen, &[pattern]);
        Self {
            pattern: pattern.to_owned(),
            connection,
            callback: Arc::new(callback),
            destroy_pending: AtomicBool::new(false),
        }
    }

    /// Routes a pattern-match notification: `found` is `true` when a
    /// matching record gained its first subscriber, `false` when the last
    /// one went away.
    pub(crate) fn on_subscription_changed(&self, name: &str, found: bool) {
        (self.callback)(name, found);
    }

    /// First phase of destruction: tell the server. The handler keeps the
    /// listener until [`Listener::is_destroy_pending`] and the `UNLISTEN`
    /// acknowledgment meet.
    pub(crate) fn send_destroy(&self) {
        if !self.destroy_pending.swap(true, Ordering::SeqCst) {
            self.connection
                .send_message(Topic::Record, Action::Unlisten, &[&self.pattern]);
        }
    }

    pub(crate) fn is_destroy_pending(&self) -> bool {
        self.destroy_pending.load(Ordering::SeqCst)
    }

    /// Second phase: the server acknowledged the unlisten.
    pub(crate) fn ack_destroy(&self) {
        tracing::debug!(pattern = %self.pattern, "listener destroyed");
    }
}
