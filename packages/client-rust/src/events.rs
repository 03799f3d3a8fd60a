//! Small typed pub/sub used for client, connection, and record events.
//!
//! A tagged set of known events is the contract between components; there
//! is no event base class. Each event kind gets its own `Emitter<T>` and
//! subscribers are plain closures.

use std::sync::Arc;

use parking_lot::Mutex;

/// Handle identifying one subscription on an [`Emitter`] or a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

struct Subscriber<T> {
    id: u64,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

struct EmitterInner<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// A typed event channel with multiple subscribers.
///
/// Cloning shares the subscriber registry. `emit` snapshots the subscriber
/// list before invoking, so callbacks may subscribe or unsubscribe
/// re-entrantly without deadlocking.
pub struct Emitter<T> {
    inner: Arc<Mutex<EmitterInner<T>>>,
}

impl<T> Emitter<T> {
    /// Creates an emitter with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                next_id: 1,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Registers a callback, returning the id used to unsubscribe it.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            callback: Arc::new(callback),
        });
        SubscriptionId(id)
    }

    /// Removes a subscription. Returns `false` when the id is not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|subscriber| subscriber.id != id.0);
        inner.subscribers.len() != before
    }

    /// Invokes every subscriber with `value`.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Arc<dyn Fn(&T) + Send + Sync>> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|subscriber| Arc::clone(&subscriber.callback))
                .collect()
        };
        for callback in snapshot {
            callback(value);
        }
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Returns `true` when no subscriptions are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_all_subscribers() {
        let emitter: Emitter<u32> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            emitter.subscribe(move |value| {
                count.fetch_add(*value as usize, Ordering::SeqCst);
            });
        }

        emitter.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribe_removes_only_target() {
        let emitter: Emitter<()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let keep = {
            let count = Arc::clone(&count);
            emitter.subscribe(move |()| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let drop_me = {
            let count = Arc::clone(&count);
            emitter.subscribe(move |()| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };

        assert!(emitter.unsubscribe(drop_me));
        assert!(!emitter.unsubscribe(drop_me));
        emitter.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(emitter.unsubscribe(keep));
        assert!(emitter.is_empty());
    }

    #[test]
    fn reentrant_unsubscribe_does_not_deadlock() {
        let emitter: Emitter<()> = Emitter::new();
        let emitter_clone = emitter.clone();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let id = emitter.subscribe(move |()| {
            if let Some(id) = *slot_clone.lock() {
                emitter_clone.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        emitter.emit(&());
        assert!(emitter.is_empty());
    }

    #[test]
    fn clone_shares_subscribers() {
        let emitter: Emitter<u32> = Emitter::new();
        let clone = emitter.clone();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        emitter.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        clone.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
