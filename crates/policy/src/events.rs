//! Listener registry used for policy observability callbacks
//!
//! Every policy exposes its events through [`Listeners`]. Emitting calls the
//! listeners that are registered at the moment of the emit; a listener added
//! or removed from inside a callback takes effect from the next emit on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;
type Registry<A> = RwLock<Vec<(u64, Listener<A>)>>;

/// A set of callbacks receiving events of type `A` by reference
pub struct Listeners<A> {
    registry: Arc<Registry<A>>,
    next_id: AtomicU64,
}

impl<A: 'static> Listeners<A> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { registry: Arc::new(RwLock::new(Vec::new())), next_id: AtomicU64::new(0) }
    }

    /// Register a listener, returning a handle that removes it again
    pub fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().push((id, Arc::new(listener)));

        let registry: Weak<Registry<A>> = Arc::downgrade(&self.registry);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.write().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Call every listener registered at this moment
    pub fn emit(&self, event: &A) {
        // Snapshot so callbacks can add or remove listeners without deadlocking.
        let listeners: Vec<Listener<A>> =
            self.registry.read().iter().map(|(_, listener)| Arc::clone(listener)).collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    /// True when no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: 'static> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Listeners<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.registry.read().len()).finish()
    }
}

/// Handle returned by [`Listeners::add`]
///
/// Dropping the handle keeps the listener registered; call
/// [`dispose`](ListenerHandle::dispose) to remove it.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Remove the listener from its registry
    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("active", &self.remove.is_some()).finish()
    }
}

/// Emitted when an execution produced an accepted result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessEvent {
    /// Time spent in the operation
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Validates add/emit/dispose on the listener registry.
    ///
    /// Assertions:
    /// - Confirms both listeners observe the first emit.
    /// - Confirms a disposed listener is no longer called.
    #[test]
    fn test_add_emit_dispose() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));

        let first = {
            let total = Arc::clone(&total);
            listeners.add(move |value| {
                total.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };
        let _second = {
            let total = Arc::clone(&total);
            listeners.add(move |value| {
                total.fetch_add(*value as usize * 10, Ordering::SeqCst);
            })
        };

        listeners.emit(&1);
        assert_eq!(total.load(Ordering::SeqCst), 11);
        assert_eq!(listeners.len(), 2);

        first.dispose();
        listeners.emit(&1);
        assert_eq!(total.load(Ordering::SeqCst), 21);
        assert_eq!(listeners.len(), 1);
    }

    /// Validates that a listener registered during an emit only sees later
    /// events.
    ///
    /// Assertions:
    /// - Confirms the nested listener is not called by the emit that added it.
    #[test]
    fn test_listener_added_during_emit_waits_for_next_emit() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let nested_calls = Arc::new(AtomicUsize::new(0));

        {
            let registry = Arc::clone(&listeners);
            let nested_calls = Arc::clone(&nested_calls);
            let _handle = listeners.add(move |()| {
                let nested_calls = Arc::clone(&nested_calls);
                let _nested = registry.add(move |()| {
                    nested_calls.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        listeners.emit(&());
        assert_eq!(nested_calls.load(Ordering::SeqCst), 0);

        listeners.emit(&());
        assert_eq!(nested_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_after_registry_dropped_is_noop() {
        let listeners: Listeners<u8> = Listeners::new();
        let handle = listeners.add(|_| {});
        drop(listeners);
        handle.dispose();
    }
}
