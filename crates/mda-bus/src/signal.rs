//! Handler registry for one kind of notification.
//!
//! A [`Signal`] keeps its handlers in subscription order and invokes them
//! synchronously on the emitting thread. Emission works on a snapshot of the
//! handler list, so a handler may subscribe or unsubscribe (itself included)
//! without deadlocking.

use mda_core::SubscriptionHandle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, thread-safe callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Source of subscription ids. Signals that share one can be unsubscribed
/// through a single handle namespace.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Signal<T> {
    name: &'static str,
    handlers: RwLock<Vec<(SubscriptionHandle, Handler<T>)>>,
    ids: Arc<HandleAllocator>,
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_ids(name, Arc::new(HandleAllocator::new()))
    }

    pub fn with_ids(name: &'static str, ids: Arc<HandleAllocator>) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            ids,
        }
    }

    pub fn connect<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.connect_shared(Arc::new(handler))
    }

    pub fn connect_shared(&self, handler: Handler<T>) -> SubscriptionHandle {
        let handle = self.ids.allocate();
        self.handlers.write().push((handle, handler));
        tracing::debug!(signal = self.name, handle = handle.id(), "Handler connected");
        handle
    }

    /// Returns false if the handle was not connected to this signal.
    pub fn disconnect(&self, handle: SubscriptionHandle) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != handle);
        let removed = handlers.len() != before;
        if removed {
            tracing::debug!(signal = self.name, handle = handle.id(), "Handler disconnected");
        }
        removed
    }

    /// Invoke every connected handler, in subscription order.
    ///
    /// Returns the number of handlers called.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Handler<T>> = {
            let handlers = self.handlers.read();
            if handlers.is_empty() {
                return 0;
            }
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        for handler in &snapshot {
            handler(value);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn disconnect_all(&self) {
        self.handlers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let signal: Signal<u32> = Signal::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            signal.connect(move |v: &u32| seen.lock().push(format!("{tag}{v}")));
        }

        assert_eq!(signal.emit(&1), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_disconnect() {
        let signal: Signal<u32> = Signal::new("test");
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handle = signal.connect(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        signal.emit(&0);
        assert!(signal.disconnect(handle));
        assert!(!signal.disconnect(handle));
        signal.emit(&0);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(signal.is_empty());
    }

    #[test]
    fn test_handler_can_unsubscribe_itself() {
        let signal: Arc<Signal<u32>> = Arc::new(Signal::new("test"));
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let sig = Arc::clone(&signal);
        let own = Arc::clone(&slot);
        let handle = signal.connect(move |_| {
            if let Some(h) = *own.lock() {
                sig.disconnect(h);
            }
        });
        *slot.lock() = Some(handle);

        assert_eq!(signal.emit(&0), 1);
        assert_eq!(signal.emit(&0), 0);
    }

    #[test]
    fn test_shared_ids_are_unique() {
        let ids = Arc::new(HandleAllocator::new());
        let a: Signal<u32> = Signal::with_ids("a", Arc::clone(&ids));
        let b: Signal<String> = Signal::with_ids("b", ids);
        let ha = a.connect(|_| {});
        let hb = b.connect(|_| {});
        assert_ne!(ha, hb);
        assert!(!a.disconnect(hb));
    }
}
