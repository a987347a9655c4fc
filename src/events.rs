// ABOUTME: Subscriber list used for every callback surface in the crate
// ABOUTME: Subscribe/unsubscribe/emit with panic isolation at the delivery boundary

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier returned by every subscribe call
pub type SubscriptionId = u64;

/// Shared handler type stored by an [`EventHub`]
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique subscription id
///
/// Ids are unique across hubs so an object exposing several hubs can accept
/// a single `unsubscribe(id)` call.
pub fn next_subscription_id() -> SubscriptionId {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A list of event handlers
///
/// `emit` snapshots the handler list before invoking anything, so handlers
/// may subscribe or unsubscribe from inside a callback without deadlocking.
pub struct EventHub<T> {
    name: &'static str,
    handlers: RwLock<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> EventHub<T> {
    /// Create an empty hub; `name` is used in log output
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = next_subscription_id();
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler, returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Check if no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver an event to every handler
    ///
    /// A panicking handler is logged and skipped; the remaining handlers still
    /// run. Returns the number of handlers that completed normally.
    pub fn emit(&self, event: &T) -> usize {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    log::error!("{} handler panicked: {}", self.name, panic_message(panic.as_ref()));
                }
            }
        }
        delivered
    }
}

impl<T> std::fmt::Debug for EventHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let hub = EventHub::<u32>::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        let total_clone = total.clone();
        let id = hub.subscribe(move |value| {
            total_clone.fetch_add(*value as usize, Ordering::SeqCst);
        });

        assert_eq!(hub.emit(&5), 1);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.emit(&7), 0);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let hub = EventHub::<()>::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        hub.subscribe(|_| panic!("handler failure"));
        let calls_clone = calls.clone();
        hub.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hub.emit(&()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_from_inside_handler() {
        let hub = Arc::new(EventHub::<()>::new("test"));
        let hub_clone = hub.clone();
        let id = Arc::new(AtomicU64::new(0));
        let id_clone = id.clone();

        let sub = hub.subscribe(move |_| {
            hub_clone.unsubscribe(id_clone.load(Ordering::SeqCst));
        });
        id.store(sub, Ordering::SeqCst);

        hub.emit(&());
        assert!(hub.is_empty());
    }

    #[test]
    fn test_panic_message_payloads() {
        let literal = catch_unwind(|| panic!("literal")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "literal");

        let formatted = catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "code 7");

        let other = catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
