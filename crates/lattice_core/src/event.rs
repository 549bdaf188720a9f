//! Callback registry for event subscriptions.
//!
//! This module provides a thread-safe registry for managing event callbacks,
//! generic over the event type. Subscriptions are RAII guards: dropping a
//! [`CallbackSubscription`] unsubscribes the callback, so concurrent
//! consumers can observe the same event source without clobbering each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for events of type `E`.
///
/// Callbacks receive a reference to the event and should not block for
/// extended periods.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe registry for managing event subscriptions.
///
/// The registry supports:
/// - Subscribing to events with RAII subscription guards
/// - Emitting events to all active subscribers
/// - Clearing all subscriptions at once (used on space close)
///
/// Cloning the registry is cheap and shares the same subscriber set.
pub struct CallbackRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

struct RegistryInner<E> {
    /// Map of subscription IDs to callbacks.
    callbacks: RwLock<HashMap<SubscriptionId, Callback<E>>>,
    /// Counter for generating unique subscription IDs.
    next_id: AtomicU64,
}

impl<E> CallbackRegistry<E> {
    /// Create a new empty callback registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                callbacks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to events.
    ///
    /// The callback stays registered until the returned guard is dropped or
    /// the registry is cleared.
    pub fn subscribe(&self, callback: Callback<E>) -> CallbackSubscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.inner.callbacks.write().unwrap();
        callbacks.insert(id, callback);
        CallbackSubscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Emit an event to all registered callbacks.
    ///
    /// Callbacks are invoked synchronously in an undefined order. The
    /// subscriber set is snapshotted before invocation so callbacks may
    /// subscribe or unsubscribe without deadlocking. If a callback panics,
    /// it does not affect other callbacks.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let callbacks = self.inner.callbacks.read().unwrap();
            callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.inner.callbacks.read().unwrap();
        callbacks.len()
    }

    /// Check if there are any active subscriptions.
    pub fn has_subscribers(&self) -> bool {
        let callbacks = self.inner.callbacks.read().unwrap();
        !callbacks.is_empty()
    }

    /// Clear all subscriptions.
    ///
    /// Outstanding subscription guards become inert.
    pub fn clear(&self) {
        let mut callbacks = self.inner.callbacks.write().unwrap();
        callbacks.clear();
    }
}

impl<E> Clone for CallbackRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for CallbackRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = self.inner.callbacks.read().unwrap();
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &callbacks.len())
            .finish()
    }
}

/// RAII guard for a registered callback.
///
/// Dropping the guard removes the callback from the registry.
pub struct CallbackSubscription<E> {
    registry: Weak<RegistryInner<E>>,
    id: SubscriptionId,
}

impl<E> CallbackSubscription<E> {
    /// The identifier of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<E> Drop for CallbackSubscription<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut callbacks = inner.callbacks.write().unwrap();
            callbacks.remove(&self.id);
        }
    }
}

impl<E> std::fmt::Debug for CallbackSubscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSubscription")
            .field("id", &self.id)
            .finish()
    }
}
