//! Thread-safe multi-subscriber callback registry.
//!
//! A [`Listeners`] registry hands out a [`ListenerToken`] for every callback added to
//! it. The registry keeps each registration alive; the token keeps a weak
//! back-reference to the registry so that [`ListenerToken::remove`] can unregister
//! itself from any thread, any number of times, including from inside the callback
//! while the registry is being called.
//!
//! ```rust,ignore
//! let listeners: Listeners<dyn Fn(u32) + Send + Sync> = Listeners::new();
//! let token = listeners.add(Arc::new(|n| println!("got {n}")));
//! listeners.call(|cb| cb(42));
//! token.remove();
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// A registry of callbacks of type `F` (usually `dyn Fn(..) + Send + Sync`).
pub struct Listeners<F: ?Sized> {
    registry: Arc<Registry<F>>,
}

struct Registry<F: ?Sized> {
    tokens: Mutex<Vec<Arc<Registration<F>>>>,
}

struct Registration<F: ?Sized> {
    callback: Mutex<Option<Arc<F>>>,
    owner: Mutex<Weak<Registry<F>>>,
}

/// Object-safe view of a registration, so tokens need not be generic.
trait Revocable: Send + Sync {
    fn remove(&self);
    fn is_active(&self) -> bool;
}

/// Handle for one registered callback.
///
/// Dropping the token does not unregister the callback; call [`remove`](Self::remove).
#[derive(Clone)]
pub struct ListenerToken {
    registration: Arc<dyn Revocable>,
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                tokens: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a callback and returns its token.
    pub fn add(&self, callback: Arc<F>) -> ListenerToken {
        let registration = Arc::new(Registration {
            callback: Mutex::new(Some(callback)),
            owner: Mutex::new(Arc::downgrade(&self.registry)),
        });
        self.registry.tokens.lock().push(Arc::clone(&registration));
        ListenerToken { registration }
    }

    /// Invokes `invoke` once for every registered callback, in registration order.
    ///
    /// The registry lock is not held while callbacks run. Callbacks added during the
    /// pass are not visited; callbacks removed during the pass are skipped.
    pub fn call(&self, mut invoke: impl FnMut(&F)) {
        let snapshot: Vec<Arc<Registration<F>>> = self.registry.tokens.lock().clone();
        for registration in snapshot {
            let callback = registration.callback.lock().clone();
            if let Some(callback) = callback {
                invoke(&callback);
            }
        }
    }

    /// Returns true if no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.registry.tokens.lock().is_empty()
    }

    /// Returns the number of registered callbacks.
    pub fn len(&self) -> usize {
        self.registry.tokens.lock().len()
    }

    /// Returns true if `token` was issued by this registry and is still registered.
    pub fn contains(&self, token: &ListenerToken) -> bool {
        let target = Arc::as_ptr(&token.registration) as *const ();
        self.registry
            .tokens
            .lock()
            .iter()
            .any(|t| Arc::as_ptr(t) as *const () == target)
    }

    /// Removes every callback.
    pub fn clear(&self) {
        let tokens = std::mem::take(&mut *self.registry.tokens.lock());
        for token in tokens {
            token.detach();
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Listeners<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.registry.tokens.lock().len())
            .finish()
    }
}

impl<F: ?Sized> Drop for Registry<F> {
    fn drop(&mut self) {
        for token in self.tokens.get_mut().drain(..) {
            token.detach();
        }
    }
}

impl<F: ?Sized> Registration<F> {
    /// Clears the callback so queued notifications racing with removal do nothing.
    fn detach(&self) {
        *self.owner.lock() = Weak::new();
        *self.callback.lock() = None;
    }
}

impl<F: ?Sized + Send + Sync + 'static> Revocable for Registration<F> {
    fn remove(&self) {
        let owner = std::mem::take(&mut *self.owner.lock());
        *self.callback.lock() = None;
        if let Some(registry) = owner.upgrade() {
            registry
                .tokens
                .lock()
                .retain(|t| !std::ptr::eq(Arc::as_ptr(t), self));
        }
    }

    fn is_active(&self) -> bool {
        self.callback.lock().is_some()
    }
}

impl ListenerToken {
    /// Unregisters the callback. Idempotent and safe to call from within the callback.
    pub fn remove(&self) {
        self.registration.remove();
    }

    /// Returns false once the callback has been removed.
    pub fn is_active(&self) -> bool {
        self.registration.is_active()
    }
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerToken")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = dyn Fn(usize) + Send + Sync;

    #[test]
    fn add_call_remove() {
        let listeners: Listeners<Callback> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let token = listeners.add(Arc::new(move |n| {
            h.fetch_add(n, Ordering::SeqCst);
        }));
        assert_eq!(listeners.len(), 1);
        assert!(listeners.contains(&token));

        listeners.call(|cb| cb(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        token.remove();
        token.remove();
        assert!(listeners.is_empty());
        assert!(!token.is_active());

        listeners.call(|cb| cb(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn calls_in_registration_order() {
        let listeners: Listeners<Callback> = Listeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            listeners.add(Arc::new(move |_| order.lock().push(i)));
        }
        listeners.call(|cb| cb(0));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn callback_removing_itself() {
        let listeners: Listeners<Callback> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));

        let h = Arc::clone(&hits);
        let s = Arc::clone(&slot);
        let token = listeners.add(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = s.lock().as_ref() {
                token.remove();
            }
        }));
        *slot.lock() = Some(token);

        listeners.call(|cb| cb(0));
        listeners.call(|cb| cb(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn callback_added_during_call_waits_for_next_pass() {
        let listeners: Arc<Listeners<Callback>> = Arc::new(Listeners::new());
        let late_hits = Arc::new(AtomicUsize::new(0));

        let registry = Arc::clone(&listeners);
        let late = Arc::clone(&late_hits);
        listeners.add(Arc::new(move |_| {
            let late = Arc::clone(&late);
            registry.add(Arc::new(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        listeners.call(|cb| cb(0));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        assert_eq!(listeners.len(), 2);

        listeners.call(|cb| cb(0));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_of_later_listener_during_call_skips_it() {
        let listeners: Listeners<Callback> = Listeners::new();
        let second_hits = Arc::new(AtomicUsize::new(0));
        let second_token: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));

        let s = Arc::clone(&second_token);
        listeners.add(Arc::new(move |_| {
            if let Some(token) = s.lock().as_ref() {
                token.remove();
            }
        }));
        let h = Arc::clone(&second_hits);
        let token = listeners.add(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        *second_token.lock() = Some(token);

        listeners.call(|cb| cb(0));
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_and_drop_detach_tokens() {
        let listeners: Listeners<Callback> = Listeners::new();
        let t1 = listeners.add(Arc::new(|_| {}));
        listeners.clear();
        assert!(!t1.is_active());
        assert!(!listeners.contains(&t1));

        let t2 = listeners.add(Arc::new(|_| {}));
        drop(listeners);
        assert!(!t2.is_active());
        t2.remove();
    }
}
