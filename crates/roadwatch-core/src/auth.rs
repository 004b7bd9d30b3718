//! ============================================================================
//! Auth Status - Observable sign-in state for the remote object store
//! ============================================================================
//! The sign-in flow itself lives outside this crate; it only reports the
//! result here. Components query `is_authenticated()` or subscribe to
//! changes. A subscription unsubscribes when dropped.
//! ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::info;

/// Synchronous "are we signed in to the object store" query
pub trait AuthState: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Authentication flag with change listeners
#[derive(Default)]
pub struct AuthStatus {
    authenticated: AtomicBool,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl AuthStatus {
    pub fn new(authenticated: bool) -> Arc<Self> {
        Arc::new(Self {
            authenticated: AtomicBool::new(authenticated),
            ..Default::default()
        })
    }

    /// Update the state; listeners are notified only on change
    pub fn set_authenticated(&self, authenticated: bool) {
        let previous = self.authenticated.swap(authenticated, Ordering::SeqCst);
        if previous != authenticated {
            info!("Object store authentication: {}", authenticated);
            self.notify();
        }
    }

    /// Register a listener. It is called immediately with the current state
    /// and again on every change until the returned subscription is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        self.lock_listeners().insert(id, Arc::clone(&listener));
        listener(self.is_authenticated());

        Subscription {
            id,
            owner: Arc::downgrade(self),
        }
    }

    /// Fan the current state out to every listener
    pub fn notify(&self) {
        let state = self.is_authenticated();
        // call outside the lock so listeners may (un)subscribe
        let listeners: Vec<Listener> = self.lock_listeners().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_listeners().remove(&id);
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AuthState for AuthStatus {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`AuthStatus::subscribe`]; dropping it unsubscribes
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    owner: Weak<AuthStatus>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<bool>>>, impl Fn(bool) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |state| sink.lock().unwrap().push(state))
    }

    #[test]
    fn test_subscribe_emits_current_state() {
        let auth = AuthStatus::new(true);
        let (seen, listener) = recorder();
        let _sub = auth.subscribe(listener);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_notifies_on_change_only() {
        let auth = AuthStatus::new(false);
        let (seen, listener) = recorder();
        let _sub = auth.subscribe(listener);

        auth.set_authenticated(true);
        auth.set_authenticated(true);
        auth.set_authenticated(false);

        assert_eq!(*seen.lock().unwrap(), vec![false, true, false]);
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let auth = AuthStatus::new(false);
        let (seen, listener) = recorder();
        let sub = auth.subscribe(listener);
        assert_eq!(auth.listener_count(), 1);

        drop(sub);
        assert_eq!(auth.listener_count(), 0);

        auth.set_authenticated(true);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_subscription_outliving_status() {
        let auth = AuthStatus::new(false);
        let sub = auth.subscribe(|_| {});
        drop(auth);
        drop(sub);
    }
}
