// Copyright 2026 Directory Services Engineering

//! Connection event listeners and the multicaster used to relay events.
//!
//! Decorator layers (the pool wrapper, the load-balanced logical connection)
//! each own a multicaster so that a listener registered on a wrapper is
//! notified about that wrapper's lifecycle, not about whatever later happens
//! to the physical connection underneath it.

use std::sync::{Arc, Mutex};

use crate::result::LdapError;

/// Observer for connection lifecycle events.
pub trait ConnectionEventListener: Send + Sync {
    /// The connection the listener was registered on has been closed.
    fn handle_connection_closed(&self);

    /// The connection has failed. `is_disconnect_notification` is true when
    /// the failure was reported by the server as a disconnect notification
    /// rather than detected locally.
    fn handle_connection_error(
        &self,
        is_disconnect_notification: bool,
        error: &LdapError,
    );

    /// An unsolicited notification was received from the server.
    fn handle_unsolicited_notification(&self, _oid: &str) {}
}

/// Thread-safe listener registry. Registration and removal are O(1)
/// amortized; removal matches by listener identity (`Arc::ptr_eq`).
#[derive(Default)]
pub struct EventMulticaster {
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl EventMulticaster {
    pub fn new() -> Self {
        EventMulticaster {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn ConnectionEventListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(index) = listeners
            .iter()
            .position(|registered| Arc::ptr_eq(registered, listener))
        {
            listeners.swap_remove(index);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn notify_closed(&self) {
        for listener in self.snapshot() {
            listener.handle_connection_closed();
        }
    }

    pub fn notify_error(
        &self,
        is_disconnect_notification: bool,
        error: &LdapError,
    ) {
        for listener in self.snapshot() {
            listener.handle_connection_error(is_disconnect_notification, error);
        }
    }

    pub fn notify_unsolicited(&self, oid: &str) {
        for listener in self.snapshot() {
            listener.handle_unsolicited_notification(oid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        closed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ConnectionEventListener for CountingListener {
        fn handle_connection_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_connection_error(&self, _: bool, _: &LdapError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let multicaster = EventMulticaster::new();
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn ConnectionEventListener> = listener.clone();
        multicaster.add(as_dyn.clone());
        multicaster.remove(&as_dyn);
        multicaster.notify_closed();
        multicaster.notify_error(false, &LdapError::connect_error("down"));
        assert_eq!(listener.closed.load(Ordering::SeqCst), 0);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_reach_all_registered_listeners() {
        let multicaster = EventMulticaster::new();
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());
        multicaster.add(first.clone());
        multicaster.add(second.clone());
        multicaster.notify_closed();
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(second.closed.load(Ordering::SeqCst), 1);
    }
}
