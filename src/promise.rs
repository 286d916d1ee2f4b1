// Copyright 2026 Directory Services Engineering

//! Single-assignment promises for asynchronous LDAP operations.
//!
//! Every asynchronous operation in this crate returns an [`LdapPromise`]. The
//! promise is a cloneable handle over shared state: the side performing the
//! operation keeps one clone to complete, the caller keeps another to wait
//! on. Completion is first-wins; once a promise reaches a terminal state
//! (result, error, or cancelled) all later completion attempts are rejected,
//! which gives at-most-once delivery even when the initiating thread and a
//! completion callback race.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::result::LdapError;

type Callback<T> = Box<dyn FnOnce(&Result<T, LdapError>) + Send>;

struct State<T> {
    outcome: Option<Result<T, LdapError>>,
    cancelled: bool,
    callback: Option<Callback<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A single-assignment handle for an asynchronous operation's eventual
/// success or failure.
pub struct LdapPromise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LdapPromise<T> {
    fn clone(&self) -> Self {
        LdapPromise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> LdapPromise<T> {
    pub fn new() -> Self {
        LdapPromise {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    cancelled: false,
                    callback: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A promise that is already successfully completed.
    pub fn completed(value: T) -> Self {
        let promise = LdapPromise::new();
        promise.complete(Ok(value));
        promise
    }

    /// A promise that is already failed.
    pub fn failed(error: LdapError) -> Self {
        let promise = LdapPromise::new();
        promise.complete(Err(error));
        promise
    }

    /// Complete the promise. The first completion wins and returns true; any
    /// later attempt, including one racing a cancellation, returns false and
    /// has no effect.
    pub fn complete(&self, outcome: Result<T, LdapError>) -> bool {
        let callback;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            callback = state.callback.take();
            self.inner.cond.notify_all();
        }
        // Run the callback outside the lock so it may touch the promise.
        if let Some(callback) = callback {
            let state = self.inner.state.lock().unwrap();
            let outcome = state.outcome.as_ref().unwrap().clone();
            drop(state);
            callback(&outcome);
        }
        true
    }

    /// Cancel the promise. Before completion this marks it cancelled, fails
    /// it with a client-side cancelled error, and returns true. After
    /// completion it is a no-op returning false.
    pub fn cancel(&self) -> bool {
        let callback;
        let outcome;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_some() {
                return false;
            }
            state.cancelled = true;
            state.outcome = Some(Err(LdapError::cancelled()));
            callback = state.callback.take();
            outcome = state.outcome.as_ref().unwrap().clone();
            self.inner.cond.notify_all();
        }
        if let Some(callback) = callback {
            callback(&outcome);
        }
        true
    }

    /// Whether the promise has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().outcome.is_some()
    }

    /// Whether the promise was cancelled before completion.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap().cancelled
    }

    /// Block until the promise completes and return its outcome.
    pub fn get(&self) -> Result<T, LdapError> {
        let mut state = self.inner.state.lock().unwrap();
        while state.outcome.is_none() {
            state = self.inner.cond.wait(state).unwrap();
        }
        state.outcome.as_ref().unwrap().clone()
    }

    /// Block until the promise completes or the timeout elapses. On timeout
    /// the promise is left pending and a client-side timeout error is
    /// returned.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, LdapError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while state.outcome.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(LdapError::timeout());
            }
            let (guard, wait_result) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if wait_result.timed_out() && state.outcome.is_none() {
                return Err(LdapError::timeout());
            }
        }
        state.outcome.as_ref().unwrap().clone()
    }

    /// Attach a completion callback, invoked exactly once: immediately if the
    /// promise is already terminal, otherwise on the completing thread. Only
    /// one callback may be attached per promise.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, LdapError>) + Send + 'static,
    {
        let already_done;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_none() {
                state.callback = Some(Box::new(callback));
                return;
            }
            already_done = state.outcome.as_ref().unwrap().clone();
        }
        callback(&already_done);
    }
}

impl<T: Clone + Send + 'static> Default for LdapPromise<T> {
    fn default() -> Self {
        LdapPromise::new()
    }
}
