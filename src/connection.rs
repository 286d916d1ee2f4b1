// Copyright 2026 Directory Services Engineering

//! Connection and connection factory seams.
//!
//! A *connection* here is a logical session with a Directory Server: the
//! wire codec and transport live behind it. The trait is object safe and
//! shared (`Arc<dyn Connection>`) because pool wrappers, load balancers, and
//! promises all need to hold the same handle; state transitions therefore go
//! through interior mutability.
//!
//! Synchronous calls are a thin bridge over the asynchronous ones: delegate,
//! block on the promise, and best-effort cancel the in-flight operation on
//! the error exit path. The cancel is an abandon, it does not guarantee the
//! server stops processing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::ConnectionEventListener;
use crate::promise::LdapPromise;
use crate::request::{Request, SearchEntry, SearchRequest};
use crate::result::{LdapError, LdapResult, ResultCode};

/// Receives streamed search results. Returning `false` asks the server-side
/// machinery to stop delivering further results.
pub trait SearchHandler: Send + Sync {
    fn handle_entry(&self, entry: SearchEntry) -> bool;
    fn handle_reference(&self, reference: String) -> bool;
}

/// A stateful handle to one Directory Server session.
pub trait Connection: Send + Sync {
    /// Issue a non-search operation. Passing a `Request::Search` here is a
    /// local error; searches carry a result handler and go through
    /// [`Connection::search_async`].
    fn request_async(&self, request: Request) -> LdapPromise<LdapResult>;

    /// Issue a search operation, streaming entries and references through
    /// `handler` before the returned promise completes with the final result.
    fn search_async(
        &self,
        request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult>;

    /// False once the connection has seen a fatal error or a disconnect
    /// notification. Validity is polled, not signalled by errors.
    fn is_valid(&self) -> bool;

    /// True once `close` has been called on this handle. Terminal.
    fn is_closed(&self) -> bool;

    /// Release the connection. Idempotent.
    fn close(&self);

    fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>);

    fn remove_event_listener(
        &self,
        listener: &Arc<dyn ConnectionEventListener>,
    );
}

/// Abstract source of connections: a real network factory, a pool, or a load
/// balancer composed over other factories.
pub trait ConnectionFactory: Send + Sync {
    /// Obtain a connection without blocking the calling thread.
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>>;

    /// Obtain a connection, blocking until one is available or the factory
    /// fails.
    fn connection(&self) -> Result<Arc<dyn Connection>, LdapError> {
        let promise = self.connection_async();
        let outcome = promise.get();
        if outcome.is_err() {
            promise.cancel();
        }
        outcome
    }

    /// Release the factory's resources. Connections already handed out
    /// remain usable until individually closed.
    fn close(&self);
}

fn blocking_get<T: Clone + Send + 'static>(
    promise: LdapPromise<T>,
    timeout: Option<Duration>,
) -> Result<T, LdapError> {
    let outcome = match timeout {
        Some(timeout) => promise.get_timeout(timeout),
        None => promise.get(),
    };
    if outcome.is_err() {
        // Best-effort abandon of the in-flight operation; a no-op when the
        // promise already completed.
        promise.cancel();
    }
    outcome
}

/// Collects streamed results for `search` and `search_single_entry`.
struct CollectingHandler {
    entries: Mutex<Vec<SearchEntry>>,
    references: Mutex<Vec<String>>,
}

impl CollectingHandler {
    fn new() -> Arc<Self> {
        Arc::new(CollectingHandler {
            entries: Mutex::new(Vec::new()),
            references: Mutex::new(Vec::new()),
        })
    }
}

impl SearchHandler for CollectingHandler {
    fn handle_entry(&self, entry: SearchEntry) -> bool {
        self.entries.lock().unwrap().push(entry);
        true
    }

    fn handle_reference(&self, reference: String) -> bool {
        self.references.lock().unwrap().push(reference);
        true
    }
}

/// Blocking counterparts of the asynchronous [`Connection`] operations.
pub trait SyncConnectionExt: Connection {
    fn request(&self, request: Request) -> Result<LdapResult, LdapError> {
        blocking_get(self.request_async(request), None)
    }

    fn request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<LdapResult, LdapError> {
        blocking_get(self.request_async(request), Some(timeout))
    }

    /// Run a search to completion and return the collected entries.
    fn search(
        &self,
        request: SearchRequest,
    ) -> Result<Vec<SearchEntry>, LdapError> {
        let handler = CollectingHandler::new();
        blocking_get(self.search_async(request, handler.clone()), None)?;
        let entries = handler.entries.lock().unwrap().drain(..).collect();
        Ok(entries)
    }

    /// Run a search that must match exactly one entry.
    ///
    /// Zero entries fail with `ClientSideNoResultsReturned`; more than one
    /// entry, or any search result reference, fails with
    /// `ClientSideUnexpectedResultsReturned`. The three outcomes are
    /// mutually exclusive and exhaustive.
    fn search_single_entry(
        &self,
        request: SearchRequest,
    ) -> Result<SearchEntry, LdapError> {
        let handler = CollectingHandler::new();
        blocking_get(self.search_async(request, handler.clone()), None)?;
        let mut entries = handler.entries.lock().unwrap();
        let references = handler.references.lock().unwrap();
        if entries.is_empty() {
            Err(LdapError::new(
                ResultCode::ClientSideNoResultsReturned,
                "search matched no entries",
            ))
        } else if entries.len() > 1 || !references.is_empty() {
            Err(LdapError::new(
                ResultCode::ClientSideUnexpectedResultsReturned,
                format!(
                    "search matched {} entries and {} references",
                    entries.len(),
                    references.len()
                ),
            ))
        } else {
            Ok(entries.remove(0))
        }
    }
}

impl<C: Connection + ?Sized> SyncConnectionExt for C {}
