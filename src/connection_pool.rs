// Copyright 2026 Directory Services Engineering

//! A bounded pool of cached connections to one Directory Server.
//!
//! The pool decorates an underlying [`ConnectionFactory`]: claims pop a
//! cached idle connection when one is available and valid, create a new
//! physical connection while the pool is below its maximum size, and
//! otherwise queue FIFO until a connection is released. Stale idle
//! connections (failed validity checks) are discarded transparently; a
//! periodic task evicts idle connections that have outlived the keep-alive
//! period, never shrinking the pool below its core size.

pub mod types;

use std::sync::{Arc, Mutex, Weak};

use slog::{debug, info, o, warn, Drain, Logger};
use timer::Guard;

use crate::connection::{Connection, ConnectionFactory, SearchHandler};
use crate::event::{ConnectionEventListener, EventMulticaster};
use crate::promise::LdapPromise;
use crate::request::{Request, SearchRequest};
use crate::result::{LdapError, LdapResult};
use crate::time::{SystemTimeService, TimeService};

use self::types::{
    ConnectionPoolOptions, ConnectionPoolStats, IdleConnection, PoolData,
};

// Default core pool size
const DEFAULT_CORE_POOL_SIZE: usize = 10;
// Default keep-alive for idle connections in milliseconds
const DEFAULT_KEEP_ALIVE_MS: u64 = 60_000;

/// A connection pool decorating an underlying connection factory.
///
/// The pool itself implements [`ConnectionFactory`], so it can be stacked
/// under a load balancer or used directly by the application.
pub struct CachedConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    core_size: usize,
    max_size: usize,
    keep_alive_ms: u64,
    time: Arc<dyn TimeService>,
    log: Logger,
    data: Mutex<PoolData>,
    evicter: Mutex<Option<(timer::Timer, Guard)>>,
}

impl CachedConnectionPool {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        options: ConnectionPoolOptions,
    ) -> Self {
        let core_size =
            options.core_pool_size.unwrap_or(DEFAULT_CORE_POOL_SIZE);
        let max_size = options.max_pool_size.unwrap_or(core_size).max(core_size);
        let keep_alive_ms =
            options.keep_alive_ms.unwrap_or(DEFAULT_KEEP_ALIVE_MS);
        let time = options
            .time
            .unwrap_or_else(|| Arc::new(SystemTimeService));
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let inner = Arc::new(PoolInner {
            factory,
            core_size,
            max_size,
            keep_alive_ms,
            time,
            log,
            data: Mutex::new(PoolData::new(max_size)),
            evicter: Mutex::new(None),
        });

        // The eviction task holds a weak reference so that the timer, which
        // lives inside the pool, does not keep the pool alive.
        let evicter = timer::Timer::new();
        let weak = Arc::downgrade(&inner);
        let interval = (keep_alive_ms / 2).max(1) as i64;
        let guard = evicter.schedule_repeating(
            chrono::Duration::milliseconds(interval),
            move || {
                if let Some(pool) = Weak::upgrade(&weak) {
                    pool.purge_stale_connections();
                }
            },
        );
        *inner.evicter.lock().unwrap() = Some((evicter, guard));

        debug!(
            inner.log,
            "connection pool created";
            "core" => core_size, "max" => max_size,
            "keep_alive_ms" => keep_alive_ms
        );
        CachedConnectionPool { inner }
    }

    /// Current pool counters.
    pub fn stats(&self) -> ConnectionPoolStats {
        let data = self.inner.data.lock().unwrap();
        ConnectionPoolStats {
            total_connections: data.total,
            idle_connections: data.idle.len(),
            pending_claims: data.pending.len(),
        }
    }

    /// Evict expired idle connections now. The periodic task calls this on
    /// its own schedule; tests drive it directly with a fake time source.
    pub fn purge_stale_connections(&self) {
        self.inner.purge_stale_connections();
    }
}

impl ConnectionFactory for CachedConnectionPool {
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>> {
        self.inner.claim_async()
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl PoolInner {
    fn claim_async(self: &Arc<Self>) -> LdapPromise<Arc<dyn Connection>> {
        let promise: LdapPromise<Arc<dyn Connection>> = LdapPromise::new();
        let mut stale = Vec::new();
        let mut handed_out = None;
        {
            let mut data = self.data.lock().unwrap();
            if data.closed {
                drop(data);
                promise.complete(Err(LdapError::local_error("pool is closed")));
                return promise;
            }
            // Reuse the most recently released connection so the oldest idle
            // entries age toward eviction. Stale entries are discarded and do
            // not count against the pool size.
            while let Some(idle) = data.idle.pop_back() {
                if idle.connection.is_valid() {
                    handed_out = Some(idle.connection);
                    break;
                }
                data.total -= 1;
                stale.push(idle.connection);
            }
            if handed_out.is_none() {
                if data.total < self.max_size {
                    data.total += 1;
                } else {
                    debug!(self.log, "pool saturated; queueing claim");
                    data.pending.push_back(promise.clone());
                    drop(data);
                    for connection in stale {
                        connection.close();
                    }
                    return promise;
                }
            }
        }
        for connection in stale {
            warn!(self.log, "discarded stale idle connection");
            connection.close();
        }
        match handed_out {
            Some(connection) => {
                let wrapper = PooledConnection::wrap(self.clone(), connection);
                promise.complete(Ok(wrapper));
            }
            None => self.connect_new(Some(promise.clone())),
        }
        promise
    }

    /// Ask the factory for a new physical connection. `total` has already
    /// been incremented for it. On success the connection goes to `target`
    /// when given (falling back to the waiter queue if `target` was
    /// cancelled); on failure every pending waiter fails with the same
    /// error, since one factory failure means they would all fail
    /// identically and must not be left hanging.
    fn connect_new(
        self: &Arc<Self>,
        target: Option<LdapPromise<Arc<dyn Connection>>>,
    ) {
        let pool = Arc::clone(self);
        self.factory.connection_async().on_complete(move |outcome| {
            match outcome {
                Ok(connection) => {
                    let delivered = match &target {
                        Some(promise) => {
                            let wrapper = PooledConnection::wrap(
                                pool.clone(),
                                connection.clone(),
                            );
                            promise.complete(Ok(wrapper))
                        }
                        None => false,
                    };
                    if !delivered {
                        // Claim cancelled while connecting, or this is a
                        // replacement for a queued waiter.
                        pool.offer(connection.clone());
                    }
                }
                Err(error) => {
                    warn!(
                        pool.log,
                        "connection factory failed; failing all pending claims";
                        "error" => %error
                    );
                    let pending: Vec<_> = {
                        let mut data = pool.data.lock().unwrap();
                        data.total -= 1;
                        data.pending.drain(..).collect()
                    };
                    if let Some(promise) = target {
                        promise.complete(Err(error.clone()));
                    }
                    for waiter in pending {
                        waiter.complete(Err(error.clone()));
                    }
                }
            }
        });
    }

    /// Place a live, counted connection back into circulation: hand it to
    /// the oldest live waiter, else cache it idle.
    fn offer(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        loop {
            let mut data = self.data.lock().unwrap();
            if data.closed {
                data.total -= 1;
                drop(data);
                connection.close();
                return;
            }
            let waiter = loop {
                match data.pending.pop_front() {
                    Some(waiter) if waiter.is_done() => continue,
                    other => break other,
                }
            };
            match waiter {
                Some(waiter) => {
                    drop(data);
                    let wrapper = Arc::new(PooledConnection::new(
                        self.clone(),
                        connection.clone(),
                    ));
                    let handle: Arc<dyn Connection> = wrapper.clone();
                    if waiter.complete(Ok(handle)) {
                        return;
                    }
                    // Cancellation raced the handoff; neutralize the wrapper
                    // and try the next waiter.
                    wrapper.abandon();
                }
                None => {
                    let released_at_ms = self.time.now_millis();
                    data.idle.push_back(IdleConnection {
                        connection,
                        released_at_ms,
                    });
                    return;
                }
            }
        }
    }

    /// Called when a pooled wrapper is closed. Valid connections are
    /// recycled; invalid ones are closed and, when claims are queued, a
    /// replacement is started immediately so the head waiter is not left
    /// hanging until the next release.
    fn release(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        if connection.is_valid() {
            self.offer(connection);
            return;
        }
        let start_replacement = {
            let mut data = self.data.lock().unwrap();
            data.total -= 1;
            let replace = !data.closed
                && !data.pending.is_empty()
                && data.total < self.max_size;
            if replace {
                data.total += 1;
            }
            replace
        };
        debug!(self.log, "released connection no longer valid; closing");
        connection.close();
        if start_replacement {
            self.connect_new(None);
        }
    }

    fn purge_stale_connections(self: &Arc<Self>) {
        let now = self.time.now_millis();
        let mut expired = Vec::new();
        {
            let mut data = self.data.lock().unwrap();
            while data.total > self.core_size {
                let evict = match data.idle.front() {
                    Some(idle) => {
                        now.saturating_sub(idle.released_at_ms)
                            >= self.keep_alive_ms
                    }
                    None => false,
                };
                if !evict {
                    break;
                }
                expired.push(data.idle.pop_front().unwrap().connection);
                data.total -= 1;
            }
        }
        if !expired.is_empty() {
            info!(
                self.log,
                "evicting expired idle connections";
                "count" => expired.len()
            );
            for connection in expired {
                connection.close();
            }
        }
    }

    fn close(self: &Arc<Self>) {
        let (idle, pending) = {
            let mut data = self.data.lock().unwrap();
            if data.closed {
                return;
            }
            data.closed = true;
            let idle: Vec<_> = data.idle.drain(..).collect();
            data.total -= idle.len();
            let pending: Vec<_> = data.pending.drain(..).collect();
            (idle, pending)
        };
        // Cancel the eviction task.
        *self.evicter.lock().unwrap() = None;
        info!(
            self.log,
            "closing connection pool"; "idle" => idle.len(),
            "pending" => pending.len()
        );
        for idle_connection in idle {
            idle_connection.connection.close();
        }
        let error = LdapError::local_error("pool is closed");
        for waiter in pending {
            waiter.complete(Err(error.clone()));
        }
    }
}

/// The connection handle the pool hands out.
///
/// Closing it never unbinds the physical connection: the connection is
/// either recycled into the idle cache or, when stale, discarded by the
/// pool. Listeners registered here see errors and unsolicited notifications
/// from the physical connection while the handle is checked out, but closed
/// events cover this wrapper's lifecycle only.
struct PooledConnection {
    pool: Arc<PoolInner>,
    physical: Arc<dyn Connection>,
    closed: std::sync::atomic::AtomicBool,
    listeners: Arc<EventMulticaster>,
    relay: Arc<dyn ConnectionEventListener>,
}

/// Forwards physical-connection events to a wrapper's listeners for the
/// duration of a checkout. Closed events are not forwarded: the pool
/// recycling or discarding the physical connection is not a close of the
/// handle the caller holds.
struct PhysicalEventRelay {
    listeners: Arc<EventMulticaster>,
}

impl ConnectionEventListener for PhysicalEventRelay {
    fn handle_connection_closed(&self) {}

    fn handle_connection_error(
        &self,
        is_disconnect_notification: bool,
        error: &LdapError,
    ) {
        self.listeners
            .notify_error(is_disconnect_notification, error);
    }

    fn handle_unsolicited_notification(&self, oid: &str) {
        self.listeners.notify_unsolicited(oid);
    }
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, physical: Arc<dyn Connection>) -> Self {
        let listeners = Arc::new(EventMulticaster::new());
        let relay: Arc<dyn ConnectionEventListener> =
            Arc::new(PhysicalEventRelay {
                listeners: listeners.clone(),
            });
        physical.add_event_listener(relay.clone());
        PooledConnection {
            pool,
            physical,
            closed: std::sync::atomic::AtomicBool::new(false),
            listeners,
            relay,
        }
    }

    fn wrap(
        pool: Arc<PoolInner>,
        physical: Arc<dyn Connection>,
    ) -> Arc<dyn Connection> {
        Arc::new(PooledConnection::new(pool, physical))
    }

    // Mark closed without releasing; used when a handoff loses a race and
    // the pool still owns the physical connection.
    fn abandon(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.physical.remove_event_listener(&self.relay);
    }
}

impl Connection for PooledConnection {
    fn request_async(&self, request: Request) -> LdapPromise<LdapResult> {
        if self.is_closed() {
            return LdapPromise::failed(LdapError::local_error(
                "pooled connection is closed",
            ));
        }
        self.physical.request_async(request)
    }

    fn search_async(
        &self,
        request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        if self.is_closed() {
            return LdapPromise::failed(LdapError::local_error(
                "pooled connection is closed",
            ));
        }
        self.physical.search_async(request, handler)
    }

    fn is_valid(&self) -> bool {
        !self.is_closed() && self.physical.is_valid()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn close(&self) {
        if !self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            self.physical.remove_event_listener(&self.relay);
            self.listeners.notify_closed();
            self.pool.release(self.physical.clone());
        }
    }

    fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.add(listener);
    }

    fn remove_event_listener(
        &self,
        listener: &Arc<dyn ConnectionEventListener>,
    ) {
        self.listeners.remove(listener);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A wrapper dropped without close is returned to the pool anyway.
        if !self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            self.physical.remove_event_listener(&self.relay);
            self.listeners.notify_closed();
            self.pool.release(self.physical.clone());
        }
    }
}
