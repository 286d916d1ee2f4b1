// Copyright 2026 Directory Services Engineering

//! Client-side load balancing across a set of connection factories.
//!
//! A [`RequestLoadBalancer`] composes a [`DispatchFunction`] with an ordered
//! set of partitions (connection factories) to produce a single logical
//! [`ConnectionFactory`]. Obtaining a connection from it never touches the
//! delegate factories: the logical connection picks a partition per
//! operation, opens a delegate connection, forwards the operation, and
//! closes the delegate when the operation completes. A factory whose
//! connection attempt fails is marked offline and linearly probed past; a
//! background task re-probes offline factories and restores them once a
//! probe connection succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, info, o, warn, Drain, Logger};
use timer::Guard;

use crate::connection::{Connection, ConnectionFactory, SearchHandler};
use crate::event::{ConnectionEventListener, EventMulticaster};
use crate::promise::LdapPromise;
use crate::request::{Request, SearchRequest};
use crate::result::{LdapError, LdapResult};

// Default interval between probes of offline factories in milliseconds
const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;
// Default capacity of the least-requests affinity map
const DEFAULT_AFFINITY_CAPACITY: usize = 1024;

/// Selects a partition index for each request.
///
/// Implementations may consume routing controls from the request (the
/// stripped request is what gets forwarded to the real connection) but must
/// not otherwise modify it.
pub trait DispatchFunction: Send + Sync {
    fn select(&self, request: &mut Request) -> usize;

    /// Invoked once when the dispatched operation completes, successfully or
    /// not. Saturation-based dispatchers decrement their counters here.
    fn complete(&self, _index: usize) {}
}

/// Round-robin dispatch: an atomic cursor advanced modulo the partition
/// count. With a single partition the cursor is never touched.
pub struct RoundRobinDispatch {
    partitions: usize,
    cursor: AtomicUsize,
}

impl RoundRobinDispatch {
    pub fn new(partitions: usize) -> Self {
        RoundRobinDispatch {
            partitions,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl DispatchFunction for RoundRobinDispatch {
    fn select(&self, _request: &mut Request) -> usize {
        if self.partitions <= 1 {
            0
        } else {
            self.cursor.fetch_add(1, Ordering::Relaxed) % self.partitions
        }
    }
}

/// Failover dispatch: always prefer the first partition. The balancer's
/// linear probing supplies the failover to later partitions, and the
/// background probe task supplies recovery.
pub struct FailoverDispatch;

impl DispatchFunction for FailoverDispatch {
    fn select(&self, _request: &mut Request) -> usize {
        0
    }
}

// Bounded affinity token map. Eviction removes the least recently pinned
// token so the map can never grow without limit.
struct AffinityCache {
    capacity: usize,
    stamp: u64,
    entries: HashMap<String, (usize, u64)>,
}

impl AffinityCache {
    fn new(capacity: usize) -> Self {
        AffinityCache {
            capacity: capacity.max(1),
            stamp: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, token: &str) -> Option<usize> {
        self.stamp += 1;
        let stamp = self.stamp;
        self.entries.get_mut(token).map(|entry| {
            entry.1 = stamp;
            entry.0
        })
    }

    fn insert(&mut self, token: String, index: usize) {
        self.stamp += 1;
        if self.entries.len() >= self.capacity
            && !self.entries.contains_key(&token)
        {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(token, _)| token.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(token, (index, self.stamp));
    }
}

/// Saturation-aware dispatch: pick the partition with the fewest in-flight
/// requests, ties broken toward the lowest index. A request carrying an
/// affinity control is pinned to the index most recently used for that
/// token, and the control is stripped before forwarding.
pub struct LeastRequestsDispatch {
    in_flight: Vec<AtomicUsize>,
    affinity: Mutex<AffinityCache>,
}

impl LeastRequestsDispatch {
    pub fn new(partitions: usize) -> Self {
        LeastRequestsDispatch::with_affinity_capacity(
            partitions,
            DEFAULT_AFFINITY_CAPACITY,
        )
    }

    pub fn with_affinity_capacity(
        partitions: usize,
        affinity_capacity: usize,
    ) -> Self {
        LeastRequestsDispatch {
            in_flight: (0..partitions).map(|_| AtomicUsize::new(0)).collect(),
            affinity: Mutex::new(AffinityCache::new(affinity_capacity)),
        }
    }

    fn least_loaded(&self) -> usize {
        let mut best = 0;
        let mut best_load = usize::MAX;
        for (index, counter) in self.in_flight.iter().enumerate() {
            let load = counter.load(Ordering::Relaxed);
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        best
    }

    /// Current in-flight counter for a partition. Diagnostics and tests.
    pub fn in_flight(&self, index: usize) -> usize {
        self.in_flight[index].load(Ordering::Relaxed)
    }
}

impl DispatchFunction for LeastRequestsDispatch {
    fn select(&self, request: &mut Request) -> usize {
        let index = match request.take_affinity() {
            Some(token) => {
                let mut affinity = self.affinity.lock().unwrap();
                match affinity.get(&token) {
                    Some(pinned) => pinned,
                    None => {
                        let index = self.least_loaded();
                        affinity.insert(token, index);
                        index
                    }
                }
            }
            None => self.least_loaded(),
        };
        self.in_flight[index].fetch_add(1, Ordering::Relaxed);
        index
    }

    fn complete(&self, index: usize) {
        self.in_flight[index].fetch_sub(1, Ordering::Relaxed);
    }
}

/// Observer for partition availability changes.
pub trait LoadBalancerEventListener: Send + Sync {
    fn factory_offline(&self, index: usize, error: &LdapError);
    fn factory_online(&self, index: usize);
}

/// Configuration for a [`RequestLoadBalancer`].
#[derive(Default)]
pub struct LoadBalancerOptions {
    /// Interval between probes of offline factories in milliseconds. The
    /// default is 1,000.
    pub probe_interval_ms: Option<u64>,
    /// Optional observer notified when a partition goes offline or is
    /// restored.
    pub listener: Option<Arc<dyn LoadBalancerEventListener>>,
    /// An optional `slog` logger. Falls back to the `slog-stdlog` drain.
    pub log: Option<Logger>,
}

/// A logical connection factory routing each operation across partitions.
pub struct RequestLoadBalancer {
    inner: Arc<BalancerInner>,
}

struct BalancerInner {
    name: String,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    online: Vec<AtomicBool>,
    dispatch: Arc<dyn DispatchFunction>,
    listener: Option<Arc<dyn LoadBalancerEventListener>>,
    log: Logger,
    probe: Mutex<Option<(timer::Timer, Guard)>>,
    closed: AtomicBool,
    // Probes in flight, to avoid stacking probes on a slow factory.
    probing: AtomicU64,
}

impl RequestLoadBalancer {
    pub fn new(
        name: &str,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        dispatch: Arc<dyn DispatchFunction>,
        options: LoadBalancerOptions,
    ) -> Self {
        assert!(
            !factories.is_empty(),
            "a load balancer requires at least one factory"
        );
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("load_balancer" => name.to_owned()));
        let online = (0..factories.len()).map(|_| AtomicBool::new(true)).collect();
        let inner = Arc::new(BalancerInner {
            name: name.to_owned(),
            factories,
            online,
            dispatch,
            listener: options.listener,
            log,
            probe: Mutex::new(None),
            closed: AtomicBool::new(false),
            probing: AtomicU64::new(0),
        });

        let probe_interval = options
            .probe_interval_ms
            .unwrap_or(DEFAULT_PROBE_INTERVAL_MS);
        let probe_timer = timer::Timer::new();
        let weak = Arc::downgrade(&inner);
        let guard = probe_timer.schedule_repeating(
            chrono::Duration::milliseconds(probe_interval.max(1) as i64),
            move || {
                if let Some(balancer) = weak.upgrade() {
                    balancer.probe_offline_factories();
                }
            },
        );
        *inner.probe.lock().unwrap() = Some((probe_timer, guard));

        RequestLoadBalancer { inner }
    }

    /// A round-robin balancer over the given factories.
    pub fn round_robin(
        name: &str,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        options: LoadBalancerOptions,
    ) -> Self {
        let dispatch = Arc::new(RoundRobinDispatch::new(factories.len()));
        RequestLoadBalancer::new(name, factories, dispatch, options)
    }

    /// A failover balancer: all requests go to the first operational
    /// factory in order.
    pub fn failover(
        name: &str,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        options: LoadBalancerOptions,
    ) -> Self {
        RequestLoadBalancer::new(
            name,
            factories,
            Arc::new(FailoverDispatch),
            options,
        )
    }

    /// A saturation-aware balancer dispatching to the least busy factory.
    pub fn least_requests(
        name: &str,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        options: LoadBalancerOptions,
    ) -> Self {
        let dispatch = Arc::new(LeastRequestsDispatch::new(factories.len()));
        RequestLoadBalancer::new(name, factories, dispatch, options)
    }

    /// Whether a partition is currently considered operational.
    pub fn is_online(&self, index: usize) -> bool {
        self.inner.online[index].load(Ordering::SeqCst)
    }

    /// Probe offline factories now, instead of waiting for the next tick.
    pub fn probe_now(&self) {
        self.inner.probe_offline_factories();
    }
}

impl std::fmt::Debug for RequestLoadBalancer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("RequestLoadBalancer")
            .field("name", &self.inner.name)
            .field("factories", &self.inner.factories.len())
            .finish()
    }
}

impl ConnectionFactory for RequestLoadBalancer {
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return LdapPromise::failed(LdapError::local_error(
                "load balancer is closed",
            ));
        }
        let connection: Arc<dyn Connection> =
            Arc::new(BalancedConnection::new(self.inner.clone()));
        LdapPromise::completed(connection)
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            *self.inner.probe.lock().unwrap() = None;
            info!(self.inner.log, "closing load balancer");
            for factory in &self.inner.factories {
                factory.close();
            }
        }
    }
}

impl BalancerInner {
    fn mark_offline(&self, index: usize, error: &LdapError) {
        if self.online[index].swap(false, Ordering::SeqCst) {
            warn!(
                self.log,
                "factory went offline"; "index" => index, "error" => %error
            );
            if let Some(listener) = &self.listener {
                listener.factory_offline(index, error);
            }
        }
    }

    fn mark_online(&self, index: usize) {
        if !self.online[index].swap(true, Ordering::SeqCst) {
            info!(self.log, "factory restored"; "index" => index);
            if let Some(listener) = &self.listener {
                listener.factory_online(index);
            }
        }
    }

    /// The factory indices an operation starting at `start` will try, in
    /// order. Known-offline factories are skipped unless every factory is
    /// offline, in which case all are attempted so a recovered server is
    /// not gated on the probe interval.
    fn candidate_order(&self, start: usize) -> Vec<usize> {
        let count = self.factories.len();
        let ordered: Vec<usize> =
            (0..count).map(|offset| (start + offset) % count).collect();
        let online: Vec<usize> = ordered
            .iter()
            .copied()
            .filter(|&index| self.online[index].load(Ordering::SeqCst))
            .collect();
        if online.is_empty() {
            ordered
        } else {
            online
        }
    }

    fn probe_offline_factories(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // A slow factory must not accumulate one probe per tick.
        if self.probing.load(Ordering::SeqCst) > 0 {
            return;
        }
        for index in 0..self.factories.len() {
            if self.online[index].load(Ordering::SeqCst) {
                continue;
            }
            self.probing.fetch_add(1, Ordering::SeqCst);
            let balancer = Arc::clone(self);
            debug!(self.log, "probing offline factory"; "index" => index);
            self.factories[index].connection_async().on_complete(
                move |outcome| {
                    if let Ok(connection) = outcome {
                        connection.close();
                        balancer.mark_online(index);
                    }
                    balancer.probing.fetch_sub(1, Ordering::SeqCst);
                },
            );
        }
    }
}

// An operation traveling through the balancer.
enum Operation {
    Plain(Request),
    Search(SearchRequest, Arc<dyn SearchHandler>),
}

/// The logical connection handed out by [`RequestLoadBalancer`].
///
/// Its shared state sits behind its own `Arc` so completion closures can
/// hold it after the operation outlives the caller's handle.
struct BalancedConnection {
    state: Arc<ConnectionState>,
}

struct ConnectionState {
    balancer: Arc<BalancerInner>,
    valid: AtomicBool,
    closed: AtomicBool,
    listeners: EventMulticaster,
}

impl BalancedConnection {
    fn new(balancer: Arc<BalancerInner>) -> Self {
        BalancedConnection {
            state: Arc::new(ConnectionState {
                balancer,
                valid: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                listeners: EventMulticaster::new(),
            }),
        }
    }

    fn run(
        &self,
        mut request: Request,
        handler: Option<Arc<dyn SearchHandler>>,
    ) -> LdapPromise<LdapResult> {
        if self.is_closed() {
            return LdapPromise::failed(LdapError::local_error(
                "connection is closed",
            ));
        }
        let state = self.state.clone();
        let select_index = state.balancer.dispatch.select(&mut request);
        let operation = match (request, handler) {
            (Request::Search(search), Some(handler)) => {
                Operation::Search(search, handler)
            }
            (request, _) => Operation::Plain(request),
        };
        let candidates = state.balancer.candidate_order(select_index);
        let promise = LdapPromise::new();
        attempt(
            state,
            Arc::new(candidates),
            0,
            select_index,
            operation,
            promise.clone(),
        );
        promise
    }
}

// Try the operation against each candidate factory in turn. Factory-level
// connect failures advance to the next candidate; once a delegate
// connection is obtained the operation outcome, success or error, is final.
fn attempt(
    state: Arc<ConnectionState>,
    candidates: Arc<Vec<usize>>,
    position: usize,
    select_index: usize,
    operation: Operation,
    promise: LdapPromise<LdapResult>,
) {
    if position >= candidates.len() {
        let error =
            LdapError::connect_error("no operational connection factories");
        state.balancer.dispatch.complete(select_index);
        state.valid.store(false, Ordering::SeqCst);
        state.listeners.notify_error(false, &error);
        promise.complete(Err(error));
        return;
    }
    let index = candidates[position];
    let factory = state.balancer.factories[index].clone();
    factory.connection_async().on_complete(move |outcome| {
        match outcome {
            Ok(delegate) => {
                state.balancer.mark_online(index);
                forward(state, delegate.clone(), select_index, operation, promise);
            }
            Err(error) => {
                state.balancer.mark_offline(index, error);
                attempt(
                    state,
                    candidates,
                    position + 1,
                    select_index,
                    operation,
                    promise,
                );
            }
        }
    });
}

// Forward the operation on an established delegate connection and relay its
// outcome, closing the delegate and releasing the dispatch slot either way.
fn forward(
    state: Arc<ConnectionState>,
    delegate: Arc<dyn Connection>,
    select_index: usize,
    operation: Operation,
    promise: LdapPromise<LdapResult>,
) {
    let inner_promise = match operation {
        Operation::Plain(request) => delegate.request_async(request),
        Operation::Search(request, handler) => {
            delegate.search_async(request, handler)
        }
    };
    inner_promise.on_complete(move |outcome| {
        delegate.close();
        state.balancer.dispatch.complete(select_index);
        promise.complete(outcome.clone());
    });
}

impl Connection for BalancedConnection {
    fn request_async(&self, request: Request) -> LdapPromise<LdapResult> {
        self.run(request, None)
    }

    fn search_async(
        &self,
        request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        self.run(Request::Search(request), Some(handler))
    }

    fn is_valid(&self) -> bool {
        !self.is_closed() && self.state.valid.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.listeners.notify_closed();
        }
    }

    fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.state.listeners.add(listener);
    }

    fn remove_event_listener(
        &self,
        listener: &Arc<dyn ConnectionEventListener>,
    ) {
        self.state.listeners.remove(listener);
    }
}
