// Copyright 2026 Directory Services Engineering

//! Data distribution across disjoint directory partitions.
//!
//! A [`DistributionLoadBalancer`] splits the entries directly under a
//! *balancing point* DN across a fixed set of partitions using the
//! consistent-hash ring from [`hash_ring`](crate::hash_ring). Each entry
//! lives on exactly one partition, determined by the routing key of its
//! ancestor one level below the balancing point, so routing is a pure
//! function of the request DN: no partition metadata is consulted at
//! request time.
//!
//! Operations that target a single entry route to a single partition.
//! Searches that could match entries on several partitions (at or above
//! the balancing point with a scope wider than the base object) are
//! broadcast to every partition and their results merged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, info, o, Drain, Logger};

use crate::connection::{Connection, ConnectionFactory, SearchHandler};
use crate::event::{ConnectionEventListener, EventMulticaster};
use crate::hash_ring::{ConsistentHashMap, PartitionKey};
use crate::promise::LdapPromise;
use crate::request::{Dn, Request, SearchRequest, SearchScope};
use crate::result::{LdapError, LdapResult};

/// Configuration for a [`DistributionLoadBalancer`].
#[derive(Default)]
pub struct DistributionOptions {
    /// An optional `slog` logger. Falls back to the `slog-stdlog` drain.
    pub log: Option<Logger>,
}

/// Where a request must be sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Route {
    /// Exactly one partition serves the request.
    Single(usize),
    /// The request may match entries on any partition.
    Broadcast,
}

/// A logical connection factory partitioning one subtree by DN.
pub struct DistributionLoadBalancer {
    inner: Arc<DistributionInner>,
}

struct DistributionInner {
    name: String,
    base_dn: Dn,
    partitions: Vec<Arc<dyn ConnectionFactory>>,
    // Built once at construction; membership is fixed for the balancer's
    // lifetime.
    ring: ConsistentHashMap<usize>,
    log: Logger,
    closed: AtomicBool,
}

impl DistributionLoadBalancer {
    /// Compose the partition factories into one logical factory. Each
    /// partition brings its ring key, its factory, and its ring weight
    /// (number of hash points; higher weight means a larger share of the
    /// distributed entries).
    pub fn new(
        name: &str,
        base_dn: Dn,
        partitions: Vec<(PartitionKey, Arc<dyn ConnectionFactory>, u32)>,
        options: DistributionOptions,
    ) -> Self {
        assert!(
            !partitions.is_empty(),
            "a distribution load balancer requires at least one partition"
        );
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("distribution" => name.to_owned()));
        let mut ring = ConsistentHashMap::new();
        let mut factories = Vec::with_capacity(partitions.len());
        for (index, (key, factory, weight)) in partitions.into_iter().enumerate()
        {
            ring.put(key, index, weight.max(1));
            factories.push(factory);
        }
        info!(
            log, "distributing subtree across partitions";
            "base_dn" => %base_dn, "partitions" => factories.len()
        );
        DistributionLoadBalancer {
            inner: Arc::new(DistributionInner {
                name: name.to_owned(),
                base_dn,
                partitions: factories,
                ring,
                log,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The route a request would take. Exposed for diagnostics and tests.
    pub fn route(&self, request: &Request) -> Route {
        self.inner.route(request)
    }
}

impl std::fmt::Debug for DistributionLoadBalancer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("DistributionLoadBalancer")
            .field("name", &self.inner.name)
            .field("base_dn", &self.inner.base_dn)
            .field("partitions", &self.inner.partitions.len())
            .finish()
    }
}

impl ConnectionFactory for DistributionLoadBalancer {
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return LdapPromise::failed(LdapError::local_error(
                "distribution load balancer is closed",
            ));
        }
        let connection: Arc<dyn Connection> =
            Arc::new(DistributionConnection::new(self.inner.clone()));
        LdapPromise::completed(connection)
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(self.inner.log, "closing distribution load balancer");
            for partition in &self.inner.partitions {
                partition.close();
            }
        }
    }
}

impl DistributionInner {
    // The partition owning the entry one level below the balancing point on
    // the path to `dn`. For DNs at or outside the balancing point the DN's
    // own routing key decides, which keeps routing total.
    fn partition_for(&self, dn: &Dn) -> usize {
        let key = if dn.is_descendant_of(&self.base_dn) {
            dn.ancestor_or_self(self.base_dn.rdn_count() + 1)
                .to_normalized_url_safe_string()
        } else {
            dn.to_normalized_url_safe_string()
        };
        // The ring always has at least one partition.
        *self.ring.get(&key).unwrap_or(&0)
    }

    fn route(&self, request: &Request) -> Route {
        match request {
            Request::Search(search) => self.route_search(search),
            // Single-entry operations touch exactly one partition. Extended
            // operations have no target DN and route by their own key.
            Request::Extended { .. } => {
                let key = request.routing_key();
                Route::Single(*self.ring.get(&key).unwrap_or(&0))
            }
            _ => {
                let dn = request
                    .dn()
                    .expect("non-extended requests always carry a DN");
                Route::Single(self.partition_for(dn))
            }
        }
    }

    fn route_search(&self, search: &SearchRequest) -> Route {
        if search.dn.is_descendant_of(&self.base_dn) {
            // Strictly below the balancing point: the whole candidate set
            // lives under one distributed entry.
            Route::Single(self.partition_for(&search.dn))
        } else if search.dn == self.base_dn {
            match search.scope {
                // The balancing point entry itself is replicated to every
                // partition; reading it needs only one.
                SearchScope::BaseObject => {
                    Route::Single(self.partition_for(&search.dn))
                }
                _ => Route::Broadcast,
            }
        } else if self.base_dn.is_descendant_of(&search.dn) {
            // Above the balancing point: any scope other than the base
            // object may reach distributed entries on any partition.
            match search.scope {
                SearchScope::BaseObject => {
                    Route::Single(self.partition_for(&search.dn))
                }
                _ => Route::Broadcast,
            }
        } else {
            // Unrelated to the distributed subtree; any partition can
            // answer, and hashing keeps the choice stable.
            Route::Single(self.partition_for(&search.dn))
        }
    }
}

/// The logical connection handed out by [`DistributionLoadBalancer`].
///
/// Unlike the per-operation connections of the request load balancer, a
/// distribution connection caches one delegate connection per partition for
/// its own lifetime and closes them all when it is closed.
struct DistributionConnection {
    state: Arc<DistributionState>,
}

struct DistributionState {
    inner: Arc<DistributionInner>,
    subs: Mutex<HashMap<usize, Arc<dyn Connection>>>,
    closed: AtomicBool,
    listeners: EventMulticaster,
}

impl DistributionConnection {
    fn new(inner: Arc<DistributionInner>) -> Self {
        DistributionConnection {
            state: Arc::new(DistributionState {
                inner,
                subs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                listeners: EventMulticaster::new(),
            }),
        }
    }
}

impl DistributionState {
    // Obtain (opening if necessary) the cached delegate connection for a
    // partition. Concurrent openers race; the loser's connection is closed
    // and the cached one wins.
    fn sub_connection(
        self: &Arc<Self>,
        index: usize,
    ) -> LdapPromise<Arc<dyn Connection>> {
        if let Some(existing) = self.subs.lock().unwrap().get(&index) {
            return LdapPromise::completed(existing.clone());
        }
        let promise = LdapPromise::new();
        let state = self.clone();
        let delivery = promise.clone();
        self.inner.partitions[index].connection_async().on_complete(
            move |outcome| match outcome {
                Ok(connection) => {
                    let winner;
                    {
                        let mut subs = state.subs.lock().unwrap();
                        if state.closed.load(Ordering::SeqCst) {
                            drop(subs);
                            connection.close();
                            delivery.complete(Err(LdapError::local_error(
                                "connection is closed",
                            )));
                            return;
                        }
                        winner = subs
                            .entry(index)
                            .or_insert_with(|| connection.clone())
                            .clone();
                    }
                    if !Arc::ptr_eq(&winner, connection) {
                        connection.close();
                    }
                    delivery.complete(Ok(winner));
                }
                Err(error) => {
                    delivery.complete(Err(error.clone()));
                }
            },
        );
        promise
    }

    fn run(
        self: &Arc<Self>,
        request: Request,
        handler: Option<Arc<dyn SearchHandler>>,
    ) -> LdapPromise<LdapResult> {
        if self.closed.load(Ordering::SeqCst) {
            return LdapPromise::failed(LdapError::local_error(
                "connection is closed",
            ));
        }
        match self.inner.route(&request) {
            Route::Single(index) => self.run_single(index, request, handler),
            Route::Broadcast => match (request, handler) {
                (Request::Search(search), Some(handler)) => {
                    self.broadcast_search(search, handler)
                }
                // Only searches broadcast; route() never says otherwise.
                _ => LdapPromise::failed(LdapError::local_error(
                    "broadcast requires a search operation",
                )),
            },
        }
    }

    fn run_single(
        self: &Arc<Self>,
        index: usize,
        request: Request,
        handler: Option<Arc<dyn SearchHandler>>,
    ) -> LdapPromise<LdapResult> {
        debug!(
            self.inner.log, "routing operation to a single partition";
            "partition" => index
        );
        let promise = LdapPromise::new();
        let delivery = promise.clone();
        self.sub_connection(index).on_complete(move |outcome| {
            match outcome {
                Ok(delegate) => {
                    let forwarded = match (request, handler) {
                        (Request::Search(search), Some(handler)) => {
                            delegate.search_async(search, handler)
                        }
                        (request, _) => delegate.request_async(request),
                    };
                    forwarded.on_complete(move |outcome| {
                        delivery.complete(outcome.clone());
                    });
                }
                Err(error) => {
                    delivery.complete(Err(error.clone()));
                }
            }
        });
        promise
    }

    // Issue the search on every partition, stream all results through the
    // caller's handler, and complete once every partition has answered. The
    // first error wins; entries already delivered stay delivered.
    fn broadcast_search(
        self: &Arc<Self>,
        search: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        let count = self.inner.partitions.len();
        debug!(
            self.inner.log, "broadcasting search to all partitions";
            "partitions" => count
        );
        let promise = LdapPromise::new();
        let remaining = Arc::new(AtomicUsize::new(count));
        let first_error: Arc<Mutex<Option<LdapError>>> =
            Arc::new(Mutex::new(None));

        for index in 0..count {
            let search = search.clone();
            let handler = handler.clone();
            let delivery = promise.clone();
            let remaining = remaining.clone();
            let first_error = first_error.clone();
            let settle = move |outcome: Result<LdapResult, LdapError>| {
                if let Err(error) = outcome {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                }
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let error = first_error.lock().unwrap().take();
                    match error {
                        Some(error) => delivery.complete(Err(error)),
                        None => delivery.complete(Ok(LdapResult::success())),
                    };
                }
            };
            self.sub_connection(index).on_complete(move |outcome| {
                match outcome {
                    Ok(delegate) => {
                        delegate.search_async(search, handler).on_complete(
                            move |outcome| settle(outcome.clone()),
                        );
                    }
                    Err(error) => settle(Err(error.clone())),
                }
            });
        }
        promise
    }
}

impl Connection for DistributionConnection {
    fn request_async(&self, request: Request) -> LdapPromise<LdapResult> {
        self.state.run(request, None)
    }

    fn search_async(
        &self,
        request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        self.state.run(Request::Search(request), Some(handler))
    }

    fn is_valid(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let subs = self.state.subs.lock().unwrap();
        subs.values().all(|sub| sub.is_valid())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            let subs: Vec<Arc<dyn Connection>> = {
                let mut cached = self.state.subs.lock().unwrap();
                cached.drain().map(|(_, sub)| sub).collect()
            };
            for sub in subs {
                sub.close();
            }
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
