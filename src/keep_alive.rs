// Copyright 2026 Directory Services Engineering

//! Heartbeat keep-alive over a connection factory.
//!
//! Wraps a [`ConnectionFactory`](crate::connection::ConnectionFactory) so
//! that the connections it produces are probed with a periodic heartbeat
//! search while idle. Any response proves the server is reachable, even an
//! error result; a connection whose heartbeat goes unanswered past the
//! timeout is marked invalid and its listeners are told, so a pool stacked
//! on top discards it instead of handing out a dead session. Operation
//! responses count as heartbeats, so busy connections are never probed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, o, warn, Drain, Logger};
use timer::Guard;

use crate::connection::{Connection, ConnectionFactory, SearchHandler};
use crate::event::{ConnectionEventListener, EventMulticaster};
use crate::promise::LdapPromise;
use crate::request::{Dn, Request, SearchEntry, SearchRequest, SearchScope};
use crate::result::{LdapError, LdapResult, ResultCode};
use crate::time::{SystemTimeService, TimeService};

// Default interval between heartbeats in milliseconds
const DEFAULT_INTERVAL_MS: u64 = 10_000;
// Default time allowed for a heartbeat response in milliseconds
const DEFAULT_TIMEOUT_MS: u64 = 500;

#[derive(Default)]
pub struct KeepAliveOptions {
    /// Interval between heartbeats on an idle connection.
    pub interval_ms: Option<u64>,
    /// A connection is marked invalid when a heartbeat goes unanswered for
    /// this long.
    pub timeout_ms: Option<u64>,
    /// The heartbeat request. Defaults to a base-object search of the root
    /// DSE returning no attributes.
    pub heartbeat: Option<SearchRequest>,
    pub time: Option<Arc<dyn TimeService>>,
    pub log: Option<Logger>,
}

/// A connection factory decorator that keeps its connections warm.
pub struct KeepAliveConnectionFactory {
    inner: Arc<KeepAliveInner>,
}

struct KeepAliveInner {
    factory: Arc<dyn ConnectionFactory>,
    heartbeat: SearchRequest,
    interval_ms: u64,
    timeout_ms: u64,
    time: Arc<dyn TimeService>,
    log: Logger,
    monitored: Mutex<Vec<Weak<MonitorState>>>,
    ticker: Mutex<Option<(timer::Timer, Guard)>>,
    closed: AtomicBool,
}

impl KeepAliveConnectionFactory {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        options: KeepAliveOptions,
    ) -> Self {
        let interval_ms =
            options.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS).max(1);
        let timeout_ms =
            options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).max(1);
        let heartbeat = options.heartbeat.unwrap_or_else(|| {
            SearchRequest::new(
                Dn::root(),
                SearchScope::BaseObject,
                "(objectclass=*)",
            )
        });
        let time = options
            .time
            .unwrap_or_else(|| Arc::new(SystemTimeService));
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let inner = Arc::new(KeepAliveInner {
            factory,
            heartbeat,
            interval_ms,
            timeout_ms,
            time,
            log,
            monitored: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // The ticker holds a weak reference so the timer, which lives inside
        // the factory, does not keep the factory alive.
        let ticker = timer::Timer::new();
        let weak = Arc::downgrade(&inner);
        let tick = ((interval_ms.min(timeout_ms)) / 2).max(1) as i64;
        let guard = ticker.schedule_repeating(
            chrono::Duration::milliseconds(tick),
            move || {
                if let Some(factory) = Weak::upgrade(&weak) {
                    factory.send_heartbeats();
                }
            },
        );
        *inner.ticker.lock().unwrap() = Some((ticker, guard));

        debug!(
            inner.log,
            "keep-alive factory created";
            "interval_ms" => interval_ms, "timeout_ms" => timeout_ms
        );
        KeepAliveConnectionFactory { inner }
    }

    /// Probe idle connections and time out unanswered heartbeats now. The
    /// periodic task calls this on its own schedule; tests drive it directly
    /// with a fake time source.
    pub fn send_heartbeats(&self) {
        self.inner.send_heartbeats();
    }
}

impl ConnectionFactory for KeepAliveConnectionFactory {
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return LdapPromise::failed(LdapError::local_error(
                "keep-alive factory is closed",
            ));
        }
        let promise: LdapPromise<Arc<dyn Connection>> = LdapPromise::new();
        let inner = self.inner.clone();
        let delivery = promise.clone();
        self.inner.factory.connection_async().on_complete(
            move |outcome| match outcome {
                Ok(connection) => {
                    delivery.complete(Ok(inner.monitor(connection.clone())));
                }
                Err(error) => {
                    delivery.complete(Err(error.clone()));
                }
            },
        );
        promise
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            *self.inner.ticker.lock().unwrap() = None;
            self.inner.factory.close();
        }
    }
}

impl KeepAliveInner {
    fn monitor(
        self: &Arc<Self>,
        physical: Arc<dyn Connection>,
    ) -> Arc<dyn Connection> {
        let listeners = Arc::new(EventMulticaster::new());
        let relay: Arc<dyn ConnectionEventListener> =
            Arc::new(MonitorEventRelay {
                listeners: listeners.clone(),
            });
        physical.add_event_listener(relay);
        let state = Arc::new(MonitorState {
            physical,
            time: self.time.clone(),
            last_response_ms: AtomicU64::new(self.time.now_millis()),
            heartbeat_sent_ms: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            listeners,
        });
        self.monitored.lock().unwrap().push(Arc::downgrade(&state));
        Arc::new(MonitoredConnection { state })
    }

    fn send_heartbeats(self: &Arc<Self>) {
        let now = self.time.now_millis();
        let states: Vec<Arc<MonitorState>> = {
            let mut monitored = self.monitored.lock().unwrap();
            monitored.retain(|weak| weak.strong_count() > 0);
            monitored.iter().filter_map(Weak::upgrade).collect()
        };
        for state in states {
            if !state.alive.load(Ordering::SeqCst)
                || state.physical.is_closed()
            {
                continue;
            }
            let sent = state.heartbeat_sent_ms.load(Ordering::SeqCst);
            if sent != 0 {
                // A heartbeat is still in flight. Only flag the connection
                // when nothing at all has been heard within the timeout; the
                // heartbeat may just be queued behind a surge of traffic.
                let last = state.last_response_ms.load(Ordering::SeqCst);
                if now.saturating_sub(sent) >= self.timeout_ms
                    && now.saturating_sub(last) >= self.timeout_ms
                {
                    warn!(
                        self.log,
                        "no heartbeat response within the timeout"
                    );
                    state.mark_dead(LdapError::new(
                        ResultCode::ClientSideTimeout,
                        "no heartbeat received within the timeout period",
                    ));
                }
                continue;
            }
            let last = state.last_response_ms.load(Ordering::SeqCst);
            if now.saturating_sub(last) < self.interval_ms {
                continue;
            }
            state.heartbeat_sent_ms.store(now, Ordering::SeqCst);
            let responded = state.clone();
            state
                .physical
                .search_async(self.heartbeat.clone(), Arc::new(DiscardEntries))
                .on_complete(move |outcome| {
                    // Any answer proves the server is there, an error result
                    // included. Cancellation is a client-side close aborting
                    // the search and proves nothing.
                    let answered = match outcome {
                        Ok(_) => true,
                        Err(error) => {
                            error.result_code
                                != ResultCode::ClientSideUserCancelled
                        }
                    };
                    if answered {
                        responded.stamp();
                    }
                    responded.heartbeat_sent_ms.store(0, Ordering::SeqCst);
                });
        }
    }
}

struct MonitorState {
    physical: Arc<dyn Connection>,
    time: Arc<dyn TimeService>,
    last_response_ms: AtomicU64,
    // 0 while no heartbeat is in flight
    heartbeat_sent_ms: AtomicU64,
    alive: AtomicBool,
    listeners: Arc<EventMulticaster>,
}

impl MonitorState {
    fn stamp(&self) {
        self.last_response_ms
            .store(self.time.now_millis(), Ordering::SeqCst);
    }

    fn mark_dead(&self, error: LdapError) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.listeners.notify_error(false, &error);
        }
    }
}

/// Forwards physical-connection events to the monitored wrapper's
/// listeners. Unlike a pooled checkout, the wrapper and the physical
/// connection live and die together, so closed events are forwarded too.
struct MonitorEventRelay {
    listeners: Arc<EventMulticaster>,
}

impl ConnectionEventListener for MonitorEventRelay {
    fn handle_connection_closed(&self) {
        self.listeners.notify_closed();
    }

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

/// Heartbeat entries target the root DSE and are of no interest.
struct DiscardEntries;

impl SearchHandler for DiscardEntries {
    fn handle_entry(&self, _entry: SearchEntry) -> bool {
        true
    }

    fn handle_reference(&self, _reference: String) -> bool {
        true
    }
}

struct MonitoredConnection {
    state: Arc<MonitorState>,
}

impl MonitoredConnection {
    // Re-deliver through a fresh promise so the response can refresh the
    // keep-alive stamp before the caller sees it.
    fn stamped(
        &self,
        inner: LdapPromise<LdapResult>,
    ) -> LdapPromise<LdapResult> {
        let outer: LdapPromise<LdapResult> = LdapPromise::new();
        let state = self.state.clone();
        let delivery = outer.clone();
        inner.on_complete(move |outcome| {
            if outcome.is_ok() {
                state.stamp();
            }
            delivery.complete(outcome.clone());
        });
        outer
    }
}

impl Connection for MonitoredConnection {
    fn request_async(&self, request: Request) -> LdapPromise<LdapResult> {
        self.stamped(self.state.physical.request_async(request))
    }

    fn search_async(
        &self,
        request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        self.stamped(self.state.physical.search_async(request, handler))
    }

    fn is_valid(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
            && self.state.physical.is_valid()
    }

    fn is_closed(&self) -> bool {
        self.state.physical.is_closed()
    }

    fn close(&self) {
        self.state.physical.close();
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
