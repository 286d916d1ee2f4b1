// Copyright 2026 Directory Services Engineering

//! Shared fixtures for the integration tests: a scripted connection
//! factory, a fake clock, and a test logger.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{o, Drain, Logger};

use dirpool::connection::{Connection, ConnectionFactory, SearchHandler};
use dirpool::event::{ConnectionEventListener, EventMulticaster};
use dirpool::promise::LdapPromise;
use dirpool::request::{Request, SearchEntry, SearchRequest};
use dirpool::result::{LdapError, LdapResult};
use dirpool::time::TimeService;

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "test"),
    )
}

/// A clock the tests advance by hand.
#[derive(Default)]
pub struct FakeTime {
    now: AtomicU64,
}

impl FakeTime {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeTime::default())
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeService for FakeTime {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// An in-memory connection that records every operation in a shared
/// journal, keyed by the owning factory's label.
pub struct MockConnection {
    pub label: String,
    pub valid: AtomicBool,
    closed: AtomicBool,
    pub close_count: AtomicUsize,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub search_entries: Mutex<Vec<SearchEntry>>,
    /// When set, searches park their promise in `pending_searches` instead
    /// of completing, so a test decides when and how each search answers.
    pub manual_search: AtomicBool,
    pub pending_searches: Mutex<Vec<LdapPromise<LdapResult>>>,
    listeners: EventMulticaster,
}

impl MockConnection {
    pub fn new(label: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(MockConnection {
            label: label.to_owned(),
            valid: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            journal,
            search_entries: Mutex::new(Vec::new()),
            manual_search: AtomicBool::new(false),
            pending_searches: Mutex::new(Vec::new()),
            listeners: EventMulticaster::new(),
        })
    }

    fn record(&self, event: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, event));
    }

    /// Simulate the server reporting a connection failure.
    pub fn fire_error(&self, is_disconnect: bool, error: &LdapError) {
        self.listeners.notify_error(is_disconnect, error);
    }

    /// Simulate an unsolicited notification from the server.
    pub fn fire_unsolicited(&self, oid: &str) {
        self.listeners.notify_unsolicited(oid);
    }
}

impl Connection for MockConnection {
    fn request_async(&self, _request: Request) -> LdapPromise<LdapResult> {
        if self.is_closed() {
            return LdapPromise::failed(LdapError::local_error(
                "mock connection is closed",
            ));
        }
        self.record("request");
        LdapPromise::completed(LdapResult::success())
    }

    fn search_async(
        &self,
        _request: SearchRequest,
        handler: Arc<dyn SearchHandler>,
    ) -> LdapPromise<LdapResult> {
        if self.is_closed() {
            return LdapPromise::failed(LdapError::local_error(
                "mock connection is closed",
            ));
        }
        self.record("search");
        if self.manual_search.load(Ordering::SeqCst) {
            let promise = LdapPromise::new();
            self.pending_searches.lock().unwrap().push(promise.clone());
            return promise;
        }
        for entry in self.search_entries.lock().unwrap().iter() {
            if !handler.handle_entry(entry.clone()) {
                break;
            }
        }
        LdapPromise::completed(LdapResult::success())
    }

    fn is_valid(&self) -> bool {
        !self.is_closed() && self.valid.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record("close");
            self.listeners.notify_closed();
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

/// A scripted connection factory.
///
/// By default every `connection_async` immediately succeeds with a fresh
/// [`MockConnection`]. With `fail` set it immediately fails with a connect
/// error, and in manual mode it parks the promise in `pending` so the test
/// decides when and how each connect completes.
pub struct MockFactory {
    pub label: String,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub fail: AtomicBool,
    pub manual: AtomicBool,
    pub closed: AtomicBool,
    pub created: Mutex<Vec<Arc<MockConnection>>>,
    pub pending: Mutex<Vec<LdapPromise<Arc<dyn Connection>>>>,
    pub search_entries: Mutex<Vec<SearchEntry>>,
}

impl MockFactory {
    pub fn new(label: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(MockFactory {
            label: label.to_owned(),
            journal,
            fail: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            search_entries: Mutex::new(Vec::new()),
        })
    }

    /// Build the connection a successful connect would deliver, without
    /// delivering it. Manual-mode tests pass these to parked promises.
    pub fn make_connection(&self) -> Arc<MockConnection> {
        let connection =
            MockConnection::new(&self.label, self.journal.clone());
        *connection.search_entries.lock().unwrap() =
            self.search_entries.lock().unwrap().clone();
        self.created.lock().unwrap().push(connection.clone());
        connection
    }

    pub fn connect_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn record(&self, event: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, event));
    }
}

impl ConnectionFactory for MockFactory {
    fn connection_async(&self) -> LdapPromise<Arc<dyn Connection>> {
        if self.fail.load(Ordering::SeqCst) {
            self.record("connect-failed");
            return LdapPromise::failed(LdapError::connect_error(format!(
                "{} is unreachable",
                self.label
            )));
        }
        if self.manual.load(Ordering::SeqCst) {
            let promise = LdapPromise::new();
            self.pending.lock().unwrap().push(promise.clone());
            return promise;
        }
        self.record("connect");
        let connection: Arc<dyn Connection> = self.make_connection();
        LdapPromise::completed(connection)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Events seen by a [`ConnectionEventListener`], in order.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionEventListener for RecordingListener {
    fn handle_connection_closed(&self) {
        self.events.lock().unwrap().push("closed".to_owned());
    }

    fn handle_connection_error(&self, _: bool, error: &LdapError) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error:{}", error.result_code));
    }

    fn handle_unsolicited_notification(&self, oid: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("unsolicited:{}", oid));
    }
}
