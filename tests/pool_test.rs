// Copyright 2026 Directory Services Engineering

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use dirpool::connection::{Connection, ConnectionFactory};
use dirpool::connection_pool::types::ConnectionPoolOptions;
use dirpool::connection_pool::CachedConnectionPool;
use dirpool::result::{LdapError, ResultCode};

mod common;

use common::{FakeTime, MockFactory, RecordingListener};

fn pool_with(
    factory: Arc<MockFactory>,
    core: usize,
    max: usize,
    keep_alive_ms: u64,
    time: Arc<FakeTime>,
) -> CachedConnectionPool {
    CachedConnectionPool::new(
        factory,
        ConnectionPoolOptions {
            core_pool_size: Some(core),
            max_pool_size: Some(max),
            keep_alive_ms: Some(keep_alive_ms),
            time: Some(time),
            log: Some(common::test_log()),
        },
    )
}

#[test]
fn claim_reuses_cached_connection() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 2, 2, 60_000, FakeTime::new());

    let first = pool.connection().unwrap();
    assert_eq!(factory.connect_count(), 1);
    first.close();
    assert_eq!(pool.stats().idle_connections, 1);

    let second = pool.connection().unwrap();
    // Cached, not re-created.
    assert_eq!(factory.connect_count(), 1);
    second.close();
}

#[test]
fn saturated_pool_queues_claims_in_fifo_order() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 2, 2, 60_000, FakeTime::new());

    let first = pool.connection().unwrap();
    let second = pool.connection().unwrap();
    assert_eq!(pool.stats().total_connections, 2);

    let third = pool.connection_async();
    let fourth = pool.connection_async();
    assert!(!third.is_done());
    assert!(!fourth.is_done());
    assert_eq!(pool.stats().pending_claims, 2);
    // Saturation never over-creates.
    assert_eq!(factory.connect_count(), 2);

    first.close();
    assert!(third.is_done());
    assert!(!fourth.is_done());

    second.close();
    assert!(fourth.is_done());
    third.get().unwrap().close();
    fourth.get().unwrap().close();
}

#[test]
fn cancelled_waiter_is_skipped_on_release() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 1, 1, 60_000, FakeTime::new());

    let held = pool.connection().unwrap();
    let abandoned = pool.connection_async();
    let waiting = pool.connection_async();
    abandoned.cancel();

    held.close();
    assert!(waiting.is_done());
    assert_eq!(
        abandoned.get().err().unwrap().result_code,
        ResultCode::ClientSideUserCancelled
    );
    waiting.get().unwrap().close();
}

#[test]
fn stale_idle_connection_is_discarded_and_replaced() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 2, 2, 60_000, FakeTime::new());

    pool.connection().unwrap().close();
    let physical = factory.created.lock().unwrap()[0].clone();
    physical.valid.store(false, Ordering::SeqCst);

    let replacement = pool.connection().unwrap();
    assert!(replacement.is_valid());
    // The stale connection was closed and does not count against the size.
    assert_eq!(physical.close_count.load(Ordering::SeqCst), 1);
    assert_eq!(factory.connect_count(), 2);
    assert_eq!(pool.stats().total_connections, 1);
    replacement.close();
}

#[test]
fn invalid_release_closes_underlying_exactly_once() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 2, 2, 60_000, FakeTime::new());

    let connection = pool.connection().unwrap();
    let physical = factory.created.lock().unwrap()[0].clone();
    physical.valid.store(false, Ordering::SeqCst);

    connection.close();
    assert_eq!(physical.close_count.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(pool.stats().idle_connections, 0);
}

#[test]
fn invalid_release_starts_replacement_for_queued_waiter() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 1, 1, 60_000, FakeTime::new());

    let held = pool.connection().unwrap();
    let waiting = pool.connection_async();
    assert!(!waiting.is_done());

    factory.created.lock().unwrap()[0]
        .valid
        .store(false, Ordering::SeqCst);
    held.close();

    // The waiter got a freshly created connection, not the dead one.
    assert!(waiting.is_done());
    let replacement = waiting.get().unwrap();
    assert!(replacement.is_valid());
    assert_eq!(factory.connect_count(), 2);
    replacement.close();
}

#[test]
fn factory_failure_fails_every_pending_claim() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    factory.manual.store(true, Ordering::SeqCst);
    let pool = pool_with(factory.clone(), 2, 2, 60_000, FakeTime::new());

    let first = pool.connection_async();
    let second = pool.connection_async();
    let third = pool.connection_async();
    let fourth = pool.connection_async();
    assert_eq!(pool.stats().pending_claims, 2);

    let connects: Vec<_> = factory.pending.lock().unwrap().clone();
    assert_eq!(connects.len(), 2);
    connects[0].complete(Err(LdapError::connect_error("ldap1 unreachable")));

    // One failed connect fails the claim it was serving and every queued
    // claim; the other in-flight connect is unaffected.
    assert_eq!(
        first.get().err().unwrap().result_code,
        ResultCode::ClientSideConnectError
    );
    assert_eq!(
        third.get().err().unwrap().result_code,
        ResultCode::ClientSideConnectError
    );
    assert_eq!(
        fourth.get().err().unwrap().result_code,
        ResultCode::ClientSideConnectError
    );
    assert!(!second.is_done());

    let delivered: Arc<dyn Connection> = factory.make_connection();
    connects[1].complete(Ok(delivered));
    second.get().unwrap().close();
}

#[test]
fn eviction_respects_keep_alive_and_core_size() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let time = FakeTime::new();
    let pool = pool_with(factory.clone(), 2, 4, 100, time.clone());

    let connections: Vec<_> =
        (0..4).map(|_| pool.connection().unwrap()).collect();
    assert_eq!(pool.stats().total_connections, 4);
    for connection in connections {
        connection.close();
    }
    assert_eq!(pool.stats().idle_connections, 4);

    // Nothing has been idle for the keep-alive period yet.
    time.set(50);
    pool.purge_stale_connections();
    assert_eq!(pool.stats().total_connections, 4);

    // All four are expired, but eviction stops at the core size.
    time.set(150);
    pool.purge_stale_connections();
    assert_eq!(pool.stats().total_connections, 2);
    assert_eq!(pool.stats().idle_connections, 2);

    // Churn back up to four: the two survivors are reused, two are created.
    time.set(200);
    let connections: Vec<_> =
        (0..4).map(|_| pool.connection().unwrap()).collect();
    assert_eq!(factory.connect_count(), 6);
    for connection in connections {
        connection.close();
    }
    assert_eq!(pool.stats().idle_connections, 4);

    time.set(350);
    pool.purge_stale_connections();
    assert_eq!(pool.stats().total_connections, 2);
    assert_eq!(pool.stats().idle_connections, 2);
}

#[test]
fn checked_out_wrapper_relays_physical_connection_events() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 1, 1, 60_000, FakeTime::new());

    let connection = pool.connection().unwrap();
    let listener = RecordingListener::new();
    connection.add_event_listener(listener.clone());

    let physical = factory.created.lock().unwrap()[0].clone();
    physical.fire_error(false, &LdapError::local_error("idle timeout"));
    physical.fire_unsolicited("1.3.6.1.4.1.1466.20036");
    assert_eq!(
        listener.events(),
        vec!["error:local error", "unsolicited:1.3.6.1.4.1.1466.20036"]
    );

    // Closing the handle reports the wrapper close and detaches from the
    // physical connection, so later physical events stay out of it.
    connection.close();
    physical.fire_error(false, &LdapError::local_error("idle timeout"));
    assert_eq!(
        listener.events(),
        vec![
            "error:local error",
            "unsolicited:1.3.6.1.4.1.1466.20036",
            "closed"
        ]
    );
}

#[test]
fn close_fails_waiters_and_closes_idle_connections() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let factory = MockFactory::new("ldap1", journal);
    let pool = pool_with(factory.clone(), 1, 1, 60_000, FakeTime::new());

    let held = pool.connection().unwrap();
    let waiting = pool.connection_async();
    pool.close();

    let error = waiting.get().err().unwrap();
    assert_eq!(error.result_code, ResultCode::ClientSideLocalError);

    // A connection released after close is discarded, not cached.
    held.close();
    let physical = factory.created.lock().unwrap()[0].clone();
    assert_eq!(physical.close_count.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_connections, 0);

    let late = pool.connection();
    assert_eq!(
        late.err().unwrap().result_code,
        ResultCode::ClientSideLocalError
    );
}
