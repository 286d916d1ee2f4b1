// Copyright 2026 Directory Services Engineering

//! Option and state types for the cached connection pool.

use std::collections::VecDeque;
use std::sync::Arc;

use slog::Logger;

use crate::connection::Connection;
use crate::promise::LdapPromise;
use crate::time::TimeService;

/// Configuration for a [`CachedConnectionPool`](super::CachedConnectionPool).
/// All fields are optional; unset fields take the documented defaults.
#[derive(Default)]
pub struct ConnectionPoolOptions {
    /// Number of connections the pool retains through idle eviction. The
    /// default is 10.
    pub core_pool_size: Option<usize>,
    /// Maximum number of concurrently live (checked out + idle) connections.
    /// Defaults to the core pool size.
    pub max_pool_size: Option<usize>,
    /// Idle duration in milliseconds after which a cached connection is
    /// eligible for eviction. The default is 60,000.
    pub keep_alive_ms: Option<u64>,
    /// Time source for keep-alive bookkeeping. Defaults to the system clock;
    /// tests inject a fake to drive expiry deterministically.
    pub time: Option<Arc<dyn TimeService>>,
    /// An optional `slog` logger. Falls back to the `slog-stdlog` drain.
    pub log: Option<Logger>,
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// Checked-out plus idle connections.
    pub total_connections: usize,
    /// Connections currently cached in the idle list.
    pub idle_connections: usize,
    /// Claims queued waiting for a connection to be released.
    pub pending_claims: usize,
}

// An idle cache slot: the physical connection and the instant it was last
// released, per the injected time source.
pub(super) struct IdleConnection {
    pub connection: Arc<dyn Connection>,
    pub released_at_ms: u64,
}

// Everything guarded by the pool mutex. `total` and the idle list move
// together; no observer sees a state where they disagree.
pub(super) struct PoolData {
    pub idle: VecDeque<IdleConnection>,
    pub pending: VecDeque<LdapPromise<Arc<dyn Connection>>>,
    pub total: usize,
    pub closed: bool,
}

impl PoolData {
    pub fn new(max_size: usize) -> Self {
        PoolData {
            idle: VecDeque::with_capacity(max_size),
            pending: VecDeque::new(),
            total: 0,
            closed: false,
        }
    }
}
