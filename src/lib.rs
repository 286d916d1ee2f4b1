// Copyright 2026 Directory Services Engineering

//! Client-side connection pooling and load balancing for Directory Servers
//!
//! Dirpool manages logical connections to a set of LDAP Directory Servers.
//! Real connections come from implementations of the
//! [`ConnectionFactory`](connection::ConnectionFactory) trait; this crate
//! composes those factories into richer ones. A
//! [`CachedConnectionPool`](connection_pool::CachedConnectionPool) caches
//! idle connections from one factory, a
//! [`KeepAliveConnectionFactory`](keep_alive::KeepAliveConnectionFactory)
//! probes idle connections with heartbeats so dead sessions are detected
//! early, a [`RequestLoadBalancer`](load_balancer::RequestLoadBalancer)
//! spreads individual operations across several factories with failover,
//! and a
//! [`DistributionLoadBalancer`](distribution::DistributionLoadBalancer)
//! partitions one subtree across factories by consistent hashing of the
//! request DN. The composed factories all implement `ConnectionFactory`
//! themselves, so pools, balancers, and distributions stack freely.
//!
//! # Example
//!
//! Pool the connections of two replicas and balance requests across them.
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//!
//! use slog::{Drain, Logger, o};
//!
//! use dirpool::connection::{ConnectionFactory, SyncConnectionExt};
//! use dirpool::connection_pool::types::ConnectionPoolOptions;
//! use dirpool::connection_pool::CachedConnectionPool;
//! use dirpool::load_balancer::{LoadBalancerOptions, RequestLoadBalancer};
//! use dirpool::request::{Dn, Request};
//!
//! fn main() {
//!     let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//!     let log = Logger::root(
//!         Mutex::new(
//!             slog_term::FullFormat::new(plain).build()
//!         ).fuse(),
//!         o!("build-id" => "0.1.0")
//!     );
//!
//!     let replica1 = pool_for("ldap1.example.com", log.clone());
//!     let replica2 = pool_for("ldap2.example.com", log.clone());
//!
//!     let balancer = RequestLoadBalancer::round_robin(
//!         "replicas",
//!         vec![replica1, replica2],
//!         LoadBalancerOptions {
//!             log: Some(log),
//!             ..Default::default()
//!         },
//!     );
//!
//!     let connection = balancer.connection()?;
//!     let result = connection.request(Request::modify(
//!         Dn::parse("uid=bjensen,ou=people,dc=example,dc=com"),
//!     ))?;
//! }
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod distribution;
pub mod event;
pub mod hash_ring;
pub mod keep_alive;
pub mod load_balancer;
pub mod promise;
pub mod request;
pub mod result;
pub mod time;
