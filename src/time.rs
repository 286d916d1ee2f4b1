// Copyright 2026 Directory Services Engineering

//! Injectable time source.
//!
//! Keep-alive bookkeeping in the pool reads time only through this trait so
//! tests can advance a fake clock instead of sleeping.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait TimeService: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall-clock time source used in production.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}
