/*
 * Copyright 2020 Joyent, Inc.
 */

use thiserror::Error;

use crate::connection_pool::types::ConnectionCount;

/// Errors returned by the connection pool.
///
/// Only conditions the caller can act on cross the pool boundary. Failures of
/// the caller-supplied dial, close and keepalive functions inside the
/// background loops are logged and absorbed by the pool.
#[derive(Error, Debug)]
pub enum Error {
    /// The options passed to `ConnectionPool::new` are invalid. No pool was
    /// created.
    #[error("invalid connection pool configuration: {0}")]
    Configuration(String),
    /// Every slot of the pool is accounted for. The caller should back off
    /// and retry later.
    #[error(
        "pool was exhausted, detail: working: {in_use}, alive: {idle}, \
         retry: {retry}"
    )]
    PoolExhausted {
        in_use: ConnectionCount,
        idle: ConnectionCount,
        retry: ConnectionCount,
    },
    /// Creating a new connection failed on every attempt. A placeholder was
    /// queued so the recovery loop redials it in the background.
    #[error("dial failed after {attempts} attempts: {reason}")]
    DialFailed { attempts: u32, reason: String },
    /// No idle connection arrived within the acquire wait window and the
    /// remaining capacity is held by work in flight.
    #[error("acquire timeout")]
    AcquireTimeout,
    /// The pool has been released.
    #[error("pool stopped")]
    PoolStopped,
}
