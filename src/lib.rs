//
// Copyright 2020 Joyent, Inc.
//

//! A bounded, self-healing pool of RPC client connections
//!
//! This crate manages a pool of expensive, long-lived connections to a single
//! backend service, such as Thrift clients over a custom transport. The pool
//! never looks inside a connection. Users hand it three functions and the pool
//! takes care of the connection lifecycle, the capacity bound, retrying failed
//! dials and periodically checking that idle connections are still alive.
//!
//! ## Connection functions
//!
//! The connection type `C` is a type parameter of the pool. Each function
//! receives the pool name as a tag so one set of functions can serve several
//! pools:
//!
//! * `dial: Fn(&str) -> Result<C, ConnectionError>` establishes a new
//!   connection.
//! * `close: Fn(&str, C) -> Result<(), ConnectionError>` closes a connection
//!   the pool no longer tracks.
//! * `keepalive: Fn(&str, &mut C) -> Result<(), ConnectionError>` probes an
//!   idle connection.
//!
//! All three are required; omitting one is a configuration error.
//!
//! ## Acquiring connections
//!
//! [`get`](connection_pool/struct.ConnectionPool.html#method.get) returns an
//! idle connection if one is available or becomes available within the
//! acquire wait window (1 second by default). After the window a new
//! connection is dialed, retrying up to `dial_retry_count` times, as long as
//! the pool is below `max_pool_size`. When every dial attempt fails a
//! placeholder is queued for the recovery loop and the call fails with
//! `Error::DialFailed`. When the pool is full the call fails with
//! `Error::PoolExhausted`.
//!
//! Connections obtained with `get` are returned with `put`. The `claim`
//! function wraps a connection in a guard that returns it on drop.
//!
//! ## Health checking and recovery
//!
//! Every `keepalive_interval` (30 seconds by default) the health sweep probes
//! the connections that were idle when the sweep started. Connections that
//! fail are closed and replaced by a placeholder awaiting redial. Every
//! `dial_retry_interval` (30 seconds by default) the recovery loop makes one
//! dial attempt per placeholder and returns successful connections to the
//! idle set. By default the recovery loop retries until the pool is released;
//! `max_redial_attempts` bounds the number of attempts per placeholder.
//!
//! The capacity invariant counts every state a connection can be in:
//! checked out, idle, waiting for redial, or held by the pool while it is
//! being dialed or probed. Their sum never exceeds `max_pool_size`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use rpc_client_pool::connection::ConnectionError;
//! use rpc_client_pool::connection_pool::types::ConnectionPoolOptions;
//! use rpc_client_pool::connection_pool::ConnectionPool;
//!
//! struct ThriftClient;
//!
//! let pool_opts = ConnectionPoolOptions {
//!     name: String::from("search-service"),
//!     dial: Some(Box::new(
//!         |_tag: &str| -> Result<ThriftClient, ConnectionError> {
//!             Ok(ThriftClient)
//!         },
//!     )),
//!     close: Some(Box::new(
//!         |_tag: &str, _conn: ThriftClient| -> Result<(), ConnectionError> {
//!             Ok(())
//!         },
//!     )),
//!     keepalive: Some(Box::new(
//!         |_tag: &str,
//!          _conn: &mut ThriftClient|
//!          -> Result<(), ConnectionError> { Ok(()) },
//!     )),
//!     max_pool_size: 10,
//!     initial_pool_size: 2,
//!     acquire_wait: Some(Duration::from_millis(200)),
//!     ..Default::default()
//! };
//!
//! let pool = ConnectionPool::new(pool_opts).unwrap();
//!
//! let conn = pool.get().unwrap();
//! // Do stuff here
//! pool.put(Some(conn));
//!
//! {
//!     let _conn = pool.claim().unwrap();
//!     // The connection is returned to the pool when it falls out of scope.
//! }
//!
//! pool.release();
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod error;
