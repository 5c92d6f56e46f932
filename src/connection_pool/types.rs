/*
 * Copyright 2020 Joyent, Inc.
 */

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub};
use slog::Logger;

use crate::connection::{CloseFn, DialFn, KeepAliveFn};

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ConnectionPoolStats {
    /// The number of connections checked out by callers
    pub in_use_connections: ConnectionCount,
    /// The number of idle connections believed to be healthy
    pub idle_connections: ConnectionCount,
    /// The number of connections that passed the current health sweep and
    /// are waiting to be merged back into the idle set
    pub pending_connections: ConnectionCount,
    /// The number of failed connections waiting for the recovery loop to
    /// redial them
    pub awaiting_redial: ConnectionCount,
    /// The number of connections the pool itself is currently dialing or
    /// probing
    pub in_flight_connections: ConnectionCount,
}

impl ConnectionPoolStats {
    /// The number of slots of the pool that are accounted for. This never
    /// exceeds the maximum pool size.
    pub fn total_connections(&self) -> ConnectionCount {
        self.in_use_connections
            + self.idle_connections
            + self.pending_connections
            + self.awaiting_redial
            + self.in_flight_connections
    }
}

/// The configuration options for a connection pool. This is required to
/// instantiate a new connection pool.
///
/// The `dial`, `close` and `keepalive` functions have no defaults; leaving
/// any of them unset is a configuration error. Every other `Option` falls back
/// to a default when it is `None`.
pub struct ConnectionPoolOptions<C> {
    /// A diagnostic label for the pool. It is passed as the tag argument to
    /// every connection function.
    pub name: String,
    /// Establishes a new connection.
    pub dial: Option<DialFn<C>>,
    /// Closes a connection the pool no longer tracks.
    pub close: Option<CloseFn<C>>,
    /// Probes an idle connection for liveness.
    pub keepalive: Option<KeepAliveFn<C>>,
    /// The hard ceiling on connections tracked by the pool. Must be at least
    /// 1.
    pub max_pool_size: u32,
    /// The number of connections dialed when the pool is created. Values
    /// larger than `max_pool_size` are clamped.
    pub initial_pool_size: u32,
    /// How long `get` waits for an idle connection before trying to dial a
    /// new one. If not specified the default is 1 second. `Duration::MAX`
    /// waits until a connection is returned or the pool is released.
    pub acquire_wait: Option<Duration>,
    /// The period of the health sweep. If not specified the default is 30
    /// seconds.
    pub keepalive_interval: Option<Duration>,
    /// The period of the recovery loop. If not specified the default is 30
    /// seconds.
    pub dial_retry_interval: Option<Duration>,
    /// How many times `get` tries to dial before giving up. If not specified
    /// the default is 3.
    pub dial_retry_count: Option<u32>,
    /// How many failed redials a connection placeholder survives before the
    /// recovery loop evicts it. If not specified the recovery loop retries
    /// until the pool is released.
    pub max_redial_attempts: Option<u32>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

impl<C> Default for ConnectionPoolOptions<C> {
    fn default() -> Self {
        ConnectionPoolOptions {
            name: String::from("pool"),
            dial: None,
            close: None,
            keepalive: None,
            max_pool_size: 10,
            initial_pool_size: 0,
            acquire_wait: None,
            keepalive_interval: None,
            dial_retry_interval: None,
            dial_retry_count: None,
            max_redial_attempts: None,
            log: None,
        }
    }
}

impl<C> fmt::Debug for ConnectionPoolOptions<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPoolOptions")
            .field("name", &self.name)
            .field("dial", &self.dial.is_some())
            .field("close", &self.close.is_some())
            .field("keepalive", &self.keepalive.is_some())
            .field("max_pool_size", &self.max_pool_size)
            .field("initial_pool_size", &self.initial_pool_size)
            .field("acquire_wait", &self.acquire_wait)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("dial_retry_interval", &self.dial_retry_interval)
            .field("dial_retry_count", &self.dial_retry_count)
            .field("max_redial_attempts", &self.max_redial_attempts)
            .field("log", &self.log)
            .finish()
    }
}

/// A newtype wrapper around u32 used for counts of connections mainatained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
)]
pub struct ConnectionCount(u32);

impl ConnectionCount {
    /// Decrease the count by one without going below zero.
    pub fn decrement(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }
}

/// A fixed-capacity FIFO queue. Pushing into a full queue hands the item back
/// to the caller instead of blocking.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove every item currently queued.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn count(&self) -> ConnectionCount {
        ConnectionCount(self.items.len() as u32)
    }
}

// Stands in for a connection that failed its last health probe or dial. The
// recovery loop replaces it with a freshly dialed connection.
#[doc(hidden)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RedialTicket {
    pub failed_attempts: u32,
}

impl RedialTicket {
    pub fn failed(self) -> Self {
        RedialTicket {
            failed_attempts: self.failed_attempts.saturating_add(1),
        }
    }
}

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionData<C> {
    pub idle: BoundedQueue<C>,
    pub pending: BoundedQueue<C>,
    pub awaiting_redial: BoundedQueue<RedialTicket>,
    pub in_use: ConnectionCount,
    pub in_flight: ConnectionCount,
    pub state: ConnectionPoolState,
}

impl<C> ConnectionData<C> {
    #[doc(hidden)]
    pub fn new(max_size: usize) -> Self {
        ConnectionData {
            idle: BoundedQueue::new(max_size),
            pending: BoundedQueue::new(max_size),
            awaiting_redial: BoundedQueue::new(max_size),
            in_use: ConnectionCount::from(0),
            in_flight: ConnectionCount::from(0),
            state: ConnectionPoolState::Running,
        }
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        ConnectionPoolStats {
            in_use_connections: self.in_use,
            idle_connections: self.idle.count(),
            pending_connections: self.pending.count(),
            awaiting_redial: self.awaiting_redial.count(),
            in_flight_connections: self.in_flight,
        }
    }

    // Take an idle connection, preferring the healthy set. Either queue will
    // do.
    pub fn take_idle(&mut self) -> Option<C> {
        self.idle.pop().or_else(|| self.pending.pop())
    }

    pub fn is_stopped(&self) -> bool {
        match self.state {
            ConnectionPoolState::Running => false,
            ConnectionPoolState::Stopping | ConnectionPoolState::Stopped => {
                true
            }
        }
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<C>(Mutex<ConnectionData<C>>, Condvar);

impl<C> ProtectedData<C> {
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Mutex::new(connection_data), Condvar::new())
    }

    // Every mutation completes before the guard is released, so the data is
    // consistent even if a caller panicked while holding the lock.
    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        timeout: Duration,
    ) -> (MutexGuard<'a, ConnectionData<C>>, bool) {
        let (guard, wait_result) = self
            .1
            .wait_timeout(g, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, wait_result.timed_out())
    }

    pub fn condvar_notify(&self) {
        self.1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        self.1.notify_all()
    }
}

// Internal data type used to tell the background loops to exit. The loops
// sleep on the condvar for their interval, so raising the signal ends the
// sleep early.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct StopSignal(Mutex<bool>, Condvar);

impl StopSignal {
    #![allow(clippy::mutex_atomic)]
    pub fn new() -> Self {
        StopSignal(Mutex::new(false), Condvar::new())
    }

    fn get_lock(&self) -> MutexGuard<bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn raise(&self) {
        let mut stopped = self.get_lock();
        *stopped = true;
        self.1.notify_all()
    }

    pub fn is_raised(&self) -> bool {
        *self.get_lock()
    }

    /// Sleep for `timeout` or until the signal is raised. Returns whether the
    /// signal is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.get_lock();
        let (stopped, _) = self
            .1
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and able to service connection requests.
    Running,
    /// The connection pool is draining its idle connections and is no longer
    /// accepting connection requests.
    Stopping,
    /// The connection pool is stopped and is no longer accepting connection
    /// requests.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopping => String::from("stopping").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}
