/*
 * Copyright 2020 Joyent, Inc.
 */

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::connection::{ConnectionError, ConnectionFunctions};
use crate::connection_pool::types::{
    ConnectionData, ConnectionPoolOptions, ConnectionPoolState,
    ConnectionPoolStats, ProtectedData, RedialTicket, StopSignal,
};
use crate::error::Error;

// Time in milliseconds `get` waits for an idle connection before dialing
const DEFAULT_ACQUIRE_WAIT: u64 = 1000;
// Health sweep interval in seconds
const DEFAULT_KEEPALIVE_INTERVAL: u64 = 30;
// Recovery loop interval in seconds
const DEFAULT_DIAL_RETRY_INTERVAL: u64 = 30;
// Number of dial attempts made by `get`
const DEFAULT_DIAL_RETRY_COUNT: u32 = 3;

// The validated, immutable settings of a pool
#[derive(Clone, Copy, Debug)]
struct PoolSettings {
    max_pool_size: u32,
    acquire_wait: Duration,
    keepalive_interval: Duration,
    dial_retry_interval: Duration,
    dial_retry_count: u32,
    max_redial_attempts: Option<u32>,
}

// State shared between the pool handle, the connections it hands out and the
// two background loops.
struct PoolInner<C> {
    name: String,
    functions: ConnectionFunctions<C>,
    settings: PoolSettings,
    protected_data: ProtectedData<C>,
    log: Logger,
}

/// A bounded pool of connections to a single service.
///
/// Two background threads run for the lifetime of the pool. The health sweep
/// probes idle connections with the keepalive function every
/// `keepalive_interval` and routes the ones that fail to the recovery
/// loop. The recovery loop redials them every `dial_retry_interval` and
/// returns the new connections to the idle set.
///
/// The pool may be shared between threads by reference or through an `Arc`.
/// Dropping the pool releases it.
pub struct ConnectionPool<C>
where
    C: Send + 'static,
{
    inner: Arc<PoolInner<C>>,
    stop: Arc<StopSignal>,
    loop_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    log: Logger,
}

impl<C> Debug for ConnectionPool<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .field("stats", &self.get_stats())
            .field("state", &self.get_state())
            .finish()
    }
}

impl<C> ConnectionPool<C>
where
    C: Send + 'static,
{
    pub fn new(cpo: ConnectionPoolOptions<C>) -> Result<Self, Error> {
        let functions = match (cpo.dial, cpo.close, cpo.keepalive) {
            (Some(dial), Some(close), Some(keepalive)) => ConnectionFunctions {
                dial,
                close,
                keepalive,
            },
            _ => {
                return Err(Error::Configuration(String::from(
                    "dial, close and keepalive functions must all be \
                     specified",
                )))
            }
        };

        if cpo.max_pool_size < 1 {
            return Err(Error::Configuration(String::from(
                "pool size less than 1",
            )));
        }

        let dial_retry_count =
            cpo.dial_retry_count.unwrap_or(DEFAULT_DIAL_RETRY_COUNT);
        if dial_retry_count < 1 {
            return Err(Error::Configuration(String::from(
                "dial retry count less than 1",
            )));
        }

        let settings = PoolSettings {
            max_pool_size: cpo.max_pool_size,
            acquire_wait: cpo
                .acquire_wait
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_ACQUIRE_WAIT)),
            keepalive_interval: cpo.keepalive_interval.unwrap_or_else(|| {
                Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL)
            }),
            dial_retry_interval: cpo.dial_retry_interval.unwrap_or_else(
                || Duration::from_secs(DEFAULT_DIAL_RETRY_INTERVAL),
            ),
            dial_retry_count,
            max_redial_attempts: cpo.max_redial_attempts,
        };

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => cpo.name.clone()));

        let initial_pool_size = cpo.initial_pool_size.min(cpo.max_pool_size);
        if initial_pool_size < cpo.initial_pool_size {
            debug!(
                logger,
                "initial pool size {} clamped to maximum {}",
                cpo.initial_pool_size,
                cpo.max_pool_size
            );
        }

        let mut connection_data =
            ConnectionData::new(settings.max_pool_size as usize);

        // Warm-up is best effort. A connection that fails to dial here is
        // simply not created.
        for _ in 0..initial_pool_size {
            match (functions.dial)(&cpo.name) {
                Ok(conn) => {
                    if connection_data.idle.push(conn).is_err() {
                        warn!(logger, "idle queue full during warm-up");
                    }
                }
                Err(e) => {
                    warn!(logger, "Skipping warm-up connection: {}", e);
                }
            }
        }

        let inner = Arc::new(PoolInner {
            name: cpo.name,
            functions,
            settings,
            protected_data: ProtectedData::new(connection_data),
            log: logger.clone(),
        });

        let stop = Arc::new(StopSignal::new());

        let keepalive_inner = Arc::clone(&inner);
        let keepalive_stop = Arc::clone(&stop);
        let keepalive_thread = thread::spawn(move || {
            keepalive_loop(keepalive_inner, keepalive_stop)
        });

        let recovery_inner = Arc::clone(&inner);
        let recovery_stop = Arc::clone(&stop);
        let recovery_thread = thread::spawn(move || {
            recovery_loop(recovery_inner, recovery_stop)
        });

        info!(
            logger,
            "connection pool created";
            "max_pool_size" => settings.max_pool_size,
            "initial_pool_size" => initial_pool_size
        );

        Ok(ConnectionPool {
            inner,
            stop,
            loop_threads: Mutex::new(vec![keepalive_thread, recovery_thread]),
            log: logger,
        })
    }

    /// Acquire a connection from the pool.
    ///
    /// An idle connection is returned as soon as one is available. If none
    /// arrives within the acquire wait window a new connection is dialed,
    /// provided the pool has room for it. The connection must be handed back
    /// with [`put`](#method.put).
    pub fn get(&self) -> Result<C, Error> {
        self.inner.get()
    }

    /// Take an idle connection if one is available right now. This never
    /// waits and never dials.
    pub fn try_get(&self) -> Option<C> {
        let mut connection_data =
            self.inner.protected_data.connection_data_lock();
        if connection_data.is_stopped() {
            return None;
        }
        let conn = connection_data.take_idle()?;
        connection_data.in_use += 1.into();
        trace!(self.log, "try_get took an idle connection");
        Some(conn)
    }

    /// Acquire a connection like [`get`](#method.get), wrapped so that it is
    /// returned to the pool when it falls out of scope.
    pub fn claim(&self) -> Result<PoolConnection<C>, Error> {
        let conn = self.inner.get()?;
        Ok(PoolConnection {
            pool: Arc::clone(&self.inner),
            connection: Some(conn),
        })
    }

    /// Return a connection obtained from [`get`](#method.get).
    ///
    /// Passing `None` ends a checkout without returning a connection, for
    /// example when the caller discarded a broken one. This never fails;
    /// errors from the close function are logged.
    pub fn put(&self, connection: Option<C>) {
        self.inner.put(connection)
    }

    /// Stop the pool. New requests fail with `Error::PoolStopped`, the two
    /// background threads are joined and every idle connection is closed.
    ///
    /// This function is idempotent. It blocks until the idle connections are
    /// closed. Connections checked out at the time of the call are closed
    /// when they are returned.
    pub fn release(&self) {
        // Held for the whole call so a concurrent release waits for the
        // drain to finish.
        let mut loop_threads = self
            .loop_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        {
            let mut connection_data =
                self.inner.protected_data.connection_data_lock();
            if connection_data.is_stopped() {
                trace!(self.log, "release called on a stopped pool");
                return;
            }
            connection_data.state = ConnectionPoolState::Stopping;
            // Wake every caller waiting in `get` so it observes the state
            self.inner.protected_data.condvar_notify_all();
        }

        self.stop.raise();
        for handle in loop_threads.drain(..) {
            if handle.join().is_err() {
                error!(self.log, "background loop panicked");
            }
        }
        trace!(self.log, "release: joined background loops");

        let (connections, placeholders) = {
            let mut connection_data =
                self.inner.protected_data.connection_data_lock();
            let mut connections = connection_data.idle.drain();
            connections.extend(connection_data.pending.drain());
            let placeholders = connection_data.awaiting_redial.drain().len();
            (connections, placeholders)
        };

        info!(
            self.log,
            "closing {} idle connections, discarding {} redial placeholders",
            connections.len(),
            placeholders
        );

        for conn in connections {
            self.inner.close_connection(conn);
        }

        self.inner.protected_data.connection_data_lock().state =
            ConnectionPoolState::Stopped;
        info!(self.log, "connection pool stopped");
    }

    /// The current connection counts, or `None` once the pool is stopped.
    pub fn get_stats(&self) -> Option<ConnectionPoolStats> {
        let connection_data = self.inner.protected_data.connection_data_lock();
        match connection_data.state {
            ConnectionPoolState::Running => Some(connection_data.stats()),
            _ => None,
        }
    }

    pub fn get_state(&self) -> String {
        self.inner
            .protected_data
            .connection_data_lock()
            .state
            .to_string()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_pool_size(&self) -> u32 {
        self.inner.settings.max_pool_size
    }
}

impl<C> Drop for ConnectionPool<C>
where
    C: Send + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<C> PoolInner<C>
where
    C: Send + 'static,
{
    fn get(&self) -> Result<C, Error> {
        // A wait too long to represent as an `Instant` never expires
        let deadline = Instant::now().checked_add(self.settings.acquire_wait);
        let mut connection_data = self.protected_data.connection_data_lock();

        loop {
            if connection_data.is_stopped() {
                return Err(Error::PoolStopped);
            }

            if let Some(conn) = connection_data.take_idle() {
                connection_data.in_use += 1.into();
                trace!(self.log, "Get connection from idle pool");
                return Ok(conn);
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    deadline - now
                }
                None => self.settings.acquire_wait,
            };
            let (guard, _timed_out) = self
                .protected_data
                .condvar_wait(connection_data, timeout);
            connection_data = guard;
        }

        let stats = connection_data.stats();
        if stats.total_connections() >= self.settings.max_pool_size.into() {
            if stats.in_flight_connections > 0.into() {
                debug!(
                    self.log,
                    "no capacity to dial, {} connections in flight",
                    stats.in_flight_connections
                );
                return Err(Error::AcquireTimeout);
            }
            return Err(Error::PoolExhausted {
                in_use: stats.in_use_connections,
                idle: stats.idle_connections + stats.pending_connections,
                retry: stats.awaiting_redial,
            });
        }

        // Reserve the slot so the capacity stays accounted for while the
        // lock is released around the dial.
        connection_data.in_flight += 1.into();
        drop(connection_data);

        trace!(self.log, "Get new connection from new create");
        let result = self.dial_with_retries();

        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.in_flight.decrement();
        match result {
            Ok(conn) => {
                connection_data.in_use += 1.into();
                Ok(conn)
            }
            Err(e) => {
                if !connection_data.is_stopped()
                    && connection_data
                        .awaiting_redial
                        .push(RedialTicket::default())
                        .is_err()
                {
                    warn!(self.log, "redial queue full, dropping placeholder");
                }
                Err(Error::DialFailed {
                    attempts: self.settings.dial_retry_count,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn put(&self, connection: Option<C>) {
        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.in_use.decrement();

        let conn = match connection {
            Some(conn) => conn,
            None => {
                trace!(self.log, "checkout released without a connection");
                return;
            }
        };

        if connection_data.is_stopped() {
            drop(connection_data);
            self.close_connection(conn);
            return;
        }

        let has_room = connection_data.stats().total_connections()
            < self.settings.max_pool_size.into();
        let rejected = if has_room {
            connection_data.idle.push(conn).err()
        } else {
            Some(conn)
        };

        match rejected {
            None => {
                self.protected_data.condvar_notify();
                trace!(self.log, "connection returned to idle pool");
            }
            Some(conn) => {
                drop(connection_data);
                warn!(self.log, "Pool is full, closing returned connection");
                self.close_connection(conn);
            }
        }
    }

    fn dial_with_retries(&self) -> Result<C, ConnectionError> {
        let mut last_error = None;
        for attempt in 1..=self.settings.dial_retry_count {
            match (self.functions.dial)(&self.name) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(self.log, "Dial attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| "no dial attempted".into()))
    }

    fn close_connection(&self, conn: C) {
        if let Err(err) = (self.functions.close)(&self.name, conn) {
            warn!(self.log, "Failed to properly close connection: {}", err);
        }
    }
}

/// A connection checked out of the pool with
/// [`claim`](struct.ConnectionPool.html#method.claim).
///
/// When dropped, the connection is returned to the pool.
pub struct PoolConnection<C>
where
    C: Send + 'static,
{
    pool: Arc<PoolInner<C>>,
    connection: Option<C>,
}

impl<C> PoolConnection<C>
where
    C: Send + 'static,
{
    /// Take the connection out of the pool's care. The checkout ends and the
    /// pool no longer counts the connection, which the caller now owns.
    pub fn detach(mut self) -> C {
        self.connection
            .take()
            .expect("pool connection is present until dropped")
    }
}

impl<C> Debug for PoolConnection<C>
where
    C: Debug + Send + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PoolConnection")
            .field("pool", &self.pool.name)
            .field("connection", &self.connection)
            .finish()
    }
}

impl<C> Drop for PoolConnection<C>
where
    C: Send + 'static,
{
    fn drop(&mut self) {
        self.pool.put(self.connection.take())
    }
}

impl<C> Deref for PoolConnection<C>
where
    C: Send + 'static,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.connection
            .as_ref()
            .expect("pool connection is present until dropped")
    }
}

impl<C> DerefMut for PoolConnection<C>
where
    C: Send + 'static,
{
    fn deref_mut(&mut self) -> &mut C {
        self.connection
            .as_mut()
            .expect("pool connection is present until dropped")
    }
}

fn keepalive_loop<C>(inner: Arc<PoolInner<C>>, stop: Arc<StopSignal>)
where
    C: Send + 'static,
{
    debug!(
        inner.log,
        "keepalive loop start, interval {:?}", inner.settings.keepalive_interval
    );
    let mut sweep_cycle: u64 = 0;
    while !stop.wait_timeout(inner.settings.keepalive_interval) {
        sweep_cycle += 1;
        sweep_connections(&inner, &stop, sweep_cycle);
    }
    debug!(inner.log, "keepalive loop end");
}

// Probe the connections that were idle when the sweep started. Connections
// that pass are parked in the pending queue so a connection returned during
// the sweep is not probed twice, then merged back once the sweep is done.
fn sweep_connections<C>(inner: &PoolInner<C>, stop: &StopSignal, cycle: u64)
where
    C: Send + 'static,
{
    let snapshot = inner.protected_data.connection_data_lock().idle.len();
    debug!(
        inner.log,
        "Performing keepalive check on {} connections", snapshot;
        "cycle" => cycle
    );

    let mut failed = 0;
    for _ in 0..snapshot {
        if stop.is_raised() {
            break;
        }

        let mut conn = {
            let mut connection_data =
                inner.protected_data.connection_data_lock();
            if connection_data.is_stopped() {
                break;
            }
            match connection_data.idle.pop() {
                Some(conn) => {
                    connection_data.in_flight += 1.into();
                    conn
                }
                // Claimed by `get` since the snapshot was taken
                None => break,
            }
        };

        let probe = (inner.functions.keepalive)(&inner.name, &mut conn);

        let mut connection_data = inner.protected_data.connection_data_lock();
        connection_data.in_flight.decrement();

        if connection_data.is_stopped() {
            drop(connection_data);
            inner.close_connection(conn);
            break;
        }

        match probe {
            Ok(()) => match connection_data.pending.push(conn) {
                Ok(()) => inner.protected_data.condvar_notify(),
                Err(conn) => {
                    drop(connection_data);
                    inner.close_connection(conn);
                }
            },
            Err(e) => {
                failed += 1;
                if connection_data
                    .awaiting_redial
                    .push(RedialTicket::default())
                    .is_err()
                {
                    warn!(inner.log, "redial queue full, dropping placeholder");
                }
                drop(connection_data);
                warn!(
                    inner.log,
                    "Keepalive probe failed: {}", e; "cycle" => cycle
                );
                inner.close_connection(conn);
            }
        }
    }

    let mut surplus = Vec::new();
    {
        let mut connection_data = inner.protected_data.connection_data_lock();
        while let Some(conn) = connection_data.pending.pop() {
            if let Err(conn) = connection_data.idle.push(conn) {
                surplus.push(conn);
            }
        }
    }
    for conn in surplus {
        inner.close_connection(conn);
    }

    debug!(
        inner.log,
        "keepalive check complete, {} connections routed to recovery", failed;
        "cycle" => cycle
    );
}

fn recovery_loop<C>(inner: Arc<PoolInner<C>>, stop: Arc<StopSignal>)
where
    C: Send + 'static,
{
    debug!(
        inner.log,
        "recovery loop start, interval {:?}", inner.settings.dial_retry_interval
    );
    let mut retry_cycle: u64 = 0;
    while !stop.wait_timeout(inner.settings.dial_retry_interval) {
        retry_cycle += 1;
        redial_connections(&inner, &stop, retry_cycle);
    }
    debug!(inner.log, "recovery loop end");
}

// Make one dial attempt for every placeholder queued when the cycle started.
// Placeholders that fail again go to the back of the queue for the next
// cycle unless they have used up their redial attempts.
fn redial_connections<C>(inner: &PoolInner<C>, stop: &StopSignal, cycle: u64)
where
    C: Send + 'static,
{
    let snapshot = inner
        .protected_data
        .connection_data_lock()
        .awaiting_redial
        .len();
    if snapshot == 0 {
        return;
    }
    debug!(inner.log, "Redialing {} connections", snapshot; "cycle" => cycle);

    for _ in 0..snapshot {
        if stop.is_raised() {
            break;
        }

        let ticket = {
            let mut connection_data =
                inner.protected_data.connection_data_lock();
            if connection_data.is_stopped() {
                break;
            }
            match connection_data.awaiting_redial.pop() {
                Some(ticket) => {
                    connection_data.in_flight += 1.into();
                    ticket
                }
                None => break,
            }
        };

        let result = (inner.functions.dial)(&inner.name);

        let mut connection_data = inner.protected_data.connection_data_lock();
        connection_data.in_flight.decrement();

        match result {
            Ok(conn) => {
                let rejected = if connection_data.is_stopped() {
                    Some(conn)
                } else {
                    connection_data.idle.push(conn).err()
                };
                match rejected {
                    None => {
                        inner.protected_data.condvar_notify();
                        info!(
                            inner.log,
                            "Retry pool success"; "cycle" => cycle
                        );
                    }
                    Some(conn) => {
                        drop(connection_data);
                        inner.close_connection(conn);
                    }
                }
            }
            Err(e) => {
                let ticket = ticket.failed();
                let evict = inner
                    .settings
                    .max_redial_attempts
                    .map_or(false, |max| ticket.failed_attempts >= max);
                if evict {
                    drop(connection_data);
                    error!(
                        inner.log,
                        "Giving up on connection after {} redial attempts: {}",
                        ticket.failed_attempts,
                        e;
                        "cycle" => cycle
                    );
                } else {
                    if connection_data.awaiting_redial.push(ticket).is_err() {
                        warn!(
                            inner.log,
                            "redial queue full, dropping placeholder"
                        );
                    }
                    drop(connection_data);
                    warn!(
                        inner.log,
                        "Retry pool failed: {}", e; "cycle" => cycle
                    );
                }
            }
        }
    }
}
