/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error;

/// The error type returned by the caller-supplied connection functions.
///
/// The pool never inspects these errors beyond logging them, so any error
/// type may be boxed into it. String literals convert with `into()`.
pub type ConnectionError = Box<dyn error::Error + Send + Sync>;

/// Establish a new connection to the backend service. The argument is the
/// name of the pool requesting the connection.
pub type DialFn<C> =
    Box<dyn Fn(&str) -> Result<C, ConnectionError> + Send + Sync>;

/// Close a connection the pool no longer tracks. The pool gives up ownership
/// of the connection when it calls this function.
pub type CloseFn<C> =
    Box<dyn Fn(&str, C) -> Result<(), ConnectionError> + Send + Sync>;

/// Probe an idle connection for liveness. An `Err` marks the connection as
/// dead and routes it to the recovery loop.
pub type KeepAliveFn<C> =
    Box<dyn Fn(&str, &mut C) -> Result<(), ConnectionError> + Send + Sync>;

// The three connection functions after validation.
pub(crate) struct ConnectionFunctions<C> {
    pub(crate) dial: DialFn<C>,
    pub(crate) close: CloseFn<C>,
    pub(crate) keepalive: KeepAliveFn<C>,
}
