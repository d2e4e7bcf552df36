//! The seam between the pool and its transport substrates.
//!
//! The pool never touches sockets. It asks a [`ConnectionFactory`] for a
//! [`ConnectAttempt`], polls the attempt until it yields a [`Connection`] or
//! fails, then drives the connection with non-blocking polls. A connection
//! reports everything it observes as [`WireEvent`]s: response heads, entity
//! chunks, request body progress, closes, failures.
//!
//! Three substrates implement this seam: the scripted passthrough harness in
//! the test suite, the HTTP/1.1 engine over an in-memory byte pipe
//! ([`crate::engine`] + [`crate::transport`]), and the same engine over TCP.

use crate::body::RequestBody;
use crate::http::{Request, ResponseHead};
use crate::types::{SlotId, Time};
use thiserror::Error;

/// Failure to establish a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The host refused or rejected the attempt.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The attempt did not complete in time.
    #[error("connect timed out")]
    TimedOut,
    /// Transport-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a connection can tell its slot.
#[derive(Debug)]
pub enum WireEvent {
    /// The response status line and headers arrived.
    ResponseHead(ResponseHead),
    /// A piece of the response entity.
    ResponseChunk(Vec<u8>),
    /// The response entity reached end-of-stream on the wire.
    ResponseEnd,
    /// The first request body byte went out on the wire.
    ///
    /// After this, the request is no longer safe to retry.
    RequestBodyProgress,
    /// The request body upload finished.
    RequestBodyComplete,
    /// The caller's request body stream failed.
    RequestBodyFailed(String),
    /// The peer closed the connection in an orderly fashion.
    Closed,
    /// The connection terminated abnormally.
    Failed(String),
}

/// A live bidirectional HTTP message flow owned by exactly one slot.
pub trait Connection {
    /// Begins sending a request. At most one request is in flight per
    /// connection; the slot guarantees the previous response entity was
    /// drained before calling this again.
    fn dispatch(&mut self, request: &Request, body: RequestBody);

    /// Drives the connection and appends any observations to `out`.
    fn poll(&mut self, now: Time, out: &mut Vec<WireEvent>);

    /// Tears the connection down immediately.
    fn abort(&mut self);

    /// Closes our side gracefully (after `Connection: close` or keep-alive
    /// expiry).
    fn close(&mut self);
}

/// Progress of an in-flight connect attempt.
pub enum ConnectProgress<C> {
    /// Still connecting.
    Pending,
    /// The connection is established.
    Ready(C),
    /// The attempt failed.
    Failed(ConnectError),
}

/// An asynchronous connect attempt, polled by the pool loop.
pub trait ConnectAttempt {
    /// The connection type produced on success.
    type Conn: Connection;

    /// Checks the attempt. Once `Ready` or `Failed` is returned the attempt
    /// is spent and must not be polled again.
    fn poll(&mut self, now: Time) -> ConnectProgress<Self::Conn>;
}

/// Produces connections on demand, one attempt at a time per slot.
pub trait ConnectionFactory {
    /// The connection type this factory yields.
    type Conn: Connection;
    /// The attempt type tracking an in-flight connect.
    type Attempt: ConnectAttempt<Conn = Self::Conn>;

    /// Starts a connect attempt for the given slot.
    fn connect(&mut self, slot: SlotId, now: Time) -> Self::Attempt;
}
