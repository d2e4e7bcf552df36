//! Error surface of the pool.
//!
//! Every request accepted by the pool is answered exactly once, either with a
//! response or with one of these errors. Entity streams fail with the same
//! type, so consumers handle a single error enum end to end.

use std::fmt;

/// Terminal outcome classes for a pooled request or its entity stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPoolError {
    /// The caller's request body stream errored before the upload finished.
    ///
    /// The connection is torn down; the error is surfaced as the response for
    /// that request (unless the response was already delivered).
    RequestEntityFailed(String),
    /// The connection factory rejected the connect attempt.
    ConnectFailed(String),
    /// An established connection terminated abnormally.
    ConnectionFailed(String),
    /// The response entity was not subscribed within the configured window.
    ///
    /// Carries the full diagnostic message, including the request and
    /// response summaries.
    EntitySubscriptionTimeout(String),
    /// The pool was shut down while the request was in flight.
    PoolShutdown,
}

impl ConnectionPoolError {
    /// True for failure classes that permit a transparent retry when the
    /// request was never observed on the wire.
    ///
    /// Only connect failures and connection failures qualify; a failed
    /// request body or a subscription timeout is never retried.
    #[must_use]
    pub fn retryable_class(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::ConnectionFailed(_))
    }
}

impl fmt::Display for ConnectionPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestEntityFailed(e) => write!(f, "request entity failed: {e}"),
            Self::ConnectFailed(e) => write!(f, "connection attempt failed: {e}"),
            Self::ConnectionFailed(e) => write!(f, "connection failed: {e}"),
            Self::EntitySubscriptionTimeout(msg) => f.write_str(msg),
            Self::PoolShutdown => write!(f, "pool shut down"),
        }
    }
}

impl std::error::Error for ConnectionPoolError {}

/// Why [`offer`](crate::pool::HostConnectionPool::offer) declined a request.
///
/// The request head and body are handed back so the caller can retry later;
/// a full queue is backpressure, not loss.
#[derive(Debug)]
pub enum OfferError {
    /// The admission queue is at capacity.
    QueueFull(crate::http::Request, crate::body::RequestBody),
    /// The pool is shutting down and no longer accepts requests.
    ShuttingDown(crate::http::Request, crate::body::RequestBody),
}

impl fmt::Display for OfferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull(req, _) => {
                write!(f, "admission queue full, rejecting {} {}", req.method, req.target)
            }
            Self::ShuttingDown(req, _) => {
                write!(f, "pool shutting down, rejecting {} {}", req.method, req.target)
            }
        }
    }
}

impl std::error::Error for OfferError {}
