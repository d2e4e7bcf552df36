//! Hostpool: a client-side HTTP/1.1 host connection pool.
//!
//! # Overview
//!
//! A [`HostConnectionPool`] multiplexes a stream of outgoing requests onto a
//! bounded set of persistent connections to a single host. Each connection is
//! owned by exactly one *slot*, a small state machine that guarantees
//! at-most-one in-flight request per connection and refuses to reuse a
//! connection until the previous response entity has been drained. Responses
//! are released to callers in admission order regardless of which slot served
//! them.
//!
//! # Core Guarantees
//!
//! - **Exactly-once completion**: every accepted request resolves its handle
//!   exactly once, with a response or an error
//! - **Admission-order output**: response handles release FIFO across slots
//! - **Entity-drain gating**: a slot dispatches the next request only after
//!   the prior entity reached end-of-stream (HEAD responses count as drained)
//! - **Connect backoff**: failed connects retry on an exponential
//!   `base, 2·base, 4·base, …` schedule, capped and reset on success
//! - **Deterministic time**: the pool reads only the [`types::Time`] injected
//!   into each call, so every interleaving is reproducible in tests
//!
//! # Module Structure
//!
//! - [`types`]: identifiers and the virtual clock
//! - [`http`]: request/response head types
//! - [`body`]: strict and streamed request bodies
//! - [`entity`]: response entity streams and the drain gate
//! - [`config`]: pool configuration
//! - [`error`]: the error surface
//! - [`conn`]: the connection/factory seam substrates implement
//! - [`backoff`]: per-slot exponential backoff
//! - [`timer`]: one-shot timer service
//! - [`mailbox`]: event inbox for out-of-loop completion signals
//! - [`dispatch`]: admission queue and ordered response release
//! - `slot` (internal): the per-slot state machine
//! - [`pool`]: the event loop
//! - [`engine`]: HTTP/1.1 client codec over a byte transport
//! - [`transport`]: in-memory pipe and TCP transports
//!
//! # Example
//!
//! ```no_run
//! use hostpool::body::RequestBody;
//! use hostpool::config::PoolConfig;
//! use hostpool::http::Request;
//! use hostpool::pool::HostConnectionPool;
//! use hostpool::transport::TcpConnector;
//! use hostpool::types::Time;
//!
//! let connector = TcpConnector::new("127.0.0.1:8080".parse().unwrap());
//! let mut pool = HostConnectionPool::new(PoolConfig::default(), connector).unwrap();
//! let handle = pool
//!     .offer(Request::get("/simple"), RequestBody::empty(), None, Time::ZERO)
//!     .unwrap();
//! pool.poll(Time::from_millis(10));
//! if let Some(outcome) = handle.try_take() {
//!     let response = outcome.unwrap();
//!     let mut reader = response.entity.subscribe();
//!     // read chunks, then the slot becomes reusable
//!     let _ = reader.try_collect();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod backoff;
pub mod body;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod error;
pub mod http;
pub mod mailbox;
pub mod pool;
mod slot;
pub mod timer;
pub mod transport;
pub mod types;

// Re-exports for convenient access to the primary surface.
pub use body::{BodyWriter, RequestBody};
pub use config::{ConfigError, PoolConfig};
pub use conn::{ConnectAttempt, ConnectError, ConnectProgress, Connection, ConnectionFactory, WireEvent};
pub use dispatch::{PoolResponse, PoolResult, ResponseHandle};
pub use entity::{EntityPoll, EntityReader, ResponseEntity};
pub use error::{ConnectionPoolError, OfferError};
pub use http::{Method, Request, ResponseHead, Version};
pub use pool::{HostConnectionPool, PoolStats};
pub use types::{SeqId, SlotId, Time};
