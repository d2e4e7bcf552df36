#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```
//!
//! Provides test logging, the phase/assert macros, and the scripted
//! passthrough substrate: a [`ScriptedFactory`] whose connections carry no
//! bytes at all. The test observes dispatched requests and pushes wire
//! events by hand, so every pool interleaving can be staged deterministically.

use hostpool::body::{BodyPoll, RequestBody};
use hostpool::conn::{
    ConnectAttempt, ConnectError, ConnectProgress, Connection, ConnectionFactory, WireEvent,
};
use hostpool::http::{Request, ResponseHead};
use hostpool::types::{SlotId, Time};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with debug-level output.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!(
            $cond,
            "{}: expected {:?}, got {:?}",
            $msg, $expected, $actual
        );
    };
}

// =============================================================================
// Scripted passthrough substrate
// =============================================================================

#[derive(Debug, Default)]
struct ConnState {
    dispatched: VecDeque<Request>,
    pending_events: VecDeque<WireEvent>,
    upload: Option<RequestBody>,
    upload_started: bool,
    aborted: bool,
    closed: bool,
}

/// A connection that moves no bytes: the test scripts everything.
pub struct ScriptedConn {
    shared: Arc<Mutex<ConnState>>,
}

impl Connection for ScriptedConn {
    fn dispatch(&mut self, request: &Request, body: RequestBody) {
        let mut state = self.shared.lock();
        state.dispatched.push_back(request.clone());
        state.upload_started = false;
        match body {
            RequestBody::Strict(_) => state.upload = None,
            streamed @ RequestBody::Streamed(_) => state.upload = Some(streamed),
        }
    }

    fn poll(&mut self, _now: Time, out: &mut Vec<WireEvent>) {
        let mut state = self.shared.lock();
        // Pull the streamed request body the way a real transport would.
        loop {
            let Some(upload) = state.upload.as_mut() else {
                break;
            };
            match upload.poll_chunk() {
                BodyPoll::Pending => break,
                BodyPoll::Chunk(_) => {
                    if !state.upload_started {
                        state.upload_started = true;
                        out.push(WireEvent::RequestBodyProgress);
                    }
                }
                BodyPoll::End => {
                    state.upload = None;
                    out.push(WireEvent::RequestBodyComplete);
                    break;
                }
                BodyPoll::Failed(cause) => {
                    state.upload = None;
                    out.push(WireEvent::RequestBodyFailed(cause));
                    break;
                }
            }
        }
        out.extend(state.pending_events.drain(..));
    }

    fn abort(&mut self) {
        self.shared.lock().aborted = true;
    }

    fn close(&mut self) {
        self.shared.lock().closed = true;
    }
}

/// Test-side handle to one scripted connection.
#[derive(Clone)]
pub struct ConnHandle {
    shared: Arc<Mutex<ConnState>>,
}

impl ConnHandle {
    /// Pops the next request the pool dispatched on this connection.
    pub fn expect_request(&self) -> Request {
        self.shared
            .lock()
            .dispatched
            .pop_front()
            .expect("no request dispatched on this connection")
    }

    /// Like [`expect_request`](Self::expect_request) but non-panicking.
    pub fn try_request(&self) -> Option<Request> {
        self.shared.lock().dispatched.pop_front()
    }

    /// Number of dispatched-but-unconsumed requests.
    pub fn pending_requests(&self) -> usize {
        self.shared.lock().dispatched.len()
    }

    /// Queues a wire event for the pool's next poll.
    pub fn push_event(&self, event: WireEvent) {
        self.shared.lock().pending_events.push_back(event);
    }

    /// Queues a response head.
    pub fn push_head(&self, head: ResponseHead) {
        self.push_event(WireEvent::ResponseHead(head));
    }

    /// Queues an entity chunk.
    pub fn push_chunk(&self, chunk: &[u8]) {
        self.push_event(WireEvent::ResponseChunk(chunk.to_vec()));
    }

    /// Queues entity end-of-stream.
    pub fn push_end(&self) {
        self.push_event(WireEvent::ResponseEnd);
    }

    /// Queues an orderly peer close.
    pub fn push_close(&self) {
        self.push_event(WireEvent::Closed);
    }

    /// Queues an abnormal connection failure.
    pub fn push_fail(&self, cause: &str) {
        self.push_event(WireEvent::Failed(cause.to_owned()));
    }

    /// Queues a complete fixed-length response.
    pub fn respond(&self, status: u16, body: &[u8]) {
        self.push_head(
            ResponseHead::new(status).with_header("Content-Length", body.len().to_string()),
        );
        if !body.is_empty() {
            self.push_chunk(body);
        }
        self.push_end();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().aborted
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[derive(Default)]
struct FactoryState {
    connections: Vec<ConnHandle>,
    attempts: u64,
    fail_until: Option<Time>,
    fail_always: bool,
}

/// Factory for scripted connections; connect outcomes are staged by time.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    shared: Arc<Mutex<FactoryState>>,
}

impl ScriptedFactory {
    /// A factory whose connects always succeed immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that refuses every connect before `heal_at`.
    pub fn failing_until(heal_at: Time) -> Self {
        let factory = Self::default();
        factory.shared.lock().fail_until = Some(heal_at);
        factory
    }

    /// A factory that refuses every connect.
    pub fn always_failing() -> Self {
        let factory = Self::default();
        factory.shared.lock().fail_always = true;
        factory
    }

    /// How many times the pool invoked the factory.
    pub fn attempts(&self) -> u64 {
        self.shared.lock().attempts
    }

    /// Number of successfully established connections so far.
    pub fn established(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Handle to the `index`-th established connection.
    pub fn connection(&self, index: usize) -> ConnHandle {
        self.shared.lock().connections[index].clone()
    }
}

/// A scripted connect attempt; outcome decided when polled.
pub struct ScriptedAttempt {
    shared: Arc<Mutex<FactoryState>>,
    done: bool,
}

impl ConnectAttempt for ScriptedAttempt {
    type Conn = ScriptedConn;

    fn poll(&mut self, now: Time) -> ConnectProgress<ScriptedConn> {
        if self.done {
            return ConnectProgress::Failed(ConnectError::Refused("attempt exhausted".into()));
        }
        self.done = true;
        let mut state = self.shared.lock();
        let refused = state.fail_always || state.fail_until.is_some_and(|heal| now < heal);
        if refused {
            return ConnectProgress::Failed(ConnectError::Refused("scripted refusal".into()));
        }
        let conn_shared = Arc::new(Mutex::new(ConnState::default()));
        state.connections.push(ConnHandle {
            shared: Arc::clone(&conn_shared),
        });
        ConnectProgress::Ready(ScriptedConn {
            shared: conn_shared,
        })
    }
}

impl ConnectionFactory for ScriptedFactory {
    type Conn = ScriptedConn;
    type Attempt = ScriptedAttempt;

    fn connect(&mut self, _slot: SlotId, _now: Time) -> ScriptedAttempt {
        let mut state = self.shared.lock();
        state.attempts += 1;
        ScriptedAttempt {
            shared: Arc::clone(&self.shared),
            done: false,
        }
    }
}
