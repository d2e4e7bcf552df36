//! Outgoing request bodies.
//!
//! A request body is either strict bytes, known in full at offer time, or a
//! lazy stream fed by the caller while the request is in flight. Streams are
//! finite, non-restartable, and may fail; the connection pulls chunks with
//! [`RequestBody::poll_chunk`] as transport capacity allows.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// The body attached to an outgoing request.
#[derive(Debug)]
pub enum RequestBody {
    /// Complete body bytes (possibly empty).
    Strict(Vec<u8>),
    /// A lazy stream fed by a [`BodyWriter`].
    Streamed(BodyStream),
}

impl RequestBody {
    /// An empty strict body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Strict(Vec::new())
    }

    /// A strict body from bytes.
    #[must_use]
    pub fn strict(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Strict(bytes.into())
    }

    /// Creates a streamed body plus the writer that feeds it.
    #[must_use]
    pub fn streamed() -> (Self, BodyWriter) {
        let shared = Arc::new(Mutex::new(BodyState::default()));
        (
            Self::Streamed(BodyStream {
                shared: Arc::clone(&shared),
            }),
            BodyWriter { shared },
        )
    }

    /// True if the body is strict (restartable for retry purposes).
    #[must_use]
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict(_))
    }

    /// Declared length for `Content-Length` framing, when knowable.
    #[must_use]
    pub fn known_length(&self) -> Option<u64> {
        match self {
            Self::Strict(bytes) => Some(bytes.len() as u64),
            Self::Streamed(_) => None,
        }
    }

    /// One-line description used in timeout diagnostics.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Strict(bytes) if bytes.is_empty() => "Empty".to_owned(),
            Self::Strict(bytes) => format!("Strict({} bytes)", bytes.len()),
            Self::Streamed(_) => "Streamed".to_owned(),
        }
    }

    /// Pulls the next piece of a streamed body.
    ///
    /// Strict bodies never reach this path; connections write them together
    /// with the request head.
    pub fn poll_chunk(&mut self) -> BodyPoll {
        match self {
            Self::Strict(_) => BodyPoll::End,
            Self::Streamed(stream) => stream.poll_chunk(),
        }
    }
}

/// Progress of a streamed body pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPoll {
    /// No chunk available yet; the producer has not finished.
    Pending,
    /// A body chunk.
    Chunk(Vec<u8>),
    /// The producer finished the body successfully.
    End,
    /// The producer failed the body.
    Failed(String),
}

#[derive(Debug, Default)]
struct BodyState {
    chunks: VecDeque<Vec<u8>>,
    finished: bool,
    error: Option<String>,
}

/// Pool-side pull handle of a streamed body.
#[derive(Debug)]
pub struct BodyStream {
    shared: Arc<Mutex<BodyState>>,
}

impl BodyStream {
    fn poll_chunk(&mut self) -> BodyPoll {
        let mut state = self.shared.lock();
        if let Some(chunk) = state.chunks.pop_front() {
            return BodyPoll::Chunk(chunk);
        }
        if let Some(error) = &state.error {
            return BodyPoll::Failed(error.clone());
        }
        if state.finished {
            return BodyPoll::End;
        }
        BodyPoll::Pending
    }
}

/// Producer handle of a streamed body.
///
/// Dropping the writer without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) fails the body: a vanished producer cannot complete
/// the upload.
#[derive(Debug)]
pub struct BodyWriter {
    shared: Arc<Mutex<BodyState>>,
}

impl BodyWriter {
    /// Appends a chunk to the body.
    pub fn push_chunk(&self, chunk: impl Into<Vec<u8>>) {
        let mut state = self.shared.lock();
        if state.finished || state.error.is_some() {
            return;
        }
        state.chunks.push_back(chunk.into());
    }

    /// Marks the body complete.
    pub fn finish(self) {
        self.shared.lock().finished = true;
    }

    /// Fails the body with the given cause.
    pub fn fail(self, cause: impl Into<String>) {
        let mut state = self.shared.lock();
        if !state.finished {
            state.error = Some(cause.into());
        }
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.finished && state.error.is_none() {
            state.error = Some("request body writer dropped".to_owned());
        }
    }
}
