//! Response entity streams and the gate that releases slots.
//!
//! Every non-HEAD response hands the consumer a [`ResponseEntity`]. The slot
//! that produced the response is not reusable until the entity is fully
//! drained: either the consumer subscribes and reads to end-of-stream, or it
//! calls [`ResponseEntity::discard_bytes`]. The pool-side [`EntityGate`]
//! observes both ends and signals the owning slot exactly once.
//!
//! HEAD responses are born drained: the framing may declare a positive
//! `Content-Length`, but the server sends no body, so the slot is released
//! immediately and a consumer that still reads the (empty) body just sees
//! end-of-stream.

use crate::error::ConnectionPoolError;
use crate::mailbox::{ExternalEvent, MailboxSender};
use crate::types::SlotId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Progress of an entity read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPoll {
    /// No data available yet.
    Pending,
    /// A body chunk.
    Chunk(Vec<u8>),
    /// End of stream; the entity is drained.
    End,
    /// The entity stream failed.
    Failed(ConnectionPoolError),
}

#[derive(Debug)]
struct EntityState {
    chunks: VecDeque<Vec<u8>>,
    finished: Option<Result<(), ConnectionPoolError>>,
    subscribed: bool,
    discard: bool,
    gate_fired: bool,
    slot: SlotId,
    generation: u64,
    events: Option<MailboxSender>,
}

impl EntityState {
    /// Posts `EntityDrained` the first time the drain condition holds.
    fn fire_gate_if_drained(&mut self) {
        if self.gate_fired {
            return;
        }
        let wire_done = matches!(self.finished, Some(Ok(())));
        let consumed = self.discard || (self.subscribed && self.chunks.is_empty());
        if wire_done && consumed {
            self.gate_fired = true;
            if let Some(events) = &self.events {
                events.post(ExternalEvent::EntityDrained {
                    slot: self.slot,
                    generation: self.generation,
                });
            }
        }
    }
}

/// Creates a connected gate/entity pair for one response.
pub(crate) fn channel(
    slot: SlotId,
    generation: u64,
    events: MailboxSender,
) -> (EntityGate, ResponseEntity) {
    let shared = Arc::new(Mutex::new(EntityState {
        chunks: VecDeque::new(),
        finished: None,
        subscribed: false,
        discard: false,
        gate_fired: false,
        slot,
        generation,
        events: Some(events),
    }));
    (
        EntityGate {
            shared: Arc::clone(&shared),
        },
        ResponseEntity { shared },
    )
}

/// Creates an already-drained entity (HEAD responses, bodyless statuses).
pub(crate) fn pre_drained(slot: SlotId) -> ResponseEntity {
    ResponseEntity {
        shared: Arc::new(Mutex::new(EntityState {
            chunks: VecDeque::new(),
            finished: Some(Ok(())),
            subscribed: false,
            discard: false,
            gate_fired: true,
            slot,
            generation: 0,
            events: None,
        })),
    }
}

/// Pool-side handle feeding one response entity.
#[derive(Debug)]
pub(crate) struct EntityGate {
    shared: Arc<Mutex<EntityState>>,
}

impl EntityGate {
    /// Appends a wire chunk. Discarded entities drop the bytes.
    pub(crate) fn push_chunk(&self, chunk: Vec<u8>) {
        let mut state = self.shared.lock();
        if state.finished.is_some() {
            return;
        }
        if !state.discard {
            state.chunks.push_back(chunk);
        }
    }

    /// Marks wire end-of-stream and fires the gate if already consumed.
    pub(crate) fn finish(&self) {
        let mut state = self.shared.lock();
        if state.finished.is_none() {
            state.finished = Some(Ok(()));
            state.fire_gate_if_drained();
        }
    }

    /// Fails the entity stream. The gate never fires for a failed entity;
    /// the slot tears the connection down through its own path.
    pub(crate) fn fail(&self, error: ConnectionPoolError) {
        let mut state = self.shared.lock();
        if state.finished.is_none() {
            state.finished = Some(Err(error));
        }
    }

    /// True once the wire side has terminated (either way).
    pub(crate) fn is_finished(&self) -> bool {
        self.shared.lock().finished.is_some()
    }
}

/// Consumer handle for a response entity.
#[derive(Debug, Clone)]
pub struct ResponseEntity {
    shared: Arc<Mutex<EntityState>>,
}

impl ResponseEntity {
    /// Subscribes to the entity and returns a reader.
    ///
    /// Subscribing (or [`discard_bytes`](Self::discard_bytes)) must happen
    /// within the pool's subscription window, or the entity fails and the
    /// connection is aborted.
    #[must_use]
    pub fn subscribe(&self) -> EntityReader {
        let mut state = self.shared.lock();
        if !state.subscribed {
            state.subscribed = true;
            if let Some(events) = &state.events {
                events.post(ExternalEvent::EntitySubscribed {
                    slot: state.slot,
                    generation: state.generation,
                });
            }
            state.fire_gate_if_drained();
        }
        drop(state);
        EntityReader {
            shared: Arc::clone(&self.shared),
            collected: Vec::new(),
        }
    }

    /// Abandons the entity: counts as subscription plus drain.
    ///
    /// Buffered and future bytes are dropped; the slot is released as soon
    /// as the wire side completes.
    pub fn discard_bytes(&self) {
        let mut state = self.shared.lock();
        state.discard = true;
        state.chunks.clear();
        if !state.subscribed {
            state.subscribed = true;
            if let Some(events) = &state.events {
                events.post(ExternalEvent::EntitySubscribed {
                    slot: state.slot,
                    generation: state.generation,
                });
            }
        }
        state.fire_gate_if_drained();
    }
}

/// Reading half of a subscribed entity.
#[derive(Debug)]
pub struct EntityReader {
    shared: Arc<Mutex<EntityState>>,
    collected: Vec<u8>,
}

impl EntityReader {
    /// Pulls the next chunk, end-of-stream, or failure.
    pub fn poll_chunk(&mut self) -> EntityPoll {
        let mut state = self.shared.lock();
        if let Some(chunk) = state.chunks.pop_front() {
            return EntityPoll::Chunk(chunk);
        }
        match &state.finished {
            Some(Ok(())) => {
                state.fire_gate_if_drained();
                EntityPoll::End
            }
            Some(Err(e)) => EntityPoll::Failed(e.clone()),
            None => EntityPoll::Pending,
        }
    }

    /// Accumulates the stream into one buffer, returning it at end-of-stream.
    ///
    /// Returns `None` while data is still pending; chunks read so far are
    /// retained across calls.
    pub fn try_collect(&mut self) -> Option<Result<Vec<u8>, ConnectionPoolError>> {
        loop {
            match self.poll_chunk() {
                EntityPoll::Chunk(chunk) => self.collected.extend_from_slice(&chunk),
                EntityPoll::End => return Some(Ok(std::mem::take(&mut self.collected))),
                EntityPoll::Failed(e) => return Some(Err(e)),
                EntityPoll::Pending => return None,
            }
        }
    }
}
