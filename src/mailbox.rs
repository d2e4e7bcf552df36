//! Event inbox for the pool loop.
//!
//! The loop is the single owner of all pool state; handles that live outside
//! it (entity readers, request body writers) never mutate slots directly.
//! Instead they post [`ExternalEvent`]s here, and the loop drains the mailbox
//! at the top of each iteration.

use crate::types::SlotId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Events posted from outside the pool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEvent {
    /// A consumer subscribed to (or discarded) the response entity of the
    /// given slot's current response.
    EntitySubscribed {
        /// Owning slot.
        slot: SlotId,
        /// Entity generation, to drop signals from torn-down responses.
        generation: u64,
    },
    /// The response entity of the given slot was fully drained.
    EntityDrained {
        /// Owning slot.
        slot: SlotId,
        /// Entity generation.
        generation: u64,
    },
}

/// The loop-owned inbox.
#[derive(Debug, Default)]
pub struct Mailbox {
    shared: Arc<Mutex<VecDeque<ExternalEvent>>>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a sender handle that can be cloned into external handles.
    #[must_use]
    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Takes all pending events, oldest first.
    pub fn drain(&self) -> Vec<ExternalEvent> {
        let mut inbox = self.shared.lock();
        inbox.drain(..).collect()
    }

    /// True if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }
}

/// Cloneable posting half of the mailbox.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    shared: Arc<Mutex<VecDeque<ExternalEvent>>>,
}

impl MailboxSender {
    /// Posts an event for the loop's next iteration.
    pub fn post(&self, event: ExternalEvent) {
        self.shared.lock().push_back(event);
    }
}
