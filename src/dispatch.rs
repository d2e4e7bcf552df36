//! Admission, queueing, and ordered release of responses.
//!
//! The dispatcher assigns every accepted request a sequence number, holds the
//! bounded overflow queue, and owns the output sequencer: slots complete
//! requests in whatever order their connections allow, but fulfillment
//! handles are released strictly in admission order.

use crate::body::RequestBody;
use crate::entity::ResponseEntity;
use crate::error::ConnectionPoolError;
use crate::http::{Method, Request, ResponseHead};
use crate::types::SeqId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A successful pooled response: head plus entity stream.
#[derive(Debug)]
pub struct PoolResponse {
    /// Status line and headers.
    pub head: ResponseHead,
    /// The response entity. Read it or call
    /// [`discard_bytes`](ResponseEntity::discard_bytes) promptly; the owning
    /// slot stays busy until the entity is drained.
    pub entity: ResponseEntity,
}

/// Terminal outcome for one pooled request.
pub type PoolResult = Result<PoolResponse, ConnectionPoolError>;

/// Caller-side fulfillment handle, completed exactly once.
#[derive(Debug)]
pub struct ResponseHandle {
    seq: SeqId,
    cell: Arc<Mutex<Option<PoolResult>>>,
    unclaimed: Arc<AtomicUsize>,
}

impl ResponseHandle {
    /// Admission sequence number of the underlying request.
    #[must_use]
    pub fn seq(&self) -> SeqId {
        self.seq
    }

    /// True once the outcome is available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.cell.lock().is_some()
    }

    /// Takes the outcome if it has been released.
    ///
    /// Outcomes release in admission order: this returns `None` until every
    /// earlier request has completed, even if this one finished first.
    pub fn try_take(&self) -> Option<PoolResult> {
        let taken = self.cell.lock().take();
        if taken.is_some() {
            self.unclaimed.fetch_sub(1, Ordering::Relaxed);
        }
        taken
    }
}

/// Pool-side writing end of a fulfillment handle.
#[derive(Debug)]
pub(crate) struct ResponseCell {
    cell: Arc<Mutex<Option<PoolResult>>>,
}

impl ResponseCell {
    fn fulfill(&self, result: PoolResult) {
        let mut cell = self.cell.lock();
        debug_assert!(cell.is_none(), "fulfillment handle completed twice");
        *cell = Some(result);
    }
}

/// One accepted request travelling through the pool.
#[derive(Debug)]
pub(crate) struct RequestContext {
    pub(crate) seq: SeqId,
    pub(crate) request: Request,
    /// Body retained until dispatch. Strict bodies stay here (cloned onto the
    /// wire) so a never-sent request can be retried; streamed bodies move
    /// into the connection and cannot.
    pub(crate) body: Option<RequestBody>,
    pub(crate) retries_left: u32,
    pub(crate) body_summary: String,
    /// Some request body byte reached the wire.
    pub(crate) body_sent: bool,
    /// The upload finished (trivially true for strict bodies at dispatch).
    pub(crate) body_done: bool,
}

impl RequestContext {
    pub(crate) fn is_head(&self) -> bool {
        self.request.method == Method::Head
    }

    /// Retry check before the request ever touched a connection.
    pub(crate) fn retryable_before_dispatch(&self) -> bool {
        self.retries_left > 0
    }

    /// Retry check after dispatch: nothing may have been observed on the
    /// wire, and the body must still be replayable.
    pub(crate) fn retryable_after_dispatch(&self, response_bytes_seen: bool) -> bool {
        self.retries_left > 0
            && !response_bytes_seen
            && !self.body_sent
            && self.body.as_ref().is_some_and(RequestBody::is_strict)
    }
}

/// Admission queue plus output sequencer.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    queue: VecDeque<RequestContext>,
    max_queue: usize,
    next_seq: u64,
    next_release: u64,
    cells: HashMap<u64, ResponseCell>,
    completed: BTreeMap<u64, PoolResult>,
    unclaimed: Arc<AtomicUsize>,
    unclaimed_bound: usize,
}

impl Dispatcher {
    pub(crate) fn new(max_queue: usize, unclaimed_bound: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_queue,
            next_seq: 0,
            next_release: 0,
            cells: HashMap::new(),
            completed: BTreeMap::new(),
            unclaimed: Arc::new(AtomicUsize::new(0)),
            unclaimed_bound,
        }
    }

    /// Registers a request, assigning its sequence number and handle.
    pub(crate) fn admit(
        &mut self,
        request: Request,
        body: RequestBody,
        retries: u32,
    ) -> (RequestContext, ResponseHandle) {
        let seq = SeqId(self.next_seq);
        self.next_seq += 1;

        let cell = Arc::new(Mutex::new(None));
        self.cells.insert(
            seq.0,
            ResponseCell {
                cell: Arc::clone(&cell),
            },
        );

        let body_summary = body.summary();
        let ctx = RequestContext {
            seq,
            request,
            body: Some(body),
            retries_left: retries,
            body_summary,
            body_sent: false,
            body_done: false,
        };
        let handle = ResponseHandle {
            seq,
            cell,
            unclaimed: Arc::clone(&self.unclaimed),
        };
        (ctx, handle)
    }

    /// True if the overflow queue cannot take another request.
    pub(crate) fn queue_full(&self) -> bool {
        self.queue.len() >= self.max_queue
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Appends a request to the overflow queue.
    pub(crate) fn enqueue(&mut self, ctx: RequestContext) {
        debug_assert!(self.queue.len() < self.max_queue);
        self.queue.push_back(ctx);
    }

    /// Puts a retried request at the head of the queue.
    pub(crate) fn requeue_front(&mut self, ctx: RequestContext) {
        self.queue.push_front(ctx);
    }

    /// Pops the next queued request.
    pub(crate) fn pop(&mut self) -> Option<RequestContext> {
        self.queue.pop_front()
    }

    /// Records a terminal outcome and releases handles in admission order.
    pub(crate) fn deliver(&mut self, seq: SeqId, result: PoolResult) {
        debug_assert!(
            !self.completed.contains_key(&seq.0) && seq.0 >= self.next_release,
            "second outcome for {seq}"
        );
        self.completed.insert(seq.0, result);
        while let Some(result) = self.completed.remove(&self.next_release) {
            if let Some(cell) = self.cells.remove(&self.next_release) {
                cell.fulfill(result);
                self.unclaimed.fetch_add(1, Ordering::Relaxed);
            }
            self.next_release += 1;
        }
    }

    /// Fails every queued request with the given error (pool shutdown).
    pub(crate) fn fail_queued(&mut self, error: &ConnectionPoolError) {
        while let Some(ctx) = self.queue.pop_front() {
            self.deliver(ctx.seq, Err(error.clone()));
        }
    }

    /// True when enough fulfilled responses sit unclaimed that dispatching
    /// more work would only grow the buffer.
    pub(crate) fn output_gated(&self) -> bool {
        self.unclaimed.load(Ordering::Relaxed) >= self.unclaimed_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity;
    use crate::types::SlotId;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(4, 8)
    }

    fn ok_response() -> PoolResult {
        Ok(PoolResponse {
            head: ResponseHead::new(200),
            entity: entity::pre_drained(SlotId::new(0)),
        })
    }

    #[test]
    fn sequencer_releases_in_admission_order() {
        let mut d = dispatcher();
        let (ctx1, h1) = d.admit(Request::get("/1"), RequestBody::empty(), 0);
        let (ctx2, h2) = d.admit(Request::get("/2"), RequestBody::empty(), 0);

        // Request 2 finishes first; its handle must stay empty.
        d.deliver(ctx2.seq, ok_response());
        assert!(!h2.is_ready());
        assert!(h1.try_take().is_none());

        d.deliver(ctx1.seq, ok_response());
        assert!(h1.try_take().is_some());
        assert!(h2.try_take().is_some());
    }

    #[test]
    fn queue_bounds_are_enforced() {
        let mut d = dispatcher();
        for i in 0..4 {
            let (ctx, _h) = d.admit(Request::get(format!("/{i}")), RequestBody::empty(), 0);
            assert!(!d.queue_full());
            d.enqueue(ctx);
        }
        assert!(d.queue_full());
        assert_eq!(d.queue_len(), 4);
    }

    #[test]
    fn requeue_front_preserves_retry_priority() {
        let mut d = dispatcher();
        let (first, _h1) = d.admit(Request::get("/first"), RequestBody::empty(), 1);
        let (second, _h2) = d.admit(Request::get("/second"), RequestBody::empty(), 0);
        d.enqueue(second);
        d.requeue_front(first);

        assert_eq!(d.pop().unwrap().request.target, "/first");
        assert_eq!(d.pop().unwrap().request.target, "/second");
    }

    #[test]
    fn unclaimed_responses_gate_output() {
        let mut d = Dispatcher::new(4, 1);
        let (ctx, handle) = d.admit(Request::get("/"), RequestBody::empty(), 0);
        assert!(!d.output_gated());

        d.deliver(ctx.seq, ok_response());
        assert!(d.output_gated());

        handle.try_take().unwrap().unwrap();
        assert!(!d.output_gated());
    }

    #[test]
    fn fail_queued_answers_every_waiter() {
        let mut d = dispatcher();
        let (ctx1, h1) = d.admit(Request::get("/1"), RequestBody::empty(), 0);
        let (ctx2, h2) = d.admit(Request::get("/2"), RequestBody::empty(), 0);
        d.enqueue(ctx1);
        d.enqueue(ctx2);

        d.fail_queued(&ConnectionPoolError::PoolShutdown);
        assert!(matches!(
            h1.try_take(),
            Some(Err(ConnectionPoolError::PoolShutdown))
        ));
        assert!(matches!(
            h2.try_take(),
            Some(Err(ConnectionPoolError::PoolShutdown))
        ));
    }

    #[test]
    fn retry_safety_checks() {
        let mut d = dispatcher();
        let (mut ctx, _h) = d.admit(Request::get("/"), RequestBody::strict(b"abc".to_vec()), 2);
        assert!(ctx.retryable_before_dispatch());
        assert!(ctx.retryable_after_dispatch(false));
        assert!(!ctx.retryable_after_dispatch(true));

        ctx.body_sent = true;
        assert!(!ctx.retryable_after_dispatch(false));

        let (mut streamed, _h) = {
            let (body, _writer) = RequestBody::streamed();
            d.admit(Request::post("/upload"), body, 2)
        };
        // Streamed bodies move into the connection at dispatch.
        streamed.body = None;
        assert!(!streamed.retryable_after_dispatch(false));
    }
}
