//! Per-slot state machine.
//!
//! A slot is one lane of the pool: it owns at most one connection and serves
//! at most one request at a time. Everything that happens to a slot arrives
//! as a [`SlotEvent`]; the machine answers with [`Action`]s for the pool loop
//! to execute. Transitions are total: every (state, event) pair is either
//! handled below or deliberately ignored (stale wire events after teardown,
//! duplicate completion signals).
//!
//! ```text
//! Unconnected ──offer──► Connecting ──ok──► WaitingForResponse
//!      ▲                     │fail              │head
//!      │◄──backoff──── Failed◄┘                 ▼
//!      │                         WaitingForResponseEntitySubscription
//!      │                                        │subscribe
//!      │                                        ▼
//!      │◄──close/keep-alive── Idle ◄─drain─ WaitingForEndOfResponseEntity
//! ```
//!
//! An early response (server answers while the request body is still
//! uploading) parks the slot in `WaitingForEndOfRequestEntity` until both
//! sides finish.

use crate::backoff::Backoff;
use crate::body::RequestBody;
use crate::conn::{ConnectError, WireEvent};
use crate::dispatch::{PoolResponse, PoolResult, RequestContext};
use crate::entity::{self, EntityGate};
use crate::error::ConnectionPoolError;
use crate::http::ResponseHead;
use crate::mailbox::MailboxSender;
use crate::timer::TimerKind;
use crate::types::{format_duration, SeqId, SlotId};
use std::time::Duration;

/// The slot lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No connection, no request.
    Unconnected,
    /// Connect attempt in flight; a request may be pre-assigned.
    Connecting,
    /// Connection open, nothing in flight, prior entity drained.
    Idle,
    /// Request dispatched, awaiting the status line.
    WaitingForResponse,
    /// Response delivered, awaiting downstream entity subscription.
    WaitingForResponseEntitySubscription,
    /// Entity subscribed, streaming to the consumer.
    WaitingForEndOfResponseEntity,
    /// Response complete but the request body upload is still in progress.
    WaitingForEndOfRequestEntity,
    /// Connect failed; waiting out the backoff delay.
    Failed,
}

/// Stimuli routed to a slot by the pool loop.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    /// The pending connect attempt produced a connection.
    ConnectSucceeded,
    /// The pending connect attempt failed.
    ConnectFailed(ConnectError),
    /// An observation from the slot's connection.
    Wire(WireEvent),
    /// The consumer subscribed to the current response entity.
    EntitySubscribed,
    /// The current response entity was fully drained.
    EntityDrained,
    /// A timer armed by this slot fired.
    Timer(TimerKind),
    /// The pool is shutting down.
    Shutdown,
}

/// Instructions for the pool loop.
#[derive(Debug)]
pub(crate) enum Action {
    /// Ask the factory for a connection for this slot.
    StartConnect,
    /// Write the assigned request onto the slot's connection.
    DispatchAssigned,
    /// Hand a terminal outcome to the output sequencer.
    Deliver(SeqId, PoolResult),
    /// Take the assigned request back for a transparent retry.
    Requeue,
    /// Tear the connection down immediately.
    AbortConnection,
    /// Close the connection gracefully and drop it.
    CloseConnection,
    /// Drop a connection that is already dead.
    DropConnection,
    /// Arm a one-shot timer for this slot.
    ArmTimer(TimerKind, Duration),
    /// Cancel a timer for this slot.
    CancelTimer(TimerKind),
    /// The slot can take new work; the dispatcher should pump the queue.
    BecameIdle,
}

/// Timing knobs a slot needs from the pool configuration.
#[derive(Debug, Clone)]
pub(crate) struct SlotTunables {
    pub(crate) base_backoff: Duration,
    pub(crate) max_backoff: Duration,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) subscription_timeout: Option<Duration>,
}

/// One pool lane.
#[derive(Debug)]
pub(crate) struct Slot {
    id: SlotId,
    state: SlotState,
    backoff: Backoff,
    tunables: SlotTunables,
    events: MailboxSender,
    ctx: Option<RequestContext>,
    gate: Option<EntityGate>,
    entity_gen: u64,
    close_after_drain: bool,
    response_bytes_seen: bool,
    response_delivered: bool,
    entity_drained: bool,
    res_summary: Option<String>,
}

impl Slot {
    pub(crate) fn new(id: SlotId, tunables: SlotTunables, events: MailboxSender) -> Self {
        let backoff = Backoff::new(tunables.base_backoff, tunables.max_backoff);
        Self {
            id,
            state: SlotState::Unconnected,
            backoff,
            tunables,
            events,
            ctx: None,
            gate: None,
            entity_gen: 0,
            close_after_drain: false,
            response_bytes_seen: false,
            response_delivered: false,
            entity_drained: false,
            res_summary: None,
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    /// Generation of the current response entity, for filtering stale
    /// mailbox signals.
    pub(crate) fn entity_generation(&self) -> u64 {
        self.entity_gen
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub(crate) fn is_unconnected(&self) -> bool {
        self.state == SlotState::Unconnected
    }

    pub(crate) fn in_backoff(&self) -> bool {
        self.state == SlotState::Failed
    }

    /// True in every state that holds or is acquiring a connection.
    pub(crate) fn is_live(&self) -> bool {
        !matches!(self.state, SlotState::Unconnected | SlotState::Failed)
    }

    /// Accepts a request. Caller guarantees the slot is Idle or Unconnected.
    pub(crate) fn offer(&mut self, ctx: RequestContext) -> Vec<Action> {
        debug_assert!(self.ctx.is_none(), "{} offered while busy", self.id);
        let mut actions = Vec::new();
        tracing::debug!(slot = %self.id, seq = %ctx.seq, target = %ctx.request.target, "request assigned");
        self.ctx = Some(ctx);
        match self.state {
            SlotState::Idle => {
                actions.push(Action::CancelTimer(TimerKind::KeepAlive));
                self.begin_dispatch(&mut actions);
            }
            SlotState::Unconnected => {
                self.state = SlotState::Connecting;
                actions.push(Action::StartConnect);
            }
            _ => unreachable!("offer on busy slot"),
        }
        actions
    }

    /// Starts a warm connect to satisfy the min-connections floor.
    pub(crate) fn start_warm_connect(&mut self) -> Vec<Action> {
        debug_assert!(self.state == SlotState::Unconnected && self.ctx.is_none());
        self.state = SlotState::Connecting;
        vec![Action::StartConnect]
    }

    /// Removes the assigned request (after a `Requeue` action).
    pub(crate) fn take_context(&mut self) -> Option<RequestContext> {
        self.ctx.take()
    }

    /// What the connection needs to send the assigned request.
    ///
    /// Strict bodies are cloned so the context keeps a replayable copy;
    /// streamed bodies move out, making the request non-retryable.
    pub(crate) fn dispatch_payload(&mut self) -> Option<(crate::http::Request, RequestBody)> {
        let ctx = self.ctx.as_mut()?;
        let body = match &ctx.body {
            Some(RequestBody::Strict(bytes)) => RequestBody::Strict(bytes.clone()),
            Some(RequestBody::Streamed(_)) => ctx.body.take().unwrap_or_else(RequestBody::empty),
            None => RequestBody::empty(),
        };
        Some((ctx.request.clone(), body))
    }

    /// Routes one event through the state machine.
    pub(crate) fn on_event(&mut self, event: SlotEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            SlotEvent::ConnectSucceeded => self.on_connect_succeeded(&mut actions),
            SlotEvent::ConnectFailed(error) => self.on_connect_failed(&error, &mut actions),
            SlotEvent::Wire(wire) => self.on_wire(wire, &mut actions),
            SlotEvent::EntitySubscribed => self.on_entity_subscribed(&mut actions),
            SlotEvent::EntityDrained => self.on_entity_drained(&mut actions),
            SlotEvent::Timer(kind) => self.on_timer(kind, &mut actions),
            SlotEvent::Shutdown => self.on_shutdown(&mut actions),
        }
        actions
    }

    fn on_connect_succeeded(&mut self, actions: &mut Vec<Action>) {
        if self.state != SlotState::Connecting {
            return;
        }
        self.backoff.reset();
        if self.ctx.is_some() {
            self.begin_dispatch(actions);
        } else {
            tracing::debug!(slot = %self.id, "warm connection established");
            self.become_idle(actions);
        }
    }

    fn on_connect_failed(&mut self, error: &ConnectError, actions: &mut Vec<Action>) {
        if self.state != SlotState::Connecting {
            return;
        }
        if let Some(ctx) = &mut self.ctx {
            if ctx.retryable_before_dispatch() {
                ctx.retries_left -= 1;
                tracing::debug!(
                    slot = %self.id,
                    seq = %ctx.seq,
                    retries_left = ctx.retries_left,
                    %error,
                    "connect failed, requeueing request"
                );
                actions.push(Action::Requeue);
            } else {
                let seq = ctx.seq;
                tracing::debug!(slot = %self.id, seq = %seq, %error, "connect failed, no retry budget");
                self.ctx = None;
                actions.push(Action::Deliver(
                    seq,
                    Err(ConnectionPoolError::ConnectFailed(error.to_string())),
                ));
            }
        }
        let delay = self.backoff.next_delay();
        tracing::debug!(
            slot = %self.id,
            attempts = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "entering connect backoff"
        );
        self.state = SlotState::Failed;
        actions.push(Action::ArmTimer(TimerKind::Backoff, delay));
    }

    fn on_wire(&mut self, wire: WireEvent, actions: &mut Vec<Action>) {
        match wire {
            WireEvent::ResponseHead(head) => self.on_response_head(head, actions),
            WireEvent::ResponseChunk(chunk) => {
                self.response_bytes_seen = true;
                if let Some(gate) = &self.gate {
                    gate.push_chunk(chunk);
                }
            }
            WireEvent::ResponseEnd => {
                if let Some(gate) = &self.gate {
                    gate.finish();
                }
            }
            WireEvent::RequestBodyProgress => {
                if let Some(ctx) = &mut self.ctx {
                    ctx.body_sent = true;
                }
            }
            WireEvent::RequestBodyComplete => {
                if let Some(ctx) = &mut self.ctx {
                    ctx.body_done = true;
                }
                if self.state == SlotState::WaitingForEndOfRequestEntity && self.entity_drained {
                    self.finish_request(actions);
                }
            }
            WireEvent::RequestBodyFailed(cause) => self.on_request_body_failed(&cause, actions),
            WireEvent::Closed => self.on_connection_gone(None, actions),
            WireEvent::Failed(cause) => self.on_connection_gone(Some(cause), actions),
        }
    }

    fn on_response_head(&mut self, head: ResponseHead, actions: &mut Vec<Action>) {
        if self.state != SlotState::WaitingForResponse {
            // A head in any other state is a protocol violation by the peer.
            tracing::warn!(slot = %self.id, state = ?self.state, "unexpected response head, aborting");
            self.fail_entity_if_active(ConnectionPoolError::ConnectionFailed(
                "unexpected response".into(),
            ));
            self.abandon_request_silently();
            self.state = SlotState::Unconnected;
            actions.push(Action::AbortConnection);
            return;
        }

        self.response_bytes_seen = true;
        self.response_delivered = true;
        self.close_after_drain = head.connection_close();

        let Some(ctx) = &self.ctx else { return };
        let seq = ctx.seq;
        let bodyless = ctx.is_head() || head.status_forbids_body();
        self.res_summary = Some(format!(
            "{} {} {}",
            head.status,
            head.reason,
            if bodyless {
                "Empty".to_owned()
            } else {
                response_entity_summary(&head)
            }
        ));
        tracing::debug!(slot = %self.id, seq = %seq, status = head.status, "response head received");

        if bodyless {
            // HEAD and no-body statuses are born drained; a positive
            // Content-Length on a HEAD response describes the entity the
            // server did not send.
            self.entity_drained = true;
            self.gate = None;
            let entity = entity::pre_drained(self.id);
            actions.push(Action::Deliver(seq, Ok(PoolResponse { head, entity })));
            let body_done = self.ctx.as_ref().is_some_and(|c| c.body_done);
            if body_done {
                self.finish_request(actions);
            } else {
                self.state = SlotState::WaitingForEndOfRequestEntity;
            }
        } else {
            self.entity_drained = false;
            self.entity_gen += 1;
            let (gate, entity) = entity::channel(self.id, self.entity_gen, self.events.clone());
            self.gate = Some(gate);
            self.state = SlotState::WaitingForResponseEntitySubscription;
            actions.push(Action::Deliver(seq, Ok(PoolResponse { head, entity })));
            if let Some(window) = self.tunables.subscription_timeout {
                actions.push(Action::ArmTimer(TimerKind::SubscriptionTimeout, window));
            }
        }
    }

    fn on_request_body_failed(&mut self, cause: &str, actions: &mut Vec<Action>) {
        match self.state {
            SlotState::WaitingForResponse => {
                // No response yet: the failure *is* the response. Not logged
                // at error level; the caller already holds the failure.
                if let Some(ctx) = self.ctx.take() {
                    tracing::debug!(slot = %self.id, seq = %ctx.seq, cause, "request entity failed");
                    actions.push(Action::Deliver(
                        ctx.seq,
                        Err(ConnectionPoolError::RequestEntityFailed(cause.to_owned())),
                    ));
                }
                self.state = SlotState::Unconnected;
                actions.push(Action::AbortConnection);
            }
            SlotState::WaitingForResponseEntitySubscription
            | SlotState::WaitingForEndOfResponseEntity
            | SlotState::WaitingForEndOfRequestEntity => {
                // Response already surfaced: fail the connection without a
                // second report.
                tracing::debug!(slot = %self.id, cause, "request entity failed after response");
                self.fail_entity_if_active(ConnectionPoolError::RequestEntityFailed(
                    cause.to_owned(),
                ));
                actions.push(Action::CancelTimer(TimerKind::SubscriptionTimeout));
                self.abandon_request_silently();
                self.state = SlotState::Unconnected;
                actions.push(Action::AbortConnection);
            }
            _ => {}
        }
    }

    /// Peer close or abnormal connection failure.
    fn on_connection_gone(&mut self, cause: Option<String>, actions: &mut Vec<Action>) {
        match self.state {
            SlotState::Idle => {
                tracing::debug!(slot = %self.id, ?cause, "connection closed while idle");
                actions.push(Action::CancelTimer(TimerKind::KeepAlive));
                self.state = SlotState::Unconnected;
                actions.push(Action::DropConnection);
            }
            SlotState::WaitingForResponse => {
                let retryable = self
                    .ctx
                    .as_ref()
                    .is_some_and(|ctx| ctx.retryable_after_dispatch(self.response_bytes_seen));
                if retryable {
                    if let Some(ctx) = &mut self.ctx {
                        ctx.retries_left -= 1;
                        tracing::debug!(
                            slot = %self.id,
                            seq = %ctx.seq,
                            retries_left = ctx.retries_left,
                            "connection lost before response, retrying transparently"
                        );
                    }
                    actions.push(Action::Requeue);
                } else if let Some(ctx) = self.ctx.take() {
                    let message = cause
                        .clone()
                        .unwrap_or_else(|| "connection closed before response".to_owned());
                    tracing::debug!(slot = %self.id, seq = %ctx.seq, message, "connection lost, failing request");
                    actions.push(Action::Deliver(
                        ctx.seq,
                        Err(ConnectionPoolError::ConnectionFailed(message)),
                    ));
                }
                self.state = SlotState::Unconnected;
                actions.push(Action::DropConnection);
            }
            SlotState::WaitingForResponseEntitySubscription
            | SlotState::WaitingForEndOfResponseEntity => {
                // The response was already delivered: fail the entity stream
                // and report nothing further.
                let error = ConnectionPoolError::ConnectionFailed(
                    cause.unwrap_or_else(|| "connection closed during response entity".to_owned()),
                );
                if self.gate.as_ref().is_some_and(EntityGate::is_finished) {
                    // Entity already complete on the wire; the consumer can
                    // still drain the buffer. The connection is simply gone.
                    tracing::debug!(slot = %self.id, "connection closed after entity completed");
                } else {
                    tracing::warn!(slot = %self.id, %error, "connection lost mid-entity");
                    self.fail_entity_if_active(error);
                }
                actions.push(Action::CancelTimer(TimerKind::SubscriptionTimeout));
                self.abandon_request_silently();
                self.state = SlotState::Unconnected;
                actions.push(Action::DropConnection);
            }
            SlotState::WaitingForEndOfRequestEntity => {
                tracing::debug!(slot = %self.id, ?cause, "connection lost while uploading request body");
                self.abandon_request_silently();
                self.state = SlotState::Unconnected;
                actions.push(Action::DropConnection);
            }
            SlotState::Unconnected | SlotState::Connecting | SlotState::Failed => {}
        }
    }

    fn on_entity_subscribed(&mut self, actions: &mut Vec<Action>) {
        if self.state == SlotState::WaitingForResponseEntitySubscription {
            self.state = SlotState::WaitingForEndOfResponseEntity;
            actions.push(Action::CancelTimer(TimerKind::SubscriptionTimeout));
        }
        // Subscription signals in other states (already streaming via
        // discard, or after teardown) carry no information.
    }

    fn on_entity_drained(&mut self, actions: &mut Vec<Action>) {
        match self.state {
            SlotState::WaitingForEndOfResponseEntity
            | SlotState::WaitingForResponseEntitySubscription => {
                // Drain can land while still nominally in the subscription
                // state when subscribe and drain are processed in one batch.
                actions.push(Action::CancelTimer(TimerKind::SubscriptionTimeout));
                self.entity_drained = true;
                let body_done = self.ctx.as_ref().is_some_and(|c| c.body_done);
                if body_done {
                    self.finish_request(actions);
                } else {
                    self.state = SlotState::WaitingForEndOfRequestEntity;
                }
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, kind: TimerKind, actions: &mut Vec<Action>) {
        match (self.state, kind) {
            (SlotState::Failed, TimerKind::Backoff) => {
                tracing::debug!(slot = %self.id, "backoff expired");
                self.state = SlotState::Unconnected;
                actions.push(Action::BecameIdle);
            }
            (SlotState::Idle, TimerKind::KeepAlive) => {
                tracing::debug!(slot = %self.id, "keep-alive expired, closing connection");
                self.state = SlotState::Unconnected;
                actions.push(Action::CloseConnection);
            }
            (SlotState::WaitingForResponseEntitySubscription, TimerKind::SubscriptionTimeout) => {
                let message = self.subscription_timeout_message();
                tracing::warn!(slot = %self.id, message, "response entity subscription timed out");
                self.fail_entity_if_active(ConnectionPoolError::EntitySubscriptionTimeout(message));
                self.abandon_request_silently();
                self.state = SlotState::Unconnected;
                actions.push(Action::AbortConnection);
            }
            // Stale timers (state moved on before the cancel took effect).
            _ => {}
        }
    }

    fn on_shutdown(&mut self, actions: &mut Vec<Action>) {
        if let Some(ctx) = self.ctx.take() {
            if !self.response_delivered {
                actions.push(Action::Deliver(ctx.seq, Err(ConnectionPoolError::PoolShutdown)));
            }
        }
        self.fail_entity_if_active(ConnectionPoolError::PoolShutdown);
        match self.state {
            SlotState::Idle
            | SlotState::WaitingForResponse
            | SlotState::WaitingForResponseEntitySubscription
            | SlotState::WaitingForEndOfResponseEntity
            | SlotState::WaitingForEndOfRequestEntity => {
                actions.push(Action::AbortConnection);
            }
            SlotState::Unconnected | SlotState::Connecting | SlotState::Failed => {}
        }
        self.state = SlotState::Unconnected;
        self.gate = None;
        self.response_delivered = false;
    }

    /// Dispatches the assigned request on the open connection.
    fn begin_dispatch(&mut self, actions: &mut Vec<Action>) {
        self.response_bytes_seen = false;
        self.response_delivered = false;
        self.entity_drained = false;
        self.close_after_drain = false;
        self.res_summary = None;
        if let Some(ctx) = &mut self.ctx {
            match &ctx.body {
                Some(RequestBody::Strict(bytes)) => {
                    // Head and strict body go out together.
                    ctx.body_done = true;
                    ctx.body_sent = !bytes.is_empty();
                }
                Some(RequestBody::Streamed(_)) | None => {}
            }
            tracing::trace!(slot = %self.id, seq = %ctx.seq, "dispatching request");
        }
        self.state = SlotState::WaitingForResponse;
        actions.push(Action::DispatchAssigned);
    }

    fn become_idle(&mut self, actions: &mut Vec<Action>) {
        self.state = SlotState::Idle;
        actions.push(Action::BecameIdle);
        if let Some(keep_alive) = self.tunables.keep_alive {
            actions.push(Action::ArmTimer(TimerKind::KeepAlive, keep_alive));
        }
    }

    /// Both sides of the current exchange are complete; free the slot.
    fn finish_request(&mut self, actions: &mut Vec<Action>) {
        self.ctx = None;
        self.gate = None;
        self.res_summary = None;
        if self.close_after_drain {
            self.close_after_drain = false;
            tracing::debug!(slot = %self.id, "server requested close, recycling connection");
            self.state = SlotState::Unconnected;
            actions.push(Action::CloseConnection);
            actions.push(Action::BecameIdle);
        } else {
            self.become_idle(actions);
        }
    }

    fn fail_entity_if_active(&mut self, error: ConnectionPoolError) {
        if let Some(gate) = self.gate.take() {
            if !gate.is_finished() {
                gate.fail(error);
            }
        }
    }

    /// Drops the assigned request without a report (response already
    /// delivered, or nothing to report).
    fn abandon_request_silently(&mut self) {
        self.ctx = None;
        self.res_summary = None;
    }

    fn subscription_timeout_message(&self) -> String {
        let window = self
            .tunables
            .subscription_timeout
            .map_or_else(|| "∞".to_owned(), format_duration);
        let request = self.ctx.as_ref().map_or_else(
            || "<unknown request>".to_owned(),
            |ctx| {
                format!(
                    "{} {} {}",
                    ctx.request.method, ctx.request.target, ctx.body_summary
                )
            },
        );
        let response = self
            .res_summary
            .clone()
            .unwrap_or_else(|| "<unknown response>".to_owned());
        format!(
            "Response entity was not subscribed after {window}. Make sure to read the response \
             `entity` body or call `entity.discard_bytes()`. {request} -> {response}"
        )
    }
}

/// Entity summary for diagnostics, derived from response framing.
fn response_entity_summary(head: &ResponseHead) -> String {
    if head.is_chunked() {
        "Streamed".to_owned()
    } else if let Some(length) = head.content_length() {
        format!("Strict({length} bytes)")
    } else {
        "Streamed".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::http::Request;
    use crate::mailbox::Mailbox;

    fn tunables() -> SlotTunables {
        SlotTunables {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            keep_alive: Some(Duration::from_secs(30)),
            subscription_timeout: Some(Duration::from_secs(1)),
        }
    }

    fn slot(mailbox: &Mailbox) -> Slot {
        Slot::new(SlotId::new(0), tunables(), mailbox.sender())
    }

    fn ctx_for(target: &str, retries: u32) -> (Dispatcher, RequestContext) {
        let mut dispatcher = Dispatcher::new(8, 8);
        let (ctx, _handle) = dispatcher.admit(Request::get(target), RequestBody::empty(), retries);
        (dispatcher, ctx)
    }

    fn has_action(actions: &[Action], pred: impl Fn(&Action) -> bool) -> bool {
        actions.iter().any(pred)
    }

    #[test]
    fn offer_on_unconnected_starts_connect() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/a", 0);

        let actions = slot.offer(ctx);
        assert_eq!(slot.state(), SlotState::Connecting);
        assert!(has_action(&actions, |a| matches!(a, Action::StartConnect)));

        let actions = slot.on_event(SlotEvent::ConnectSucceeded);
        assert_eq!(slot.state(), SlotState::WaitingForResponse);
        assert!(has_action(&actions, |a| matches!(a, Action::DispatchAssigned)));
    }

    #[test]
    fn connect_failure_backs_off_and_requeues() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/a", 2);
        slot.offer(ctx);

        let actions = slot.on_event(SlotEvent::ConnectFailed(ConnectError::Refused("no".into())));
        assert_eq!(slot.state(), SlotState::Failed);
        assert!(slot.in_backoff());
        assert!(has_action(&actions, |a| matches!(a, Action::Requeue)));
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::ArmTimer(TimerKind::Backoff, d) if *d == Duration::from_millis(100)
        )));
        let ctx = slot.take_context().expect("context returned for requeue");
        assert_eq!(ctx.retries_left, 1);

        // Backoff expiry frees the slot again.
        let actions = slot.on_event(SlotEvent::Timer(TimerKind::Backoff));
        assert_eq!(slot.state(), SlotState::Unconnected);
        assert!(has_action(&actions, |a| matches!(a, Action::BecameIdle)));
    }

    #[test]
    fn connect_failure_without_budget_fails_the_request() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/a", 0);
        slot.offer(ctx);

        let actions = slot.on_event(SlotEvent::ConnectFailed(ConnectError::TimedOut));
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::Deliver(_, Err(ConnectionPoolError::ConnectFailed(_)))
        )));
        assert!(!has_action(&actions, |a| matches!(a, Action::Requeue)));
    }

    #[test]
    fn backoff_delay_doubles_per_consecutive_failure() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);

        let mut delays = Vec::new();
        for _ in 0..4 {
            slot.start_warm_connect();
            let actions = slot.on_event(SlotEvent::ConnectFailed(ConnectError::TimedOut));
            for action in &actions {
                if let Action::ArmTimer(TimerKind::Backoff, delay) = action {
                    delays.push(delay.as_millis() as u64);
                }
            }
            slot.on_event(SlotEvent::Timer(TimerKind::Backoff));
        }
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn response_lifecycle_reaches_idle() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (mut dispatcher, ctx) = ctx_for("/data", 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let head = ResponseHead::new(200).with_header("Content-Length", "4");
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        assert_eq!(slot.state(), SlotState::WaitingForResponseEntitySubscription);
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::ArmTimer(TimerKind::SubscriptionTimeout, _)
        )));

        // Route the delivery so the consumer can subscribe.
        let mut reader = None;
        for action in actions {
            if let Action::Deliver(seq, result) = action {
                let response = result.expect("successful response");
                reader = Some(response.entity.subscribe());
                dispatcher.deliver(seq, Ok(PoolResponse {
                    head: ResponseHead::new(200),
                    entity: response.entity,
                }));
            }
        }
        let mut reader = reader.expect("response delivered");

        let actions = slot.on_event(SlotEvent::EntitySubscribed);
        assert_eq!(slot.state(), SlotState::WaitingForEndOfResponseEntity);
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::CancelTimer(TimerKind::SubscriptionTimeout)
        )));

        slot.on_event(SlotEvent::Wire(WireEvent::ResponseChunk(b"body".to_vec())));
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseEnd));
        assert_eq!(reader.try_collect(), Some(Ok(b"body".to_vec())));

        let actions = slot.on_event(SlotEvent::EntityDrained);
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(has_action(&actions, |a| matches!(a, Action::BecameIdle)));
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::ArmTimer(TimerKind::KeepAlive, _)
        )));
    }

    #[test]
    fn head_response_is_drained_immediately() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let mut dispatcher = Dispatcher::new(8, 8);
        let (ctx, _handle) = dispatcher.admit(Request::head("/obj"), RequestBody::empty(), 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        // The framing declares a length the server will not send.
        let head = ResponseHead::new(200).with_header("Content-Length", "8192");
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(has_action(&actions, |a| matches!(a, Action::Deliver(_, Ok(_)))));
        assert!(!has_action(&actions, |a| matches!(
            a,
            Action::ArmTimer(TimerKind::SubscriptionTimeout, _)
        )));
    }

    #[test]
    fn connection_close_header_recycles_connection_after_drain() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/bye", 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let head = ResponseHead::new(200)
            .with_header("Content-Length", "2")
            .with_header("Connection", "close");
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        slot.on_event(SlotEvent::EntitySubscribed);
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseChunk(b"ok".to_vec())));
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseEnd));

        let actions = slot.on_event(SlotEvent::EntityDrained);
        assert_eq!(slot.state(), SlotState::Unconnected);
        assert!(has_action(&actions, |a| matches!(a, Action::CloseConnection)));
    }

    #[test]
    fn racy_close_before_response_retries_transparently() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/next", 3);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);
        assert_eq!(slot.state(), SlotState::WaitingForResponse);

        let actions = slot.on_event(SlotEvent::Wire(WireEvent::Closed));
        assert_eq!(slot.state(), SlotState::Unconnected);
        assert!(has_action(&actions, |a| matches!(a, Action::Requeue)));
        assert_eq!(slot.take_context().unwrap().retries_left, 2);
    }

    #[test]
    fn close_without_budget_surfaces_connection_failure() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/next", 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let actions = slot.on_event(SlotEvent::Wire(WireEvent::Closed));
        assert!(has_action(&actions, |a| matches!(
            a,
            Action::Deliver(_, Err(ConnectionPoolError::ConnectionFailed(_)))
        )));
    }

    #[test]
    fn entity_failure_mid_stream_is_not_double_reported() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/stream", 5);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let head = ResponseHead::new(200).with_header("Transfer-Encoding", "chunked");
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        let mut reader = None;
        for action in actions {
            if let Action::Deliver(_, Ok(response)) = action {
                reader = Some(response.entity.subscribe());
            }
        }
        let mut reader = reader.unwrap();
        slot.on_event(SlotEvent::EntitySubscribed);

        let actions = slot.on_event(SlotEvent::Wire(WireEvent::Failed("reset by peer".into())));
        // Response already delivered: no second Deliver, entity fails instead.
        assert!(!has_action(&actions, |a| matches!(a, Action::Deliver(..))));
        assert!(matches!(reader.poll_chunk(), crate::entity::EntityPoll::Failed(_)));
        assert_eq!(slot.state(), SlotState::Unconnected);
    }

    #[test]
    fn subscription_timeout_produces_diagnostic_and_aborts() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/slow", 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let head = ResponseHead::new(200).with_header("Transfer-Encoding", "chunked");
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        let mut entity = None;
        for action in actions {
            if let Action::Deliver(_, Ok(response)) = action {
                entity = Some(response.entity);
            }
        }

        let actions = slot.on_event(SlotEvent::Timer(TimerKind::SubscriptionTimeout));
        assert!(has_action(&actions, |a| matches!(a, Action::AbortConnection)));
        assert_eq!(slot.state(), SlotState::Unconnected);

        let mut reader = entity.unwrap().subscribe();
        match reader.poll_chunk() {
            crate::entity::EntityPoll::Failed(ConnectionPoolError::EntitySubscriptionTimeout(
                message,
            )) => {
                assert!(message.contains("Response entity was not subscribed after 1s"));
                assert!(message.contains("`entity.discard_bytes()`"));
                assert!(message.contains("GET /slow Empty"));
                assert!(message.contains("200 OK Streamed"));
            }
            other => panic!("expected subscription timeout failure, got {other:?}"),
        }
    }

    #[test]
    fn early_response_waits_for_request_body() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let mut dispatcher = Dispatcher::new(8, 8);
        let (body, writer) = RequestBody::streamed();
        let (ctx, _handle) = dispatcher.admit(Request::post("/upload"), body, 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        // Server responds before the upload finished.
        let head = ResponseHead::new(200).with_header("Content-Length", "2");
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(head)));
        let mut reader = None;
        for action in actions {
            if let Action::Deliver(_, Ok(response)) = action {
                reader = Some(response.entity.subscribe());
            }
        }
        let mut reader = reader.unwrap();
        slot.on_event(SlotEvent::EntitySubscribed);
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseChunk(b"ok".to_vec())));
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseEnd));
        assert_eq!(reader.try_collect(), Some(Ok(b"ok".to_vec())));

        // Entity drained, but the upload is still running.
        let actions = slot.on_event(SlotEvent::EntityDrained);
        assert_eq!(slot.state(), SlotState::WaitingForEndOfRequestEntity);
        assert!(!has_action(&actions, |a| matches!(a, Action::BecameIdle)));

        writer.finish();
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::RequestBodyComplete));
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(has_action(&actions, |a| matches!(a, Action::BecameIdle)));
    }

    #[test]
    fn request_body_failure_before_response_is_the_response() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let mut dispatcher = Dispatcher::new(8, 8);
        let (body, _writer) = RequestBody::streamed();
        let (ctx, _handle) = dispatcher.admit(Request::post("/upload"), body, 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let actions =
            slot.on_event(SlotEvent::Wire(WireEvent::RequestBodyFailed("boom".into())));
        let delivered: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Deliver(..)))
            .collect();
        assert_eq!(delivered.len(), 1, "exactly one response-error");
        assert!(matches!(
            delivered[0],
            Action::Deliver(_, Err(ConnectionPoolError::RequestEntityFailed(_)))
        ));
        assert!(has_action(&actions, |a| matches!(a, Action::AbortConnection)));
    }

    #[test]
    fn request_body_failure_after_response_is_silent() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let mut dispatcher = Dispatcher::new(8, 8);
        let (body, _writer) = RequestBody::streamed();
        let (ctx, _handle) = dispatcher.admit(Request::post("/upload"), body, 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);
        slot.on_event(SlotEvent::Wire(WireEvent::ResponseHead(ResponseHead::new(204))));
        assert_eq!(slot.state(), SlotState::WaitingForEndOfRequestEntity);

        let actions =
            slot.on_event(SlotEvent::Wire(WireEvent::RequestBodyFailed("boom".into())));
        assert!(!has_action(&actions, |a| matches!(a, Action::Deliver(..))));
        assert!(has_action(&actions, |a| matches!(a, Action::AbortConnection)));
        assert_eq!(slot.state(), SlotState::Unconnected);
    }

    #[test]
    fn keep_alive_expiry_closes_idle_connection() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        slot.start_warm_connect();
        slot.on_event(SlotEvent::ConnectSucceeded);
        assert_eq!(slot.state(), SlotState::Idle);

        let actions = slot.on_event(SlotEvent::Timer(TimerKind::KeepAlive));
        assert_eq!(slot.state(), SlotState::Unconnected);
        assert!(has_action(&actions, |a| matches!(a, Action::CloseConnection)));
    }

    #[test]
    fn shutdown_fails_in_flight_request_once() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/inflight", 3);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);

        let actions = slot.on_event(SlotEvent::Shutdown);
        let delivered: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Deliver(_, Err(ConnectionPoolError::PoolShutdown))))
            .collect();
        assert_eq!(delivered.len(), 1);
        assert!(has_action(&actions, |a| matches!(a, Action::AbortConnection)));
        assert_eq!(slot.state(), SlotState::Unconnected);

        // A second shutdown has nothing left to report.
        let actions = slot.on_event(SlotEvent::Shutdown);
        assert!(!has_action(&actions, |a| matches!(a, Action::Deliver(..))));
    }

    #[test]
    fn stale_wire_events_are_ignored_after_teardown() {
        let mailbox = Mailbox::new();
        let mut slot = slot(&mailbox);
        let (_d, ctx) = ctx_for("/x", 0);
        slot.offer(ctx);
        slot.on_event(SlotEvent::ConnectSucceeded);
        slot.on_event(SlotEvent::Wire(WireEvent::Failed("gone".into())));
        assert_eq!(slot.state(), SlotState::Unconnected);

        // Late chunks and closes from the dead connection change nothing.
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::ResponseChunk(b"x".to_vec())));
        assert!(actions.is_empty());
        let actions = slot.on_event(SlotEvent::Wire(WireEvent::Closed));
        assert!(actions.is_empty());
        assert_eq!(slot.state(), SlotState::Unconnected);
    }
}
