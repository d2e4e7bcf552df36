//! The host connection pool event loop.
//!
//! [`HostConnectionPool`] multiplexes a stream of requests onto a bounded set
//! of persistent connections to one host. It owns every piece of mutable
//! state (slots, connections, timers, the admission queue, the output
//! sequencer) and serializes all of it onto a single cooperative loop:
//! [`poll`](HostConnectionPool::poll) drains the mailbox, fires due timers,
//! polls connect attempts and connections, routes the resulting events
//! through the slot state machines, and executes the actions they emit, until
//! nothing moves.
//!
//! # Connect probing under failure
//!
//! Per-slot backoff counters produce each slot's `base, 2·base, 4·base, …`
//! delay sequence. While the host is refusing connections the pool
//! additionally holds a connect embargo: each failure pushes the embargo
//! deadline out by that failure's backoff delay, no new connects start before
//! the deadline, and once it lapses a single probe goes out at a time until a
//! connect succeeds. Without this, several slots backing off in lockstep
//! would hammer a recovering host with bursts at every shared deadline.

use crate::body::RequestBody;
use crate::config::{ConfigError, PoolConfig};
use crate::conn::{ConnectAttempt, ConnectProgress, Connection, ConnectionFactory};
use crate::dispatch::{Dispatcher, ResponseHandle};
use crate::error::{ConnectionPoolError, OfferError};
use crate::http::Request;
use crate::mailbox::{ExternalEvent, Mailbox};
use crate::slot::{Action, Slot, SlotEvent, SlotTunables};
use crate::timer::{TimerKind, TimerService};
use crate::types::{SlotId, Time};

/// Lifetime counters exposed for observability and tests.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    /// Connect attempts started (including retries and warm-up).
    pub connect_attempts: u64,
    /// Connect attempts that produced a connection.
    pub connections_established: u64,
    /// Connections torn down (gracefully or not).
    pub connections_closed: u64,
    /// Requests written to a connection.
    pub requests_dispatched: u64,
    /// Transparent retries performed.
    pub retries: u64,
    /// Terminal outcomes handed to the sequencer.
    pub responses_delivered: u64,
    /// Entity subscription windows that expired.
    pub subscription_timeouts: u64,
}

/// A pool of `max_connections` slots multiplexing requests to one host.
pub struct HostConnectionPool<F: ConnectionFactory> {
    config: PoolConfig,
    factory: F,
    slots: Vec<Slot>,
    attempts: Vec<Option<F::Attempt>>,
    conns: Vec<Option<F::Conn>>,
    timers: TimerService,
    mailbox: Mailbox,
    dispatcher: Dispatcher,
    stats: PoolStats,
    connect_embargo_until: Option<Time>,
    shutting_down: bool,
}

impl<F: ConnectionFactory> HostConnectionPool<F> {
    /// Creates a pool over the given factory.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self, ConfigError> {
        config.validate()?;
        let mailbox = Mailbox::new();
        let tunables = SlotTunables {
            base_backoff: config.base_connection_backoff,
            max_backoff: config.max_connection_backoff,
            keep_alive: config.keep_alive_timeout,
            subscription_timeout: config.response_entity_subscription_timeout,
        };
        let slots = (0..config.max_connections)
            .map(|i| Slot::new(SlotId::new(i), tunables.clone(), mailbox.sender()))
            .collect();
        let dispatcher = Dispatcher::new(config.max_queue_size, config.unclaimed_response_bound());
        let attempts = (0..config.max_connections).map(|_| None).collect();
        let conns = (0..config.max_connections).map(|_| None).collect();
        Ok(Self {
            config,
            factory,
            slots,
            attempts,
            conns,
            timers: TimerService::new(),
            mailbox,
            dispatcher,
            stats: PoolStats::default(),
            connect_embargo_until: None,
            shutting_down: false,
        })
    }

    /// Submits a request. The returned handle completes exactly once, in
    /// admission order relative to all other requests.
    ///
    /// `retries` overrides the configured default retry budget.
    pub fn offer(
        &mut self,
        request: Request,
        body: RequestBody,
        retries: Option<u32>,
        now: Time,
    ) -> Result<ResponseHandle, OfferError> {
        if self.shutting_down {
            return Err(OfferError::ShuttingDown(request, body));
        }
        // Settle pending work first so a freed slot can absorb the queue
        // before the capacity check.
        self.poll(now);
        if self.dispatcher.queue_full() {
            tracing::debug!(target = %request.target, "admission queue full, applying backpressure");
            return Err(OfferError::QueueFull(request, body));
        }
        let budget = retries.unwrap_or(self.config.max_retries);
        let (ctx, handle) = self.dispatcher.admit(request, body, budget);
        tracing::debug!(seq = %handle.seq(), retries = budget, "request admitted");
        self.dispatcher.enqueue(ctx);
        self.poll(now);
        Ok(handle)
    }

    /// Runs the loop until no event, timer, or dispatch makes progress.
    pub fn poll(&mut self, now: Time) {
        loop {
            let mut progressed = false;
            progressed |= self.drain_mailbox(now);
            progressed |= self.fire_timers(now);
            progressed |= self.poll_attempts(now);
            progressed |= self.poll_connections(now);
            progressed |= self.pump(now);
            if !progressed {
                break;
            }
        }
    }

    /// Aborts all connections, fails every in-flight and queued request with
    /// [`ConnectionPoolError::PoolShutdown`], and declines further input.
    pub fn shutdown(&mut self, now: Time) {
        if self.shutting_down {
            return;
        }
        tracing::debug!("pool shutting down");
        self.shutting_down = true;
        for idx in 0..self.slots.len() {
            self.attempts[idx] = None;
            self.route(idx, SlotEvent::Shutdown, now);
        }
        self.dispatcher.fail_queued(&ConnectionPoolError::PoolShutdown);
        self.timers.clear();
    }

    /// Earliest pending timer deadline, for harnesses driving virtual time.
    pub fn next_deadline(&mut self) -> Option<Time> {
        self.timers.next_deadline()
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Number of currently open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.conns.iter().filter(|c| c.is_some()).count()
    }

    /// Number of connect attempts in flight.
    #[must_use]
    pub fn connecting(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_some()).count()
    }

    /// Requests waiting in the admission queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.dispatcher.queue_len()
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down
    }

    fn drain_mailbox(&mut self, now: Time) -> bool {
        let events = self.mailbox.drain();
        let progressed = !events.is_empty();
        for event in events {
            match event {
                ExternalEvent::EntitySubscribed { slot, generation } => {
                    if self.slots[slot.index()].entity_generation() == generation {
                        self.route(slot.index(), SlotEvent::EntitySubscribed, now);
                    }
                }
                ExternalEvent::EntityDrained { slot, generation } => {
                    if self.slots[slot.index()].entity_generation() == generation {
                        self.route(slot.index(), SlotEvent::EntityDrained, now);
                    }
                }
            }
        }
        progressed
    }

    fn fire_timers(&mut self, now: Time) -> bool {
        let fired = self.timers.pop_expired(now);
        let progressed = !fired.is_empty();
        for (slot, kind) in fired {
            if kind == TimerKind::SubscriptionTimeout {
                self.stats.subscription_timeouts += 1;
            }
            self.route(slot.index(), SlotEvent::Timer(kind), now);
        }
        progressed
    }

    fn poll_attempts(&mut self, now: Time) -> bool {
        let mut settled = Vec::new();
        for (idx, pending) in self.attempts.iter_mut().enumerate() {
            if let Some(attempt) = pending {
                match attempt.poll(now) {
                    ConnectProgress::Pending => {}
                    ConnectProgress::Ready(conn) => {
                        *pending = None;
                        settled.push((idx, Ok(conn)));
                    }
                    ConnectProgress::Failed(error) => {
                        *pending = None;
                        settled.push((idx, Err(error)));
                    }
                }
            }
        }
        let progressed = !settled.is_empty();
        for (idx, outcome) in settled {
            match outcome {
                Ok(conn) => {
                    self.stats.connections_established += 1;
                    self.connect_embargo_until = None;
                    self.conns[idx] = Some(conn);
                    self.route(idx, SlotEvent::ConnectSucceeded, now);
                }
                Err(error) => {
                    self.route(idx, SlotEvent::ConnectFailed(error), now);
                }
            }
        }
        progressed
    }

    fn poll_connections(&mut self, now: Time) -> bool {
        let mut batches = Vec::new();
        for (idx, conn) in self.conns.iter_mut().enumerate() {
            if let Some(conn) = conn {
                let mut events = Vec::new();
                conn.poll(now, &mut events);
                if !events.is_empty() {
                    batches.push((idx, events));
                }
            }
        }
        let progressed = !batches.is_empty();
        for (idx, events) in batches {
            for event in events {
                // Events buffered behind a teardown land in Unconnected and
                // are ignored by the machine.
                self.route(idx, SlotEvent::Wire(event), now);
            }
        }
        progressed
    }

    /// Feeds queued requests to slots and maintains the warm floor.
    fn pump(&mut self, now: Time) -> bool {
        if self.shutting_down {
            return false;
        }
        let mut progressed = false;

        while self.dispatcher.queue_len() > 0 && !self.dispatcher.output_gated() {
            if let Some(idx) = self.find_idle_slot() {
                let ctx = self.dispatcher.pop().expect("queue checked non-empty");
                let actions = self.slots[idx].offer(ctx);
                self.execute(idx, actions, now);
                progressed = true;
            } else if self.can_start_connect(now) {
                let Some(idx) = self.find_openable_slot() else {
                    break;
                };
                let ctx = self.dispatcher.pop().expect("queue checked non-empty");
                let actions = self.slots[idx].offer(ctx);
                self.execute(idx, actions, now);
                progressed = true;
            } else {
                break;
            }
        }

        while self.live_count() < self.config.min_connections && self.can_start_connect(now) {
            let Some(idx) = self.find_openable_slot() else {
                break;
            };
            tracing::debug!(slot = idx, "opening warm connection for min-connections floor");
            let actions = self.slots[idx].start_warm_connect();
            self.execute(idx, actions, now);
            progressed = true;
        }

        progressed
    }

    fn find_idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_idle)
    }

    fn find_openable_slot(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_unconnected)
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_live()).count()
    }

    /// While connects are failing, no attempt starts before the embargo
    /// deadline, and after it lapses only one probe runs at a time.
    fn can_start_connect(&self, now: Time) -> bool {
        match self.connect_embargo_until {
            None => true,
            Some(deadline) => now >= deadline && self.connecting() == 0,
        }
    }

    fn route(&mut self, idx: usize, event: SlotEvent, now: Time) {
        let actions = self.slots[idx].on_event(event);
        self.execute(idx, actions, now);
    }

    fn execute(&mut self, idx: usize, actions: Vec<Action>, now: Time) {
        let slot_id = SlotId::new(idx);
        for action in actions {
            match action {
                Action::StartConnect => {
                    self.stats.connect_attempts += 1;
                    self.attempts[idx] = Some(self.factory.connect(slot_id, now));
                }
                Action::DispatchAssigned => {
                    if let Some((request, body)) = self.slots[idx].dispatch_payload() {
                        if let Some(conn) = self.conns[idx].as_mut() {
                            self.stats.requests_dispatched += 1;
                            conn.dispatch(&request, body);
                        }
                    }
                }
                Action::Deliver(seq, result) => {
                    self.stats.responses_delivered += 1;
                    self.dispatcher.deliver(seq, result);
                }
                Action::Requeue => {
                    if let Some(ctx) = self.slots[idx].take_context() {
                        self.stats.retries += 1;
                        self.dispatcher.requeue_front(ctx);
                    }
                }
                Action::AbortConnection => {
                    self.attempts[idx] = None;
                    if let Some(mut conn) = self.conns[idx].take() {
                        conn.abort();
                        self.stats.connections_closed += 1;
                    }
                }
                Action::CloseConnection => {
                    if let Some(mut conn) = self.conns[idx].take() {
                        conn.close();
                        self.stats.connections_closed += 1;
                    }
                }
                Action::DropConnection => {
                    if self.conns[idx].take().is_some() {
                        self.stats.connections_closed += 1;
                    }
                }
                Action::ArmTimer(kind, delay) => {
                    if kind == TimerKind::Backoff {
                        let until = now + delay;
                        self.connect_embargo_until = Some(
                            self.connect_embargo_until
                                .map_or(until, |existing| existing.max(until)),
                        );
                    }
                    self.timers.arm(slot_id, kind, now + delay);
                }
                Action::CancelTimer(kind) => {
                    self.timers.cancel(slot_id, kind);
                }
                Action::BecameIdle => {
                    // The pump at the end of the loop iteration picks this up.
                }
            }
        }
    }
}
