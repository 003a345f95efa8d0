//! Send-side multiplexer for one transport.
//!
//! The multiplexer owns the [`PendingTable`] and the id counters for a
//! single connection. It never blocks and never spawns: every method runs
//! to completion on the caller's turn, and outcomes are delivered through
//! [`ResultHandle`]s. The peer event loop feeds it transport callbacks
//! ([`on_open`](Multiplexer::on_open), [`on_message`](Multiplexer::on_message),
//! [`on_close`](Multiplexer::on_close)) and housekeeping ticks.
//!
//! # Write rule
//!
//! A frame is written only while the transport is `Open` with nothing
//! buffered. Otherwise it is parked as `ToBeSent` and flushed, in insertion
//! order, by the next housekeeping pass that finds the transport writable.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{Seq, SeqAllocator};
use crate::options::PeerOptions;
use crate::protocol::{Call, HANDSHAKE, MessageKind, Reply, WireMessage, codec, now_ms};
use crate::transport::{ConnectionState, Transport};

use super::pending::{Completion, Deadline, OperationKind, OperationState, PendingOperation, PendingTable};

// ============================================================================
// ResultHandle
// ============================================================================

/// Asynchronous outcome of a submitted operation.
///
/// Resolves to [`Error::NotConnected`] if the multiplexer is dropped before
/// the operation completes.
#[derive(Debug)]
#[must_use = "the outcome is lost if the handle is dropped"]
pub struct ResultHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ResultHandle<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::NotConnected)))
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Inbound frame that needs handling above the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A remote request; answer it with [`Multiplexer::respond`].
    Request(Call),
    /// A remote event, ephemeral event or non-handshake system event.
    Event {
        /// Which event kind arrived.
        kind: MessageKind,
        /// The event body.
        call: Call,
    },
    /// The remote `__handshake__` system event.
    Handshake(Call),
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Correlates, queues and flushes traffic for one transport.
#[derive(Debug)]
pub struct Multiplexer<T: Transport> {
    transport: T,
    pending: PendingTable,
    ids: SeqAllocator,
    options: PeerOptions,
    open_waiters: Vec<oneshot::Sender<Result<()>>>,
    opened: bool,
    closed: bool,
}

impl<T: Transport> Multiplexer<T> {
    /// Creates a multiplexer over `transport`.
    #[must_use]
    pub fn new(transport: T, options: PeerOptions) -> Self {
        Self {
            transport,
            pending: PendingTable::new(),
            ids: SeqAllocator::new(),
            options,
            open_waiters: Vec::new(),
            opened: false,
            closed: false,
        }
    }

    /// Connection state. `Closed` once [`on_close`](Self::on_close) ran,
    /// whatever the transport reports.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else {
            self.transport.state()
        }
    }

    /// The underlying transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The pending table.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// The options in use.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    /// Returns `true` once closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn writable(&self) -> bool {
        self.state() == ConnectionState::Open && self.transport.buffered_amount() == 0
    }
}

// ============================================================================
// Outbound
// ============================================================================

impl<T: Transport> Multiplexer<T> {
    /// Sends a request with the default timeout.
    pub fn send_request(&mut self, name: impl Into<String>, payload: Value) -> ResultHandle<Value> {
        let timeout = self.options.request_timeout;
        self.send_request_with_timeout(name, payload, timeout)
    }

    /// Sends a request with an explicit timeout (`None` waits until close).
    pub fn send_request_with_timeout(
        &mut self,
        name: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> ResultHandle<Value> {
        let (tx, handle) = ResultHandle::channel();
        self.submit_request(name.into(), payload, timeout, tx);
        handle
    }

    /// Sends an `EVENT` stamped with `ts`.
    pub fn send_event(&mut self, name: impl Into<String>, ts: i64, payload: Value) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        self.submit_event(MessageKind::Event, name.into(), ts, payload, tx);
        handle
    }

    /// Sends an `EPH_EVENT` stamped now.
    pub fn send_ephemeral_event(&mut self, name: impl Into<String>, payload: Value) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        self.submit_event(MessageKind::EphemeralEvent, name.into(), now_ms(), payload, tx);
        handle
    }

    /// Sends a `SYS_EVENT` stamped now.
    pub fn send_system_event(&mut self, name: impl Into<String>, payload: Value) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        self.submit_event(MessageKind::SystemEvent, name.into(), now_ms(), payload, tx);
        handle
    }

    pub(crate) fn submit_request(
        &mut self,
        name: String,
        payload: Value,
        timeout: Option<Duration>,
        completion: oneshot::Sender<Result<Value>>,
    ) {
        if let Err(e) = self.admit() {
            let _ = completion.send(Err(e));
            return;
        }

        let seq = match self.ids.next_request() {
            Ok(seq) => seq,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        let frame = match encode_call(MessageKind::Request, &name, seq, now_ms(), payload) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        let op = PendingOperation::new(
            OperationKind::Request,
            seq,
            name,
            frame,
            Completion::Request(completion),
        )
        .with_deadline(timeout.and_then(Deadline::after));

        self.dispatch(op);
    }

    pub(crate) fn submit_event(
        &mut self,
        kind: MessageKind,
        name: String,
        ts: i64,
        payload: Value,
        completion: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = self.admit() {
            let _ = completion.send(Err(e));
            return;
        }

        let seq = match self.ids.next_event() {
            Ok(seq) => seq,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        let frame = match encode_call(kind, &name, seq, ts, payload) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        let op = PendingOperation::new(OperationKind::Event, seq, name, frame, Completion::Event(completion));
        self.dispatch(op);
    }

    /// Answers a remote request.
    ///
    /// Follows the same write rule as outbound calls. Replies still queued
    /// when the connection closes are dropped.
    pub fn respond(&mut self, reply: Reply) {
        if self.closed {
            debug!(seq = %reply.seq, name = %reply.name, "Dropping response on closed connection");
            return;
        }

        if let Some(detail) = &reply.detail {
            debug!(seq = %reply.seq, name = %reply.name, detail = %detail, "Responding with failure");
        }

        let seq = reply.seq;
        let name = reply.name.clone();
        let frame = match codec::encode(&WireMessage::RequestResponse(reply)) {
            Ok(frame) => frame,
            Err(e) => {
                error!(seq = %seq, name = %name, error = %e, "Failed to encode response");
                return;
            }
        };

        let op = PendingOperation::new(OperationKind::Reply, seq, name, frame, Completion::None);
        self.dispatch(op);
    }

    /// Rejects new work on a closed or saturated connection.
    fn admit(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }

        if let Some(limit) = self.options.max_pending
            && self.pending.tracked_len() >= limit
        {
            return Err(Error::TooManyPending { limit });
        }

        Ok(())
    }

    /// Writes `op` now if possible, otherwise parks it.
    fn dispatch(&mut self, mut op: PendingOperation) {
        if self.writable() {
            // Older queued frames go first.
            self.flush_queued();
        }

        if self.writable() && write_frame(&self.transport, &mut op) {
            trace!(kind = ?op.kind, seq = %op.seq, name = %op.name, "Written immediately");
            match op.kind {
                OperationKind::Request => {
                    self.pending.insert(op);
                }
                OperationKind::Event => op.complete(Ok(Value::Null)),
                OperationKind::Reply => {}
            }
            return;
        }

        trace!(kind = ?op.kind, seq = %op.seq, name = %op.name, state = %self.state(), "Queued");
        self.pending.insert(op);
    }

    /// Writes every queued entry in insertion order. Returns how many were written.
    fn flush_queued(&mut self) -> usize {
        let mut flushed = 0;

        for slot in self.pending.queued_slots() {
            let Some(op) = self.pending.get_mut(slot) else {
                continue;
            };

            if !write_frame(&self.transport, op) {
                break;
            }
            flushed += 1;

            if op.kind != OperationKind::Request
                && let Some(done) = self.pending.remove(slot)
            {
                done.complete(Ok(Value::Null));
            }
        }

        flushed
    }
}

// ============================================================================
// Inbound
// ============================================================================

impl<T: Transport> Multiplexer<T> {
    /// Handles one inbound frame.
    ///
    /// Responses are consumed here. Calls that need a handler are returned.
    /// Undecodable frames and orphaned responses are logged and dropped.
    /// Events leave the table once written, so an `EVENT_RESP` never
    /// correlates and is only logged.
    pub fn on_message(&mut self, text: &str) -> Option<Inbound> {
        let message = match codec::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(code = e.code(), error = %e, len = text.len(), "Dropping inbound frame");
                return None;
            }
        };

        trace!(kind = %message.kind(), name = message.name(), seq = %message.seq(), "Frame received");

        match message {
            WireMessage::Request(call) => Some(Inbound::Request(call)),
            WireMessage::SystemEvent(call) if call.name == HANDSHAKE => Some(Inbound::Handshake(call)),
            WireMessage::Event(call) => Some(Inbound::Event {
                kind: MessageKind::Event,
                call,
            }),
            WireMessage::EphemeralEvent(call) => Some(Inbound::Event {
                kind: MessageKind::EphemeralEvent,
                call,
            }),
            WireMessage::SystemEvent(call) => Some(Inbound::Event {
                kind: MessageKind::SystemEvent,
                call,
            }),
            WireMessage::RequestResponse(reply) => {
                self.resolve(reply);
                None
            }
            WireMessage::EventResponse(reply) => {
                debug!(seq = %reply.seq, name = %reply.name, "Unmatched event acknowledgement");
                None
            }
        }
    }

    /// Completes the request `reply` answers. Only requests already on the
    /// wire can be answered; anything else is an orphan.
    fn resolve(&mut self, reply: Reply) {
        let in_flight = self
            .pending
            .get_by_seq(reply.seq)
            .is_some_and(|op| op.kind == OperationKind::Request && op.state == OperationState::Sent);

        if !in_flight {
            warn!(seq = %reply.seq, name = %reply.name, "Orphaned response dropped");
            return;
        }

        let Some(op) = self.pending.remove_by_seq(reply.seq) else {
            return;
        };

        if op.name != reply.name {
            debug!(seq = %op.seq, sent = %op.name, received = %reply.name, "Response name differs");
        }

        trace!(seq = %op.seq, name = %op.name, error = reply.is_error(), "Response matched");
        op.complete(reply.into_result());
    }

    /// Transport opened: send the handshake, flush, wake waiters.
    pub fn on_open(&mut self) {
        if self.closed {
            warn!("Open after close ignored");
            return;
        }

        debug!(queued = self.pending.queued_len(), "Connection open");
        self.opened = true;

        if let Some(payload) = self.options.handshake.clone() {
            self.send_handshake(payload);
        }

        self.housekeep();

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Writes the handshake ahead of anything already queued, or parks it
    /// at the head of the queue.
    fn send_handshake(&mut self, payload: Value) {
        let encoded = self.ids.next_event().and_then(|seq| {
            encode_call(MessageKind::SystemEvent, HANDSHAKE, seq, now_ms(), payload).map(|frame| (seq, frame))
        });

        let (seq, frame) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "Failed to encode handshake");
                return;
            }
        };

        let mut op = PendingOperation::new(OperationKind::Event, seq, HANDSHAKE.to_string(), frame, Completion::None);
        if self.writable() && write_frame(&self.transport, &mut op) {
            trace!(seq = %seq, "Handshake written");
            return;
        }

        debug!(seq = %seq, "Transport not writable on open, handshake queued first");
        self.pending.insert_front(op);
    }

    /// Transport reported an error. Before the first open this is a failed
    /// connection attempt, and open waiters learn why.
    pub fn on_error(&mut self, message: &str) {
        if self.opened || self.closed {
            return;
        }

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(Error::connection(message)));
        }
    }

    /// Transport closed: reject everything still pending.
    pub fn on_close(&mut self) {
        if !self.closed {
            debug!(pending = self.pending.len(), "Connection closed");
        }
        self.closed = true;
        self.fail_all();
    }

    /// Starts closing the transport. Pending operations are rejected when
    /// the close is confirmed by [`on_close`](Self::on_close).
    pub fn close(&self) {
        self.transport.close();
    }

    /// Periodic pass: reap on close, expire deadlines, flush the queue.
    pub fn housekeep(&mut self) {
        if self.state() == ConnectionState::Closed {
            self.fail_all();
            return;
        }

        self.expire(Instant::now());

        if self.writable() {
            let flushed = self.flush_queued();
            if flushed > 0 {
                trace!(flushed, remaining = self.pending.queued_len(), "Queue flushed");
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        for slot in self.pending.expired_slots(now) {
            let Some(op) = self.pending.remove(slot) else {
                continue;
            };
            let timeout_ms = op
                .deadline
                .map_or(0, |d| u64::try_from(d.timeout.as_millis()).unwrap_or(u64::MAX));
            warn!(seq = %op.seq, name = %op.name, timeout_ms, "Request timed out");
            let seq = op.seq;
            op.fail(Error::request_timeout(seq, timeout_ms));
        }
    }

    fn fail_all(&mut self) {
        let drained = self.pending.drain();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Rejecting pending operations");
        }
        for op in drained {
            op.fail(Error::NotConnected);
        }

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(Error::NotConnected));
        }
    }

    /// Resolves once the connection is open.
    pub fn wait_open(&mut self) -> ResultHandle<()> {
        let (tx, handle) = ResultHandle::channel();
        self.register_open_waiter(tx);
        handle
    }

    pub(crate) fn register_open_waiter(&mut self, waiter: oneshot::Sender<Result<()>>) {
        if self.closed {
            let _ = waiter.send(Err(Error::NotConnected));
        } else if self.opened {
            let _ = waiter.send(Ok(()));
        } else {
            self.open_waiters.push(waiter);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn encode_call(kind: MessageKind, name: &str, seq: Seq, ts: i64, payload: Value) -> Result<String> {
    let message = WireMessage::call(kind, Call::new(name, seq, ts, payload))
        .ok_or_else(|| Error::protocol(format!("{kind} is not a call kind")))?;
    codec::encode(&message)
}

/// Hands the frame to the transport and marks the entry sent.
fn write_frame<T: Transport>(transport: &T, op: &mut PendingOperation) -> bool {
    match transport.write(op.frame.clone()) {
        Ok(()) => {
            op.mark_sent();
            true
        }
        Err(e) => {
            debug!(seq = %op.seq, error = %e, "Write rejected by transport");
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
