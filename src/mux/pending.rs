//! Pending operation table.
//!
//! Every outbound request or event that cannot be written immediately, and
//! every request awaiting its response, lives here until it is resolved.
//! Entries are kept in insertion order so a flush writes them exactly in
//! the order they were submitted. Locally initiated operations are also
//! indexed by [`Seq`] for response correlation.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::identifiers::Seq;

// ============================================================================
// Constants
// ============================================================================

/// First slot handed out by [`PendingTable::insert`]. Slots below it are
/// left for entries that must jump the queue.
const FIRST_SLOT: u64 = 1 << 32;

// ============================================================================
// OperationKind / OperationState
// ============================================================================

/// What a pending entry will produce on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Outbound `REQUEST`, resolved by a `REQ_RESP`.
    Request,
    /// Outbound `EVENT`, `EPH_EVENT` or `SYS_EVENT`, resolved once written.
    Event,
    /// Outbound `REQ_RESP` held back by backpressure.
    Reply,
}

/// Whether the frame has been handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Queued, not yet written.
    ToBeSent,
    /// Written, awaiting a response.
    Sent,
}

// ============================================================================
// Completion
// ============================================================================

/// Where the outcome of an operation is delivered.
pub(crate) enum Completion {
    Request(oneshot::Sender<Result<Value>>),
    Event(oneshot::Sender<Result<()>>),
    None,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request(_) => "Request",
            Self::Event(_) => "Event",
            Self::None => "None",
        })
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// Expiry of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Instant after which the request is rejected.
    pub at: Instant,
    /// The configured timeout, for error reporting.
    pub timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now, or `None` if that instant is not
    /// representable (the request then never expires).
    #[inline]
    #[must_use]
    pub fn after(timeout: Duration) -> Option<Self> {
        Instant::now()
            .checked_add(timeout)
            .map(|at| Self { at, timeout })
    }

    /// Returns `true` once `now` is at or past the deadline.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.at
    }
}

// ============================================================================
// PendingOperation
// ============================================================================

/// One tracked outbound operation.
#[derive(Debug)]
pub struct PendingOperation {
    /// Wire category.
    pub kind: OperationKind,
    /// Correlation id.
    pub seq: Seq,
    /// Request, event or reply name.
    pub name: String,
    /// Encoded frame. Cleared once written.
    pub frame: String,
    /// Lifecycle state.
    pub state: OperationState,
    /// Expiry, requests only.
    pub deadline: Option<Deadline>,
    completion: Completion,
}

impl PendingOperation {
    pub(crate) fn new(
        kind: OperationKind,
        seq: Seq,
        name: String,
        frame: String,
        completion: Completion,
    ) -> Self {
        Self {
            kind,
            seq,
            name,
            frame,
            state: OperationState::ToBeSent,
            deadline: None,
            completion,
        }
    }

    /// Sets the deadline.
    #[inline]
    #[must_use]
    pub(crate) fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Marks the frame as written and releases it.
    pub(crate) fn mark_sent(&mut self) {
        self.state = OperationState::Sent;
        self.frame = String::new();
    }

    /// Returns `true` if the frame still has to be written.
    #[inline]
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.state == OperationState::ToBeSent
    }

    /// Delivers `result` to whoever is waiting. Dropped receivers are ignored.
    pub(crate) fn complete(self, result: Result<Value>) {
        match self.completion {
            Completion::Request(tx) => {
                let _ = tx.send(result);
            }
            Completion::Event(tx) => {
                let _ = tx.send(result.map(drop));
            }
            Completion::None => {}
        }
    }

    /// Rejects the operation.
    #[inline]
    pub(crate) fn fail(self, error: Error) {
        self.complete(Err(error));
    }
}

// ============================================================================
// PendingTable
// ============================================================================

/// Insertion-ordered table of pending operations.
#[derive(Debug)]
pub struct PendingTable {
    entries: BTreeMap<u64, PendingOperation>,
    by_seq: FxHashMap<Seq, u64>,
    next_slot: u64,
    tracked: usize,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_seq: FxHashMap::default(),
            next_slot: FIRST_SLOT,
            tracked: 0,
        }
    }
}

impl PendingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation and returns its slot.
    ///
    /// Requests and events are indexed by seq; replies are not, since their
    /// seq belongs to the remote side.
    pub(crate) fn insert(&mut self, op: PendingOperation) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.place(slot, op);
        slot
    }

    /// Inserts an operation ahead of every current entry.
    pub(crate) fn insert_front(&mut self, op: PendingOperation) -> u64 {
        let head = self
            .entries
            .first_key_value()
            .map_or(self.next_slot, |(slot, _)| *slot);

        match head.checked_sub(1) {
            Some(slot) => {
                self.place(slot, op);
                slot
            }
            None => self.insert(op),
        }
    }

    fn place(&mut self, slot: u64, op: PendingOperation) {
        if op.kind != OperationKind::Reply {
            self.by_seq.insert(op.seq, slot);
            self.tracked += 1;
        }
        self.entries.insert(slot, op);
    }

    /// Looks up a locally initiated operation.
    #[must_use]
    pub fn get_by_seq(&self, seq: Seq) -> Option<&PendingOperation> {
        self.by_seq.get(&seq).and_then(|slot| self.entries.get(slot))
    }

    pub(crate) fn get_mut(&mut self, slot: u64) -> Option<&mut PendingOperation> {
        self.entries.get_mut(&slot)
    }

    /// Removes a locally initiated operation by seq.
    pub(crate) fn remove_by_seq(&mut self, seq: Seq) -> Option<PendingOperation> {
        let slot = self.by_seq.get(&seq).copied()?;
        self.remove(slot)
    }

    /// Removes the operation at `slot`.
    pub(crate) fn remove(&mut self, slot: u64) -> Option<PendingOperation> {
        let op = self.entries.remove(&slot)?;
        if op.kind != OperationKind::Reply {
            self.by_seq.remove(&op.seq);
            self.tracked -= 1;
        }
        Some(op)
    }

    /// Slots of queued operations, oldest first.
    #[must_use]
    pub fn queued_slots(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, op)| op.is_queued())
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Slots whose deadline has passed at `now`.
    #[must_use]
    pub fn expired_slots(&self, now: Instant) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, op)| op.deadline.is_some_and(|d| d.is_expired(now)))
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Removes every entry, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<PendingOperation> {
        self.by_seq.clear();
        self.tracked = 0;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Total entries, replies included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Requests and events currently tracked.
    #[inline]
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.tracked
    }

    /// Entries not yet written.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.entries.values().filter(|op| op.is_queued()).count()
    }
}

// ============================================================================
// Tests
// ============================================================================
