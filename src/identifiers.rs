//! Type-safe identifiers.
//!
//! Newtype wrappers keep correlation ids and connection ids from being
//! mixed up with plain integers or strings.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Seq`] | Correlation id carried in the `seq` wire field |
//! | [`SeqAllocator`] | Per-connection request/event id counters |
//! | [`ConnectionId`] | Identity of one physical connection |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// First id handed out to requests.
pub const FIRST_REQUEST_SEQ: u64 = 1;

/// First id handed out to events.
///
/// Largest integer a JSON peer can represent exactly (2^53 - 1), so the
/// descending event range survives a round trip through any JSON parser.
pub const FIRST_EVENT_SEQ: u64 = (1 << 53) - 1;

// ============================================================================
// Seq
// ============================================================================

/// Correlation id linking an outbound request or event to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Seq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// SeqAllocator
// ============================================================================

/// Hands out correlation ids for one connection.
///
/// Requests count up from [`FIRST_REQUEST_SEQ`], events count down from
/// [`FIRST_EVENT_SEQ`]. The ranges never overlap: allocation fails once the
/// two counters would meet.
#[derive(Debug, Clone)]
pub struct SeqAllocator {
    next_request: u64,
    next_event: u64,
}

impl Default for SeqAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqAllocator {
    /// Creates a fresh allocator.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_request: FIRST_REQUEST_SEQ,
            next_event: FIRST_EVENT_SEQ,
        }
    }

    /// Allocates the next request id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the id space is exhausted.
    pub fn next_request(&mut self) -> Result<Seq> {
        self.ensure_room()?;
        let seq = Seq(self.next_request);
        self.next_request += 1;
        Ok(seq)
    }

    /// Allocates the next event id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the id space is exhausted.
    pub fn next_event(&mut self) -> Result<Seq> {
        self.ensure_room()?;
        let seq = Seq(self.next_event);
        self.next_event -= 1;
        Ok(seq)
    }

    fn ensure_room(&self) -> Result<()> {
        if self.next_request > self.next_event {
            return Err(Error::protocol("correlation id space exhausted"));
        }
        Ok(())
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Identity of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_request_ids_ascend_from_one() {
        let mut ids = SeqAllocator::new();
        assert_eq!(ids.next_request().expect("id"), Seq::new(1));
        assert_eq!(ids.next_request().expect("id"), Seq::new(2));
        assert_eq!(ids.next_request().expect("id"), Seq::new(3));
    }

    #[test]
    fn test_event_ids_descend_from_max() {
        let mut ids = SeqAllocator::new();
        assert_eq!(ids.next_event().expect("id"), Seq::new(FIRST_EVENT_SEQ));
        assert_eq!(ids.next_event().expect("id"), Seq::new(FIRST_EVENT_SEQ - 1));
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut ids = SeqAllocator {
            next_request: 10,
            next_event: 10,
        };
        assert!(ids.next_request().is_ok());
        assert!(ids.next_event().is_err());
        assert!(ids.next_request().is_err());
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }

    proptest! {
        #[test]
        fn prop_request_and_event_ids_never_collide(kinds in proptest::collection::vec(any::<bool>(), 0..512)) {
            let mut ids = SeqAllocator::new();
            let mut seen = FxHashSet::default();

            for is_request in kinds {
                let seq = if is_request {
                    ids.next_request().expect("id")
                } else {
                    ids.next_event().expect("id")
                };
                prop_assert!(seen.insert(seq), "id {} handed out twice", seq);
            }
        }
    }
}
