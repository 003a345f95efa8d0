//! Transport capability and WebSocket adapter.
//!
//! The multiplexer only needs a small capability set from the byte-stream
//! underneath it: its state, how many bytes are still unflushed, a way to
//! write a frame and a way to close. Lifecycle callbacks arrive as
//! [`TransportEvent`]s on a channel consumed by a single task, so each
//! callback runs to completion before the next one starts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  write(frame)   ┌──────────────┐   WebSocket   ┌──────────┐
//! │ Multiplexer  │────────────────►│ WsTransport  │◄─────────────►│  Remote  │
//! │              │◄────────────────│  (io task)   │               │   peer   │
//! └──────────────┘ TransportEvent  └──────────────┘               └──────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | tokio-tungstenite backed [`Transport`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket transport over tokio-tungstenite.
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use websocket::{AcceptedRequest, WsTransport};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle of one transport instance.
///
/// `Closed` is terminal: a new attempt needs a new transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not yet open; writes are deferred.
    Connecting,
    /// Open; writes allowed when nothing is buffered.
    Open,
    /// Closed for good.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Lifecycle callbacks delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport became writable.
    Open,
    /// One inbound text frame.
    Message(String),
    /// Every written frame has been flushed; `buffered_amount()` is `0`.
    Drained,
    /// The transport closed.
    Close,
    /// A transport-level failure. A `Close` follows if it was fatal.
    Error(String),
}

// ============================================================================
// Transport
// ============================================================================

/// What the multiplexer needs from a byte-stream transport.
pub trait Transport {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Bytes handed to [`write`](Self::write) that are not yet flushed.
    ///
    /// `0` means it is safe to write.
    fn buffered_amount(&self) -> usize;

    /// Queues one frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`](crate::Error::NotConnected) if the
    /// transport can no longer accept frames.
    fn write(&self, frame: String) -> Result<()>;

    /// Starts closing the transport.
    fn close(&self);
}
