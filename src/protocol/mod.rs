//! Wire message model.
//!
//! This module defines the frame format exchanged between two peers.
//!
//! # Message Kinds
//!
//! | Kind | Wire `type` | Response |
//! |------|-------------|----------|
//! | Request | `REQUEST` | `REQ_RESP` |
//! | Event | `EVENT` | none (optional `EVENT_RESP`) |
//! | Ephemeral event | `EPH_EVENT` | none |
//! | System event | `SYS_EVENT` | none |
//!
//! Requests and events carry an explicit `seq` correlation id; responses
//! echo the `seq` of the call they answer. `ts` is only a timestamp.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Text frame encode/decode |
//! | `message` | Message types |

// ============================================================================
// Submodules
// ============================================================================

/// Text frame encode/decode.
pub mod codec;

/// Message types.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{decode, encode};
pub use message::{Call, HANDSHAKE, MessageKind, Reply, WireMessage, now_ms};
