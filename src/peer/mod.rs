//! Connection runtime.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Peer`] handle and the per-connection event loop |
//! | `builder` | [`PeerBuilder`] for client connections |
//! | `server` | [`Server`] accepting connections into a peer registry |

// ============================================================================
// Submodules
// ============================================================================

/// Client builder.
pub mod builder;

/// Peer handle and event loop.
pub mod core;

/// Accepting side.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::PeerBuilder;
pub use core::Peer;
pub use server::{DEFAULT_BIND_IP, Server};
