//! xmn - duplex request/event protocol over WebSocket.
//!
//! Two peers exchange typed messages over one persistent, ordered
//! connection: requests with correlated responses, fire-and-forget events,
//! and control-plane system events. Calls made before the connection opens,
//! or while the socket is backed up, are queued and flushed in order.
//!
//! # Architecture
//!
//! ```text
//!   inbound frame ──► codec::decode ──► Multiplexer ──► response? resolve pending
//!                                           │
//!                                           └─► request/event ──► Router ──► handler
//!                                                                   │
//!   outbound frame ◄── Transport::write ◄── Multiplexer ◄── REQ_RESP ┘
//! ```
//!
//! - Each connection is owned by one event loop task ([`Peer`])
//! - The loop owns the [`Multiplexer`](mux::Multiplexer) and its pending table
//! - Handlers are resolved once, at registration ([`Router`])
//! - Every call runs against a derived [`CallContext`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use xmn::router::{Handlers, handler};
//! use xmn::{DEFAULT_BIND_IP, Error, Peer, PeerOptions, Result, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let profiles = Handlers::new().with(
//!         "getProfile",
//!         handler(|_ctx, call| async move { Ok::<_, Error>(json!({ "id": call.data["id"] })) }),
//!     );
//!
//!     let mut router = Router::new();
//!     router.register("getProfile", &profiles, "user")?;
//!
//!     let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(router), PeerOptions::new()).await?;
//!
//!     let client = Peer::builder()
//!         .handshake(json!({ "client": "quickstart" }))
//!         .connect(&server.ws_url())?;
//!
//!     let profile = client.request("getProfile", json!({ "id": 7 })).await?;
//!     println!("profile: {profile}");
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Connection and per-call context |
//! | [`error`] | Error types, wire codes and [`Result`] alias |
//! | [`identifiers`] | Correlation ids and connection ids |
//! | [`mux`] | Pending table and multiplexer |
//! | [`options`] | [`PeerOptions`] |
//! | [`peer`] | Event loop, client builder, server |
//! | [`protocol`] | Wire messages and codec |
//! | [`router`] | Handler registry and dispatch |
//! | [`transport`] | Transport capability and WebSocket adapter |

// ============================================================================
// Modules
// ============================================================================

/// Connection metadata handed to handlers.
pub mod context;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Correlation and connection identifiers.
pub mod identifiers;

/// Send-side multiplexing.
///
/// Owns the pending table; decides between writing now and queuing.
pub mod mux;

/// Peer configuration.
pub mod options;

/// Connection runtime: [`Peer`], [`PeerBuilder`], [`Server`].
pub mod peer;

/// Wire message model and JSON codec.
pub mod protocol;

/// Receive-side handler registry.
pub mod router;

/// Transport capability and WebSocket implementation.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Context types
pub use context::{CallContext, ConnectionContext, ServerFields, derive_context};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, Seq};

// Multiplexer types
pub use mux::{Multiplexer, ResultHandle};

// Configuration
pub use options::PeerOptions;

// Runtime types
pub use peer::{DEFAULT_BIND_IP, Peer, PeerBuilder, Server};

// Protocol types
pub use protocol::{Call, HANDSHAKE, MessageKind, Reply, WireMessage};

// Router types
pub use router::{Handler, Router, Service};

// Transport types
pub use transport::{ConnectionState, Transport, TransportEvent, WsTransport};
