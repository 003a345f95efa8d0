//! Per-connection metadata handed to handlers.
//!
//! A [`ConnectionContext`] is built once when a connection is accepted or
//! opened. Every inbound call is processed against a [`CallContext`]
//! derived from it: the connection-level fields are shared through an
//! `Arc`, the per-call fields (label, start time, tracing span) are fresh.
//! Connection-level updates (handshake, last event time) produce a new
//! base instead of mutating the shared one.
//!
//! # Example
//!
//! ```ignore
//! let base = Arc::new(ConnectionContext::new("ws", "localhost", 8080, "/"));
//! let call = derive_context(&base, "req:getProfile");
//! assert_eq!(call.host, "localhost");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{Span, info_span};

use crate::identifiers::ConnectionId;

// ============================================================================
// ServerFields
// ============================================================================

/// Fields only meaningful on the accepting side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFields {
    /// Local clock minus the peer's clock, from the handshake (ms).
    pub ms_offset: i64,
    /// Timestamp of the last inbound event (epoch ms).
    pub last_event_ts: i64,
}

// ============================================================================
// ConnectionContext
// ============================================================================

/// Metadata about one physical connection.
///
/// Cheap to clone: headers and custom data sit behind `Arc`.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Connection identity.
    pub id: ConnectionId,
    /// URL scheme (`ws` / `wss`).
    pub protocol: String,
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Request path.
    pub path: String,
    /// Handshake headers, lower-cased names.
    pub headers: Arc<FxHashMap<String, String>>,
    /// Remote socket address, when known.
    pub remote_address: Option<SocketAddr>,
    /// Accept-side bookkeeping.
    pub server: ServerFields,
    /// Payload of the peer's `__handshake__` message.
    pub peer_info: Arc<Value>,
    /// Application data attached by whoever accepted the connection.
    pub custom_data: Arc<Value>,
}

impl ConnectionContext {
    /// Creates a context with empty headers and data.
    #[must_use]
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.into(),
            headers: Arc::new(FxHashMap::default()),
            remote_address: None,
            server: ServerFields::default(),
            peer_info: Arc::new(Value::Null),
            custom_data: Arc::new(Value::Null),
        }
    }

    /// Sets the handshake headers.
    #[inline]
    #[must_use]
    pub fn with_headers(mut self, headers: FxHashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    /// Sets the remote address.
    #[inline]
    #[must_use]
    pub fn with_remote_address(mut self, addr: SocketAddr) -> Self {
        self.remote_address = Some(addr);
        self
    }

    /// Sets the custom data.
    #[inline]
    #[must_use]
    pub fn with_custom_data(mut self, data: Value) -> Self {
        self.custom_data = Arc::new(data);
        self
    }

    /// Returns a copy carrying the peer's handshake payload.
    ///
    /// A positive `sent_at` (the handshake frame's `ts`) sets
    /// [`ServerFields::ms_offset`] to `now_ms - sent_at`.
    #[must_use]
    pub fn with_peer_info(&self, info: Value, sent_at: i64, now_ms: i64) -> Self {
        let mut next = self.clone();
        if sent_at > 0 {
            next.server.ms_offset = now_ms - sent_at;
        }
        next.peer_info = Arc::new(info);
        next
    }

    /// Returns a copy with an updated last-event timestamp.
    #[inline]
    #[must_use]
    pub fn with_last_event_ts(&self, ts: i64) -> Self {
        let mut next = self.clone();
        next.server.last_event_ts = ts;
        next
    }

    /// Returns a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ============================================================================
// CallContext
// ============================================================================

/// Context for a single inbound call.
///
/// Dereferences to the shared [`ConnectionContext`].
#[derive(Debug, Clone)]
pub struct CallContext {
    connection: Arc<ConnectionContext>,
    label: String,
    started_at: Instant,
    span: Span,
}

/// Derives a per-call context from a connection base.
///
/// The base is shared, never copied field by field.
#[must_use]
pub fn derive_context(base: &Arc<ConnectionContext>, label: impl Into<String>) -> CallContext {
    let label = label.into();
    let span = info_span!("call", conn = %base.id, label = %label);
    CallContext {
        connection: Arc::clone(base),
        label,
        started_at: Instant::now(),
        span,
    }
}

impl CallContext {
    /// Short label for logs (`req:name`, `evt:name`).
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Time since this call was derived.
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Tracing span covering this call.
    #[inline]
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The shared connection context.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }
}

impl Deref for CallContext {
    type Target = ConnectionContext;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

// ============================================================================
// Tests
// ============================================================================
