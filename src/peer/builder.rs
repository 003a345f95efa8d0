//! Builder for client peers.
//!
//! # Example
//!
//! ```ignore
//! let peer = PeerBuilder::new()
//!     .router(Arc::new(router))
//!     .handshake(json!({ "client": "dashboard" }))
//!     .request_timeout(Duration::from_secs(30))
//!     .connect("ws://127.0.0.1:9000/socket")?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::context::ConnectionContext;
use crate::error::Result;
use crate::options::PeerOptions;
use crate::router::Router;
use crate::transport::WsTransport;
use crate::transport::websocket::parse_ws_url;

use super::core::Peer;

// ============================================================================
// PeerBuilder
// ============================================================================

/// Collects router, options and custom data for a client connection.
///
/// Use [`Peer::builder()`] to create one.
#[derive(Debug, Default, Clone)]
pub struct PeerBuilder {
    /// Router serving requests initiated by the server.
    router: Option<Arc<Router>>,
    /// Connection options.
    options: PeerOptions,
    /// Data attached to the connection context.
    custom_data: Option<Value>,
}

// ============================================================================
// PeerBuilder Implementation
// ============================================================================

impl PeerBuilder {
    /// Creates a builder with default options and no handlers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the router for inbound calls.
    #[inline]
    #[must_use]
    pub fn router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Replaces all options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: PeerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the handshake payload.
    #[inline]
    #[must_use]
    pub fn handshake(mut self, payload: Value) -> Self {
        self.options = self.options.with_handshake(payload);
        self
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_request_timeout(timeout);
        self
    }

    /// Sets the housekeeping period.
    #[inline]
    #[must_use]
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.options = self.options.with_housekeeping_interval(interval);
        self
    }

    /// Caps the number of pending operations.
    #[inline]
    #[must_use]
    pub fn max_pending(mut self, limit: usize) -> Self {
        self.options = self.options.with_max_pending(limit);
        self
    }

    /// Attaches custom data to the connection context.
    #[inline]
    #[must_use]
    pub fn custom_data(mut self, data: Value) -> Self {
        self.custom_data = Some(data);
        self
    }

    /// Starts connecting to `url` and returns the peer in `Connecting`.
    ///
    /// Calls made before the connection opens are queued. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the options are
    /// invalid or `url` is not a `ws://` / `wss://` URL.
    pub fn connect(self, url: &str) -> Result<Peer> {
        self.options.validate()?;
        let target = parse_ws_url(url)?;

        let mut context = ConnectionContext::new(
            target.scheme(),
            target.host_str().unwrap_or_default(),
            target.port_or_known_default().unwrap_or_default(),
            target.path(),
        );
        if let Some(data) = self.custom_data {
            context = context.with_custom_data(data);
        }

        let (transport, events) = WsTransport::connect(target.as_str())?;
        let router = self.router.unwrap_or_else(|| Arc::new(Router::new()));

        debug!(url = %target, conn = %context.id, "Connecting peer");
        Ok(Peer::spawn(transport, events, router, context, self.options))
    }
}

// ============================================================================
// Tests
// ============================================================================
