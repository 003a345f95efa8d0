//! Error types for the xmn protocol.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use xmn::{Error, Result};
//!
//! async fn example(peer: &Peer) -> Result<()> {
//!     let profile = peer.request("getProfile", json!({})).await?;
//!     peer.event("seen", json!({ "id": profile["id"] })).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::NotConnected`], [`Error::Connection`], [`Error::RequestTimeout`], [`Error::TooManyPending`] |
//! | Wire | [`Error::Decode`], [`Error::UnknownMessageType`], [`Error::Protocol`] |
//! | Dispatch | [`Error::UnknownApi`], [`Error::UnknownEvent`], [`Error::Handler`], [`Error::Remote`] |
//! | Registration | [`Error::DuplicateRegistration`], [`Error::HandlerNotFound`], [`Error::ReservedName`] |
//! | Configuration | [`Error::Config`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::Seq;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Codes
// ============================================================================

/// Wire codes carried in the `errorCode` field of response frames.
pub mod codes {
    /// Transport is closed.
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    /// Generic connection failure.
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    /// Request deadline expired.
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    /// Pending table is full.
    pub const TOO_MANY_PENDING: &str = "TOO_MANY_PENDING";
    /// Malformed frame.
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    /// Unrecognized `type` discriminator.
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    /// Protocol violation.
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    /// No API registered under the requested name.
    pub const UNKNOWN_API: &str = "UNKNOWN_API";
    /// No event handler registered under the name.
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
    /// Name registered twice.
    pub const DUPLICATE_REGISTRATION: &str = "DUPLICATE_REGISTRATION";
    /// Owner does not provide the handler.
    pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
    /// Name is reserved for protocol use.
    pub const RESERVED_NAME: &str = "RESERVED_NAME";
    /// Handler raised a failure.
    pub const HANDLER_FAILURE: &str = "HANDLER_FAILURE";
    /// Handler panicked.
    pub const HANDLER_PANIC: &str = "HANDLER_PANIC";
    /// Invalid configuration.
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Operation attempted while the transport is closed.
    ///
    /// Also used to reject every still-pending operation when the
    /// transport closes underneath it.
    #[error("Not connected")]
    NotConnected,

    /// Transport could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Request deadline expired before a response arrived.
    #[error("Request {seq} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Correlation id of the expired request.
        seq: Seq,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Pending table reached its configured limit.
    #[error("Too many pending operations (limit {limit})")]
    TooManyPending {
        /// Configured limit.
        limit: usize,
    },

    // ========================================================================
    // Wire Errors
    // ========================================================================
    /// Inbound frame could not be decoded.
    ///
    /// The frame is logged and dropped; the connection stays open.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    /// Inbound frame carries an unrecognized `type` discriminator.
    #[error("Unknown message type: {kind}")]
    UnknownMessageType {
        /// The unrecognized discriminator.
        kind: String,
    },

    /// Protocol violation.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No API registered under the requested name.
    #[error("Unknown API: {name}")]
    UnknownApi {
        /// The requested name.
        name: String,
    },

    /// No event handler registered under the name.
    #[error("Unknown event: {name}")]
    UnknownEvent {
        /// The event name.
        name: String,
    },

    /// A local handler failed while serving a call.
    #[error("{code}: {message}")]
    Handler {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The remote peer answered with a structured failure.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// `errorCode` from the response frame.
        code: String,
        /// `errorMessage` from the response frame.
        message: String,
    },

    // ========================================================================
    // Registration Errors
    // ========================================================================
    /// Name is already registered.
    #[error("Duplicate registration: {name}")]
    DuplicateRegistration {
        /// The duplicated name.
        name: String,
    },

    /// Owner does not expose a handler for the name.
    #[error("Handler not found on owner: {name}")]
    HandlerNotFound {
        /// The missing handler name.
        name: String,
    },

    /// Name is reserved for protocol control messages.
    #[error("Reserved name: {name}")]
    ReservedName {
        /// The reserved name.
        name: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(seq: Seq, timeout_ms: u64) -> Self {
        Self::RequestTimeout { seq, timeout_ms }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an unknown message type error.
    #[inline]
    pub fn unknown_message_type(kind: impl Into<String>) -> Self {
        Self::UnknownMessageType { kind: kind.into() }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unknown API error.
    #[inline]
    pub fn unknown_api(name: impl Into<String>) -> Self {
        Self::UnknownApi { name: name.into() }
    }

    /// Creates an unknown event error.
    #[inline]
    pub fn unknown_event(name: impl Into<String>) -> Self {
        Self::UnknownEvent { name: name.into() }
    }

    /// Creates a handler failure.
    #[inline]
    pub fn handler(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a handler failure with the generic failure code.
    #[inline]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::handler(codes::HANDLER_FAILURE, message)
    }

    /// Creates a remote failure from response frame fields.
    #[inline]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a duplicate registration error.
    #[inline]
    pub fn duplicate_registration(name: impl Into<String>) -> Self {
        Self::DuplicateRegistration { name: name.into() }
    }

    /// Creates a handler not found error.
    #[inline]
    pub fn handler_not_found(name: impl Into<String>) -> Self {
        Self::HandlerNotFound { name: name.into() }
    }

    /// Creates a reserved name error.
    #[inline]
    pub fn reserved_name(name: impl Into<String>) -> Self {
        Self::ReservedName { name: name.into() }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============================================================================
// Wire Mapping
// ============================================================================

impl Error {
    /// Returns the wire code for this error.
    ///
    /// Handler and remote failures keep the code they were created with.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::NotConnected => codes::NOT_CONNECTED,
            Self::Connection { .. } | Self::WebSocket(_) | Self::Io(_) => codes::CONNECTION_ERROR,
            Self::RequestTimeout { .. } => codes::REQUEST_TIMEOUT,
            Self::TooManyPending { .. } => codes::TOO_MANY_PENDING,
            Self::Decode { .. } | Self::Json(_) => codes::DECODE_ERROR,
            Self::UnknownMessageType { .. } => codes::UNKNOWN_MESSAGE_TYPE,
            Self::Protocol { .. } => codes::PROTOCOL_ERROR,
            Self::UnknownApi { .. } => codes::UNKNOWN_API,
            Self::UnknownEvent { .. } => codes::UNKNOWN_EVENT,
            Self::Handler { code, .. } | Self::Remote { code, .. } => code.as_str(),
            Self::DuplicateRegistration { .. } => codes::DUPLICATE_REGISTRATION,
            Self::HandlerNotFound { .. } => codes::HANDLER_NOT_FOUND,
            Self::ReservedName { .. } => codes::RESERVED_NAME,
            Self::Config { .. } => codes::CONFIG_ERROR,
        }
    }

    /// Returns the message carried in the `errorMessage` field.
    ///
    /// Handler and remote failures send their bare message, everything
    /// else its display form.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::Handler { message, .. } | Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Connection { .. } | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a registration-time configuration error.
    ///
    /// These are fatal to startup and never occur at dispatch time.
    #[inline]
    #[must_use]
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRegistration { .. }
                | Self::HandlerNotFound { .. }
                | Self::ReservedName { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
        assert_eq!(Error::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotConnected.code(), codes::NOT_CONNECTED);
        assert_eq!(Error::unknown_api("x").code(), codes::UNKNOWN_API);
        assert_eq!(Error::unknown_event("x").code(), codes::UNKNOWN_EVENT);
        assert_eq!(Error::decode("bad").code(), codes::DECODE_ERROR);
    }

    #[test]
    fn test_handler_error_keeps_code() {
        let err = Error::handler("NO_SUCH_USER", "user 7 missing");
        assert_eq!(err.code(), "NO_SUCH_USER");
        assert_eq!(err.wire_message(), "user 7 missing");
    }

    #[test]
    fn test_failure_uses_generic_code() {
        let err = Error::failure("boom");
        assert_eq!(err.code(), codes::HANDLER_FAILURE);
        assert_eq!(err.to_string(), "HANDLER_FAILURE: boom");
    }

    #[test]
    fn test_wire_message_uses_display() {
        let err = Error::unknown_api("getProfil");
        assert_eq!(err.wire_message(), "Unknown API: getProfil");
    }

    #[test]
    fn test_is_registration_error() {
        assert!(Error::duplicate_registration("a").is_registration_error());
        assert!(Error::handler_not_found("a").is_registration_error());
        assert!(Error::reserved_name("__handshake__").is_registration_error());
        assert!(!Error::unknown_api("a").is_registration_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::connection("x").is_connection_error());
        assert!(!Error::config("x").is_connection_error());
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::request_timeout(Seq::new(3), 100).is_timeout());
        assert!(!Error::NotConnected.is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
