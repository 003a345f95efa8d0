//! Peer configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use xmn::PeerOptions;
//!
//! let options = PeerOptions::new()
//!     .with_request_timeout(Duration::from_secs(30))
//!     .with_handshake(json!({ "client": "dashboard", "version": 3 }));
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default period between housekeeping passes.
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// PeerOptions
// ============================================================================

/// Settings shared by the multiplexer and the peer event loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerOptions {
    /// Period between housekeeping passes.
    pub housekeeping_interval: Duration,

    /// Default deadline for outbound requests. `None` waits forever.
    ///
    /// Deadlines are checked by housekeeping, so expiry is reported up to
    /// one `housekeeping_interval` late.
    pub request_timeout: Option<Duration>,

    /// Upper bound on tracked requests and events. `None` is unbounded.
    pub max_pending: Option<usize>,

    /// Payload of the `__handshake__` system event sent on open.
    pub handshake: Option<Value>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PeerOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
            request_timeout: None,
            max_pending: None,
            handshake: None,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PeerOptions {
    /// Sets the housekeeping period.
    #[inline]
    #[must_use]
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Sets the default request deadline.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Caps the number of tracked requests and events.
    #[inline]
    #[must_use]
    pub fn with_max_pending(mut self, limit: usize) -> Self {
        self.max_pending = Some(limit);
        self
    }

    /// Sends `payload` as the handshake when the transport opens.
    #[inline]
    #[must_use]
    pub fn with_handshake(mut self, payload: Value) -> Self {
        self.handshake = Some(payload);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PeerOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero housekeeping interval, a zero
    /// request timeout or a zero pending limit.
    pub fn validate(&self) -> Result<()> {
        if self.housekeeping_interval.is_zero() {
            return Err(Error::config("housekeeping interval must be non-zero"));
        }

        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("request timeout must be non-zero"));
        }

        if self.max_pending == Some(0) {
            return Err(Error::config("max pending must be at least 1"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = PeerOptions::new();
        assert_eq!(options.housekeeping_interval, Duration::from_secs(1));
        assert!(options.request_timeout.is_none());
        assert!(options.max_pending.is_none());
        assert!(options.handshake.is_none());
        assert_eq!(options, PeerOptions::default());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = PeerOptions::new()
            .with_housekeeping_interval(Duration::from_millis(50))
            .with_request_timeout(Duration::from_secs(5))
            .with_max_pending(64)
            .with_handshake(json!({"client": "test"}));

        assert_eq!(options.housekeeping_interval, Duration::from_millis(50));
        assert_eq!(options.request_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.max_pending, Some(64));
        assert_eq!(options.handshake, Some(json!({"client": "test"})));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_interval = PeerOptions::new().with_housekeeping_interval(Duration::ZERO);
        assert!(matches!(zero_interval.validate(), Err(Error::Config { .. })));

        let zero_timeout = PeerOptions::new().with_request_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let zero_pending = PeerOptions::new().with_max_pending(0);
        assert!(zero_pending.validate().is_err());
    }
}
