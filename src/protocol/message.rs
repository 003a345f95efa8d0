//! Wire message types.
//!
//! Six message kinds share one JSON shape, discriminated by `type`.
//!
//! # Format
//!
//! ```json
//! {
//!   "type": "REQUEST",
//!   "name": "getProfile",
//!   "seq": 1,
//!   "ts": 1718000000000,
//!   "data": { ... }
//! }
//! ```
//!
//! Response frames (`REQ_RESP`, `EVENT_RESP`) add `errorCode` and
//! `errorMessage`, both `null` on success.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::identifiers::Seq;

// ============================================================================
// Constants
// ============================================================================

/// Name reserved for connection-establishment control messages.
///
/// Never accepted as an application API or event name.
pub const HANDSHAKE: &str = "__handshake__";

/// Returns the current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ============================================================================
// MessageKind
// ============================================================================

/// Wire discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `REQUEST`
    Request,
    /// `EVENT`
    Event,
    /// `EPH_EVENT`
    EphemeralEvent,
    /// `SYS_EVENT`
    SystemEvent,
    /// `REQ_RESP`
    RequestResponse,
    /// `EVENT_RESP`
    EventResponse,
}

impl MessageKind {
    /// All kinds, in wire declaration order.
    pub const ALL: [Self; 6] = [
        Self::Request,
        Self::Event,
        Self::EphemeralEvent,
        Self::SystemEvent,
        Self::RequestResponse,
        Self::EventResponse,
    ];

    /// Returns the wire discriminator.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Event => "EVENT",
            Self::EphemeralEvent => "EPH_EVENT",
            Self::SystemEvent => "SYS_EVENT",
            Self::RequestResponse => "REQ_RESP",
            Self::EventResponse => "EVENT_RESP",
        }
    }

    /// Parses a wire discriminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMessageType`] for anything else.
    pub fn from_wire(kind: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == kind)
            .ok_or_else(|| Error::unknown_message_type(kind))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Call
// ============================================================================

/// Body of a request or event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// API or event name.
    pub name: String,

    /// Correlation id assigned by the sender.
    #[serde(default)]
    pub seq: Seq,

    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub ts: i64,

    /// Structured payload.
    #[serde(default)]
    pub data: Value,
}

impl Call {
    /// Creates a call body.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, seq: Seq, ts: i64, data: Value) -> Self {
        Self {
            name: name.into(),
            seq,
            ts,
            data,
        }
    }
}

// ============================================================================
// Reply
// ============================================================================

/// Body of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Name of the call being answered.
    pub name: String,

    /// Correlation id of the call being answered.
    pub seq: Seq,

    /// Response time in epoch milliseconds.
    #[serde(default)]
    pub ts: i64,

    /// Result payload (`null` on failure).
    #[serde(default)]
    pub data: Value,

    /// Failure code, if the call failed.
    #[serde(default)]
    pub error_code: Option<String>,

    /// Failure message, if the call failed.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Local diagnostic detail. Never encoded.
    #[serde(skip)]
    pub detail: Option<String>,
}

impl Reply {
    /// Creates a successful reply to `call`.
    #[must_use]
    pub fn success(call: &Call, data: Value) -> Self {
        Self {
            name: call.name.clone(),
            seq: call.seq,
            ts: now_ms(),
            data,
            error_code: None,
            error_message: None,
            detail: None,
        }
    }

    /// Creates a failed reply to `call` from a local error.
    ///
    /// The debug form of the error is kept as local-only detail.
    #[must_use]
    pub fn failure(call: &Call, error: &Error) -> Self {
        Self {
            name: call.name.clone(),
            seq: call.seq,
            ts: now_ms(),
            data: Value::Null,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.wire_message()),
            detail: Some(format!("{error:?}")),
        }
    }

    /// Returns `true` if this reply reports a failure.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// Converts the reply into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the reply carries an error code.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.error_code {
            None => Ok(self.data),
            Some(code) => {
                let message = self.error_message.unwrap_or_else(|| code.clone());
                Err(Error::remote(code, message))
            }
        }
    }
}

// ============================================================================
// WireMessage
// ============================================================================

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Call expecting a response.
    #[serde(rename = "REQUEST")]
    Request(Call),

    /// Fire-and-forget, ordered.
    #[serde(rename = "EVENT")]
    Event(Call),

    /// Like `Event`, never persisted or retried by surrounding layers.
    #[serde(rename = "EPH_EVENT")]
    EphemeralEvent(Call),

    /// Control-plane event.
    #[serde(rename = "SYS_EVENT")]
    SystemEvent(Call),

    /// Response to a `Request`.
    #[serde(rename = "REQ_RESP")]
    RequestResponse(Reply),

    /// Optional acknowledgement of an `Event`.
    #[serde(rename = "EVENT_RESP")]
    EventResponse(Reply),
}

impl WireMessage {
    /// Returns the discriminator.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Event(_) => MessageKind::Event,
            Self::EphemeralEvent(_) => MessageKind::EphemeralEvent,
            Self::SystemEvent(_) => MessageKind::SystemEvent,
            Self::RequestResponse(_) => MessageKind::RequestResponse,
            Self::EventResponse(_) => MessageKind::EventResponse,
        }
    }

    /// Builds a call frame of the given kind.
    ///
    /// Response kinds are not call frames and yield `None`.
    #[must_use]
    pub fn call(kind: MessageKind, call: Call) -> Option<Self> {
        match kind {
            MessageKind::Request => Some(Self::Request(call)),
            MessageKind::Event => Some(Self::Event(call)),
            MessageKind::EphemeralEvent => Some(Self::EphemeralEvent(call)),
            MessageKind::SystemEvent => Some(Self::SystemEvent(call)),
            MessageKind::RequestResponse | MessageKind::EventResponse => None,
        }
    }

    /// Returns the message name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Request(c) | Self::Event(c) | Self::EphemeralEvent(c) | Self::SystemEvent(c) => {
                &c.name
            }
            Self::RequestResponse(r) | Self::EventResponse(r) => &r.name,
        }
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn seq(&self) -> Seq {
        match self {
            Self::Request(c) | Self::Event(c) | Self::EphemeralEvent(c) | Self::SystemEvent(c) => {
                c.seq
            }
            Self::RequestResponse(r) | Self::EventResponse(r) => r.seq,
        }
    }

    /// Returns the timestamp.
    #[must_use]
    pub fn ts(&self) -> i64 {
        match self {
            Self::Request(c) | Self::Event(c) | Self::EphemeralEvent(c) | Self::SystemEvent(c) => {
                c.ts
            }
            Self::RequestResponse(r) | Self::EventResponse(r) => r.ts,
        }
    }

    /// Returns the payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        match self {
            Self::Request(c) | Self::Event(c) | Self::EphemeralEvent(c) | Self::SystemEvent(c) => {
                &c.data
            }
            Self::RequestResponse(r) | Self::EventResponse(r) => &r.data,
        }
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
    fn test_kind_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()).expect("known"), kind);
        }
        assert!(matches!(
            MessageKind::from_wire("PING"),
            Err(Error::UnknownMessageType { .. })
        ));
    }

    #[test]
    fn test_request_serialization() {
        let msg = WireMessage::Request(Call::new("getProfile", Seq::new(1), 5, json!({"id": 7})));
        let json = serde_json::to_value(&msg).expect("serialize");

        assert_eq!(json["type"], "REQUEST");
        assert_eq!(json["name"], "getProfile");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["data"]["id"], 7);
        assert!(json.get("errorCode").is_none());
    }

    #[test]
    fn test_response_carries_null_error_fields() {
        let call = Call::new("ping", Seq::new(4), 0, Value::Null);
        let msg = WireMessage::RequestResponse(Reply::success(&call, json!("pong")));
        let json = serde_json::to_value(&msg).expect("serialize");

        assert_eq!(json["type"], "REQ_RESP");
        assert_eq!(json["seq"], 4);
        assert!(json["errorCode"].is_null());
        assert!(json["errorMessage"].is_null());
    }

    #[test]
    fn test_failure_reply_hides_detail() {
        let call = Call::new("getProfile", Seq::new(9), 0, Value::Null);
        let reply = Reply::failure(&call, &Error::handler("NO_USER", "missing"));
        assert!(reply.detail.is_some());

        let json = serde_json::to_string(&WireMessage::RequestResponse(reply)).expect("serialize");
        assert!(json.contains("NO_USER"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_reply_into_result() {
        let call = Call::new("ping", Seq::new(1), 0, Value::Null);
        let ok = Reply::success(&call, json!({"ok": true}));
        assert_eq!(ok.into_result().expect("ok"), json!({"ok": true}));

        let failed = Reply::failure(&call, &Error::unknown_api("ping"));
        match failed.into_result() {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, "UNKNOWN_API");
                assert_eq!(message, "Unknown API: ping");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_accessors() {
        let msg = WireMessage::SystemEvent(Call::new("ping", Seq::new(2), 11, json!([1])));
        assert_eq!(msg.kind(), MessageKind::SystemEvent);
        assert_eq!(msg.name(), "ping");
        assert_eq!(msg.seq(), Seq::new(2));
        assert_eq!(msg.ts(), 11);
        assert_eq!(msg.data(), &json!([1]));
    }

    #[test]
    fn test_call_builder_rejects_response_kinds() {
        let call = Call::new("x", Seq::new(1), 0, Value::Null);
        assert!(WireMessage::call(MessageKind::Event, call.clone()).is_some());
        assert!(WireMessage::call(MessageKind::RequestResponse, call).is_none());
    }
}
