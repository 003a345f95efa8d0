//! Frame encoding and decoding.
//!
//! One message per text frame. Decoding checks the `type` discriminator
//! before parsing the body so an unknown kind surfaces as
//! [`Error::UnknownMessageType`] rather than a generic parse failure.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::{from_str, to_string};

use crate::error::{Error, Result};

use super::{MessageKind, WireMessage};

// ============================================================================
// Envelope
// ============================================================================

/// Reads only the discriminator.
#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: Option<std::borrow::Cow<'a, str>>,
}

// ============================================================================
// Public API
// ============================================================================

/// Encodes a message into a text frame.
///
/// Local-only fields (such as [`Reply::detail`](super::Reply::detail)) are
/// not written.
///
/// # Errors
///
/// Returns [`Error::Json`] if the payload cannot be serialized.
pub fn encode(message: &WireMessage) -> Result<String> {
    Ok(to_string(message)?)
}

/// Decodes a text frame.
///
/// # Errors
///
/// - [`Error::Decode`] if the frame is not a well-formed message
/// - [`Error::UnknownMessageType`] if `type` is not one of the six kinds
pub fn decode(text: &str) -> Result<WireMessage> {
    let envelope: Envelope<'_> = from_str(text).map_err(|e| Error::decode(e.to_string()))?;
    let kind = envelope
        .kind
        .ok_or_else(|| Error::decode("missing `type` field"))?;
    MessageKind::from_wire(&kind)?;

    from_str(text).map_err(|e| Error::decode(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};

    use crate::identifiers::Seq;
    use crate::protocol::{Call, Reply};

    fn representative() -> Vec<WireMessage> {
        let call = Call::new("getProfile", Seq::new(1), 1_718_000_000_000, json!({"id": 7}));
        vec![
            WireMessage::Request(call.clone()),
            WireMessage::Event(Call::new("log", Seq::new(9_007_199_254_740_991), 3, json!({"msg": "x"}))),
            WireMessage::EphemeralEvent(Call::new("cursor", Seq::new(5), 4, json!([1, 2]))),
            WireMessage::SystemEvent(Call::new("ping", Seq::default(), 0, Value::Null)),
            WireMessage::RequestResponse(Reply::success(&call, json!({"name": "ada"}))),
            WireMessage::EventResponse(Reply {
                name: "log".into(),
                seq: Seq::new(8),
                ts: 10,
                data: Value::Null,
                error_code: Some("BUSY".into()),
                error_message: Some("try later".into()),
                detail: None,
            }),
        ]
    }

    #[test]
    fn test_round_trip_every_kind() {
        for message in representative() {
            let frame = encode(&message).expect("encode");
            let decoded = decode(&frame).expect("decode");
            assert_eq!(decoded, message, "frame: {frame}");
        }
    }

    #[test]
    fn test_detail_dropped_on_round_trip() {
        let call = Call::new("x", Seq::new(2), 0, Value::Null);
        let reply = Reply::failure(&call, &crate::error::Error::unknown_api("x"));
        let frame = encode(&WireMessage::RequestResponse(reply.clone())).expect("encode");

        match decode(&frame).expect("decode") {
            WireMessage::RequestResponse(decoded) => {
                assert!(decoded.detail.is_none());
                assert_eq!(decoded.error_code, reply.error_code);
                assert_eq!(decoded.error_message, reply.error_message);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_structured() {
        let err = decode(r#"{"type":"PING","name":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType { ref kind } if kind == "PING"));
    }

    #[test]
    fn test_missing_type() {
        let err = decode(r#"{"name":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(decode("{not json").unwrap_err(), Error::Decode { .. }));
        assert!(matches!(decode("[]").unwrap_err(), Error::Decode { .. }));
    }

    #[test]
    fn test_missing_name() {
        let err = decode(r#"{"type":"REQUEST","seq":1}"#).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_optional_fields_default() {
        let msg = decode(r#"{"type":"SYS_EVENT","name":"ping"}"#).expect("decode");
        assert_eq!(msg.seq(), Seq::default());
        assert_eq!(msg.ts(), 0);
        assert_eq!(msg.data(), &Value::Null);
    }
}
