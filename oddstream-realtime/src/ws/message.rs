//! WebSocket message types and the outbound envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message destined for subscribers of a channel.
///
/// The payload is carried as opaque bytes; it is only inspected once, when
/// the outbound envelope is encoded.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    /// Channel name (equals the upstream topic name)
    pub channel: String,
    /// Raw payload bytes as received from the bus
    pub payload: Vec<u8>,
    /// Source timestamp
    pub timestamp: DateTime<Utc>,
}

/// Control messages sent by clients over the data channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to the listed channels
    Subscribe {
        /// Channel names; blank entries are ignored
        #[serde(default)]
        channels: Vec<String>,
    },
    /// Unsubscribe from the listed channels
    Unsubscribe {
        /// Channel names; blank entries are ignored
        #[serde(default)]
        channels: Vec<String>,
    },
    /// Application-level ping; answered with a transport pong frame
    Ping,
    /// Any other message type; logged and ignored
    #[serde(other)]
    Unknown,
}

#[derive(Serialize)]
struct Envelope<'a> {
    channel: &'a str,
    payload: Value,
    received_at: i64,
}

/// Encodes the single outbound envelope for a broadcast.
///
/// The payload is embedded as a structured JSON value when the raw bytes
/// parse as JSON, otherwise as a JSON string of those bytes. An empty
/// payload becomes `null`.
pub(crate) fn encode_outbound(msg: &BroadcastMessage) -> Result<String, serde_json::Error> {
    let payload = if msg.payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&msg.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&msg.payload).into_owned()))
    };

    serde_json::to_string(&Envelope {
        channel: &msg.channel,
        payload,
        received_at: msg.timestamp.timestamp_nanos_opt().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(payload: &[u8]) -> BroadcastMessage {
        BroadcastMessage {
            channel: "lines".to_string(),
            payload: payload.to_vec(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 500).unwrap(),
        }
    }

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channels":["lines","analytics"]}"#)
                .unwrap();

        if let ClientMessage::Subscribe { channels } = msg {
            assert_eq!(channels, vec!["lines", "analytics"]);
        } else {
            panic!("wrong message type");
        }
    }

    #[test]
    fn test_parse_ping() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"auth","token":"x"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn test_subscribe_without_channels() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        if let ClientMessage::Subscribe { channels } = msg {
            assert!(channels.is_empty());
        } else {
            panic!("wrong message type");
        }
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_encode_json_payload_is_embedded() {
        let encoded = encode_outbound(&message(br#"{"a":1}"#)).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["channel"], "lines");
        assert_eq!(value["payload"]["a"], 1);
        assert_eq!(value["received_at"], 1_700_000_000_000_000_500_i64);
    }

    #[test]
    fn test_encode_non_json_payload_is_a_string() {
        let encoded = encode_outbound(&message(b"hello")).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["payload"], "hello");
    }

    #[test]
    fn test_encode_empty_payload_is_null() {
        let encoded = encode_outbound(&message(b"")).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert!(value["payload"].is_null());
    }
}
