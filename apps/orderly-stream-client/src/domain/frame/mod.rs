//! Wire Frames
//!
//! Classification of decoded inbound frames and the outbound frame set.
//!
//! Inbound frames carry no single discriminator field. Their kind is derived
//! from shape:
//!
//! | Shape                                              | Kind           |
//! |----------------------------------------------------|----------------|
//! | `event` is `ping` / `pong`                         | `Ping`/`Pong`  |
//! | `event` present, `success` false or missing        | `Error`        |
//! | `event: "request"`, `success: true`, `data.symbol` | `RequestAck`   |
//! | `event: "auth"`, `success: true`                   | `AuthAck`      |
//! | `event: "subscribe"`, `success: true`              | `SubscribeAck` |
//! | other `event` with `success: true`                 | `Ack`          |
//! | no `event`, both `topic` and `data`                | `DataEvent`    |
//! | anything else                                      | `Ignored`      |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Control event name for a server keepalive.
pub const EVENT_PING: &str = "ping";
/// Control event name for a keepalive answer.
pub const EVENT_PONG: &str = "pong";

/// Build the synthesized topic an orderbook snapshot for `symbol` is queued under.
#[must_use]
pub fn orderbook_topic(symbol: &str) -> String {
    format!("{symbol}@orderbook")
}

// =============================================================================
// Inbound
// =============================================================================

/// A control acknowledgement that reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    /// The event the server rejected (`subscribe`, `auth`, ...).
    pub event: String,
    /// Server-provided reason, if any.
    pub message: Option<String>,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} rejected: {msg}", self.event),
            None => write!(f, "{} rejected", self.event),
        }
    }
}

/// A decoded inbound frame, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Server keepalive; must be answered with a pong.
    Ping,
    /// Server answer to a keepalive.
    Pong,
    /// Successful authentication.
    AuthAck,
    /// Successful subscription.
    SubscribeAck,
    /// Any other successful control acknowledgement.
    Ack {
        /// Acknowledged event name.
        event: String,
    },
    /// Snapshot answering a `request`, routed to a synthesized topic.
    RequestAck {
        /// Derived topic, e.g. `BTC@orderbook`.
        topic: String,
        /// Payload with the frame timestamp merged in as `ts`.
        data: Value,
    },
    /// Data pushed on a subscribed topic.
    DataEvent {
        /// Topic the data belongs to.
        topic: String,
        /// Opaque payload.
        data: Value,
    },
    /// Control acknowledgement with `success: false`.
    Error(ProtocolViolation),
    /// Unrecognized chatter.
    Ignored,
}

impl InboundFrame {
    /// Classify a decoded frame by its shape.
    #[must_use]
    pub fn classify(frame: Value) -> Self {
        let Value::Object(mut obj) = frame else {
            return Self::Ignored;
        };

        let Some(event) = obj.get("event").and_then(Value::as_str).map(str::to_owned) else {
            return Self::classify_data(obj);
        };

        match event.as_str() {
            EVENT_PING => return Self::Ping,
            EVENT_PONG => return Self::Pong,
            _ => {}
        }

        let success = obj.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !success {
            let message = obj
                .get("errorMsg")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Self::Error(ProtocolViolation { event, message });
        }

        match event.as_str() {
            "request" => Self::classify_request_ack(&mut obj).unwrap_or(Self::Ack { event }),
            "auth" => Self::AuthAck,
            "subscribe" => Self::SubscribeAck,
            _ => Self::Ack { event },
        }
    }

    fn classify_data(mut obj: Map<String, Value>) -> Self {
        let topic = obj.get("topic").and_then(Value::as_str).map(str::to_owned);
        match (topic, obj.remove("data")) {
            (Some(topic), Some(data)) => Self::DataEvent { topic, data },
            _ => Self::Ignored,
        }
    }

    fn classify_request_ack(obj: &mut Map<String, Value>) -> Option<Self> {
        let ts = obj.get("ts").cloned();
        let Some(Value::Object(mut data)) = obj.remove("data") else {
            return None;
        };
        let topic = orderbook_topic(data.get("symbol")?.as_str()?);
        if let Some(ts) = ts {
            data.insert("ts".to_owned(), ts);
        }
        Some(Self::RequestAck {
            topic,
            data: Value::Object(data),
        })
    }

    /// Get the kind name used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::AuthAck => "auth_ack",
            Self::SubscribeAck => "subscribe_ack",
            Self::Ack { .. } => "ack",
            Self::RequestAck { .. } => "request_ack",
            Self::DataEvent { .. } => "data",
            Self::Error(_) => "error",
            Self::Ignored => "ignored",
        }
    }
}

/// Check whether a decoded frame is a ping control event.
#[must_use]
pub fn is_ping(frame: &Value) -> bool {
    frame.get("event").and_then(Value::as_str) == Some(EVENT_PING)
}

// =============================================================================
// Outbound
// =============================================================================

/// Parameters of a snapshot request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Request kind; only `orderbook` is issued.
    #[serde(rename = "type")]
    pub kind: String,
    /// Instrument symbol.
    pub symbol: String,
}

/// Parameters of an authentication frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    /// Public key identifier, `ed25519:<key>`.
    pub orderly_key: String,
    /// Base64 signature over the timestamp.
    pub sign: String,
    /// Millisecond epoch timestamp as a decimal string.
    pub timestamp: String,
}

/// A frame sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Start receiving a topic.
    Subscribe {
        /// Client id.
        id: String,
        /// Topic name.
        topic: String,
    },
    /// Stop receiving a topic.
    Unsubscribe {
        /// Client id.
        id: String,
        /// Topic name.
        topic: String,
    },
    /// One-shot snapshot request.
    Request {
        /// Client id.
        id: String,
        /// Request parameters.
        params: RequestParams,
    },
    /// Authenticate a private connection.
    Auth {
        /// Client id.
        id: String,
        /// Signed credentials.
        params: AuthParams,
    },
    /// Keepalive answer.
    Pong,
}

impl OutboundFrame {
    /// Build a subscribe frame.
    #[must_use]
    pub fn subscribe(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Subscribe {
            id: id.into(),
            topic: topic.into(),
        }
    }

    /// Build an unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            id: id.into(),
            topic: topic.into(),
        }
    }

    /// Build an orderbook snapshot request.
    #[must_use]
    pub fn orderbook_request(id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self::Request {
            id: id.into(),
            params: RequestParams {
                kind: "orderbook".to_owned(),
                symbol: symbol.into(),
            },
        }
    }

    /// Get the event name this frame is sent under.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Request { .. } => "request",
            Self::Auth { .. } => "auth",
            Self::Pong => EVENT_PONG,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn data_event_routes_by_topic() {
        let frame = InboundFrame::classify(json!({"topic": "bbos", "data": {"price": 1}}));
        assert_eq!(
            frame,
            InboundFrame::DataEvent {
                topic: "bbos".to_owned(),
                data: json!({"price": 1}),
            }
        );
    }

    #[test]
    fn request_ack_derives_orderbook_topic_and_merges_ts() {
        let frame = InboundFrame::classify(json!({
            "event": "request",
            "success": true,
            "data": {"symbol": "BTC", "x": 1},
            "ts": 5
        }));
        assert_eq!(
            frame,
            InboundFrame::RequestAck {
                topic: "BTC@orderbook".to_owned(),
                data: json!({"symbol": "BTC", "x": 1, "ts": 5}),
            }
        );
    }

    #[test]
    fn request_ack_without_symbol_is_plain_ack() {
        let frame = InboundFrame::classify(json!({
            "event": "request",
            "success": true,
            "data": {"x": 1}
        }));
        assert_eq!(
            frame,
            InboundFrame::Ack {
                event: "request".to_owned()
            }
        );
    }

    #[test]
    fn rejected_ack_is_protocol_violation() {
        let frame = InboundFrame::classify(json!({
            "id": "WS_PUBLIC",
            "event": "subscribe",
            "success": false,
            "errorMsg": "invalid topic"
        }));
        assert_eq!(
            frame,
            InboundFrame::Error(ProtocolViolation {
                event: "subscribe".to_owned(),
                message: Some("invalid topic".to_owned()),
            })
        );
    }

    #[test]
    fn missing_success_counts_as_failure() {
        let frame = InboundFrame::classify(json!({"event": "auth"}));
        assert!(matches!(frame, InboundFrame::Error(v) if v.event == "auth" && v.message.is_none()));
    }

    #[test_case(json!({"event": "ping", "ts": 1}), "ping" ; "ping")]
    #[test_case(json!({"event": "pong"}), "pong" ; "pong")]
    #[test_case(json!({"event": "auth", "success": true}), "auth_ack" ; "auth ack")]
    #[test_case(json!({"event": "subscribe", "success": true, "ts": 1}), "subscribe_ack" ; "subscribe ack")]
    #[test_case(json!({"event": "unsubscribe", "success": true}), "ack" ; "other ack")]
    #[test_case(json!({"topic": "bbos"}), "ignored" ; "topic without data")]
    #[test_case(json!({"data": {}}), "ignored" ; "data without topic")]
    #[test_case(json!([1, 2, 3]), "ignored" ; "not an object")]
    fn classification_kinds(frame: Value, expected: &str) {
        assert_eq!(InboundFrame::classify(frame).kind(), expected);
    }

    #[test]
    fn ping_detection() {
        assert!(is_ping(&json!({"event": "ping"})));
        assert!(!is_ping(&json!({"event": "pong"})));
        assert!(!is_ping(&json!({"topic": "ping", "data": {}})));
    }

    #[test]
    fn outbound_subscribe_shape() {
        let frame = OutboundFrame::subscribe("WS_PUBLIC", "bbos");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": "WS_PUBLIC", "event": "subscribe", "topic": "bbos"})
        );
    }

    #[test]
    fn outbound_unsubscribe_shape() {
        let frame = OutboundFrame::unsubscribe("WS_PUBLIC", "bbos");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": "WS_PUBLIC", "event": "unsubscribe", "topic": "bbos"})
        );
    }

    #[test]
    fn outbound_request_shape() {
        let frame = OutboundFrame::orderbook_request("WS_PUBLIC", "PERP_BTC_USDC");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "id": "WS_PUBLIC",
                "event": "request",
                "params": {"type": "orderbook", "symbol": "PERP_BTC_USDC"}
            })
        );
    }

    #[test]
    fn outbound_pong_shape() {
        assert_eq!(
            serde_json::to_value(&OutboundFrame::Pong).unwrap(),
            json!({"event": "pong"})
        );
        assert_eq!(OutboundFrame::Pong.event(), "pong");
    }
}
