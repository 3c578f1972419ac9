//! Engine.IO v4 framing and Socket.IO v4 sub-framing over a text-frame
//! duplex channel.
//!
//! An Engine.IO packet is a single ASCII digit followed by the payload. A
//! Socket.IO sub-packet rides inside an Engine.IO MESSAGE packet as
//! `<subType>[namespace,]<body>`. Codec errors never terminate a connection
//! here; they are reported upward.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;

/// Heartbeat interval advertised in the handshake (ms).
pub const PING_INTERVAL_MS: u64 = 25_000;
/// Pong deadline advertised in the handshake (ms).
pub const PING_TIMEOUT_MS: u64 = 20_000;
/// Largest accepted payload advertised in the handshake (bytes).
pub const MAX_PAYLOAD: u64 = 1_000_000;

const ENGINE_OPEN: char = '0';
const ENGINE_CLOSE: char = '1';
const ENGINE_PING: char = '2';
const ENGINE_PONG: char = '3';
const ENGINE_MESSAGE: char = '4';
const ENGINE_UPGRADE: char = '5';
const ENGINE_NOOP: char = '6';

const SOCKET_CONNECT: char = '0';
const SOCKET_DISCONNECT: char = '1';
const SOCKET_EVENT: char = '2';
const SOCKET_ACK: char = '3';
const SOCKET_CONNECT_ERROR: char = '4';
const SOCKET_BINARY_EVENT: char = '5';
const SOCKET_BINARY_ACK: char = '6';

/// An Engine.IO v4 packet. The payload is carried verbatim so that
/// encode-then-decode is byte-exact for every type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(String),
    Close(String),
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade(String),
    Noop(String),
}

impl EnginePacket {
    pub fn parse(frame: &str) -> Result<EnginePacket, ChatError> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or(ChatError::MalformedPacket("empty engine.io packet"))?;
        let payload = chars.as_str().to_string();
        match kind {
            ENGINE_OPEN => Ok(EnginePacket::Open(payload)),
            ENGINE_CLOSE => Ok(EnginePacket::Close(payload)),
            ENGINE_PING => Ok(EnginePacket::Ping(payload)),
            ENGINE_PONG => Ok(EnginePacket::Pong(payload)),
            ENGINE_MESSAGE => Ok(EnginePacket::Message(payload)),
            ENGINE_UPGRADE => Ok(EnginePacket::Upgrade(payload)),
            ENGINE_NOOP => Ok(EnginePacket::Noop(payload)),
            _ => Err(ChatError::MalformedPacket("unknown engine.io packet type")),
        }
    }

    pub fn encode(&self) -> String {
        let (kind, payload) = match self {
            EnginePacket::Open(p) => (ENGINE_OPEN, p),
            EnginePacket::Close(p) => (ENGINE_CLOSE, p),
            EnginePacket::Ping(p) => (ENGINE_PING, p),
            EnginePacket::Pong(p) => (ENGINE_PONG, p),
            EnginePacket::Message(p) => (ENGINE_MESSAGE, p),
            EnginePacket::Upgrade(p) => (ENGINE_UPGRADE, p),
            EnginePacket::Noop(p) => (ENGINE_NOOP, p),
        };
        let mut out = String::with_capacity(1 + payload.len());
        out.push(kind);
        out.push_str(payload);
        out
    }
}

/// A Socket.IO v4 sub-packet, decoded out of an Engine.IO MESSAGE payload.
///
/// Binary variants are recognised so the transport can log and skip them;
/// their attachments are not reassembled.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect { payload: Value },
    Disconnect,
    Event { event: String, args: Vec<Value>, ack_id: Option<u64> },
    Ack { ack_id: Option<u64>, args: Vec<Value> },
    ConnectError { payload: Value },
    BinaryEvent,
    BinaryAck,
}

impl SocketPacket {
    /// Parse the payload of an Engine.IO MESSAGE packet.
    ///
    /// Only the default namespace `/` is served; an explicit namespace is
    /// accepted when it is `/` and rejected otherwise.
    pub fn parse(payload: &str) -> Result<SocketPacket, ChatError> {
        let mut chars = payload.chars();
        let kind = chars
            .next()
            .ok_or(ChatError::MalformedPacket("empty socket.io sub-packet"))?;
        let mut body = chars.as_str();

        // A namespace is present only when the body opens with '/'. The
        // trailing comma is part of the namespace production.
        if body.starts_with('/') {
            let Some((namespace, rest)) = body.split_once(',') else {
                return Err(ChatError::BadSocketIoSubpacket(
                    "unterminated namespace".into(),
                ));
            };
            if namespace != "/" {
                return Err(ChatError::UnknownNamespace(namespace.to_string()));
            }
            body = rest;
        }

        match kind {
            SOCKET_CONNECT => Ok(SocketPacket::Connect {
                payload: parse_optional_json(body)?,
            }),
            SOCKET_DISCONNECT => Ok(SocketPacket::Disconnect),
            SOCKET_EVENT => {
                let (mut args, ack_id) = parse_event_array(body)?;
                if args.is_empty() {
                    return Err(ChatError::BadSocketIoSubpacket(
                        "event array is empty".into(),
                    ));
                }
                let event = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(ChatError::BadSocketIoSubpacket(format!(
                            "event name must be a string, got {other}"
                        )))
                    }
                };
                Ok(SocketPacket::Event { event, args, ack_id })
            }
            SOCKET_ACK => {
                let (args, ack_id) = parse_event_array(body)?;
                Ok(SocketPacket::Ack { ack_id, args })
            }
            SOCKET_CONNECT_ERROR => Ok(SocketPacket::ConnectError {
                payload: parse_optional_json(body)?,
            }),
            SOCKET_BINARY_EVENT => Ok(SocketPacket::BinaryEvent),
            SOCKET_BINARY_ACK => Ok(SocketPacket::BinaryAck),
            _ => Err(ChatError::MalformedPacket("unknown socket.io packet type")),
        }
    }

    /// Encode into the payload of an Engine.IO MESSAGE packet. The default
    /// namespace is omitted along with its trailing comma.
    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect { payload } => format!("{SOCKET_CONNECT}{payload}"),
            SocketPacket::Disconnect => SOCKET_DISCONNECT.to_string(),
            SocketPacket::Event { event, args, ack_id } => {
                let mut array = Vec::with_capacity(args.len() + 2);
                array.push(Value::String(event.clone()));
                array.extend(args.iter().cloned());
                if let Some(id) = ack_id {
                    array.push(Value::from(*id));
                }
                format!("{SOCKET_EVENT}{}", Value::Array(array))
            }
            SocketPacket::Ack { ack_id, args } => {
                let mut array: Vec<Value> = args.clone();
                if let Some(id) = ack_id {
                    array.push(Value::from(*id));
                }
                format!("{SOCKET_ACK}{}", Value::Array(array))
            }
            SocketPacket::ConnectError { payload } => {
                format!("{SOCKET_CONNECT_ERROR}{payload}")
            }
            SocketPacket::BinaryEvent => SOCKET_BINARY_EVENT.to_string(),
            SocketPacket::BinaryAck => SOCKET_BINARY_ACK.to_string(),
        }
    }
}

fn parse_optional_json(body: &str) -> Result<Value, ChatError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|e| ChatError::BadSocketIoSubpacket(e.to_string()))
}

/// Parse an EVENT/ACK body: a JSON array whose trailing numeric element, if
/// any, is the transport ack id and is peeled off.
fn parse_event_array(body: &str) -> Result<(Vec<Value>, Option<u64>), ChatError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ChatError::BadSocketIoSubpacket(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(ChatError::BadSocketIoSubpacket(
            "event body is not a JSON array".into(),
        ));
    };

    let ack_id = match items.last() {
        Some(Value::Number(n)) if items.len() > 1 => n.as_u64(),
        _ => None,
    };
    if ack_id.is_some() {
        items.pop();
    }
    Ok((items, ack_id))
}

/// Handshake payload advertised on both the polling and duplex paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPayload {
    pub sid: String,
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
    #[serde(rename = "maxPayload")]
    pub max_payload: u64,
}

impl OpenPayload {
    pub fn new(sid: String) -> Self {
        OpenPayload {
            sid,
            upgrades: vec!["websocket".to_string()],
            ping_interval: PING_INTERVAL_MS,
            ping_timeout: PING_TIMEOUT_MS,
            max_payload: MAX_PAYLOAD,
        }
    }
}

/// Build the polling handshake body: an Engine.IO OPEN packet.
pub fn encode_polling_handshake(sid: String) -> String {
    let payload = serde_json::to_string(&OpenPayload::new(sid)).unwrap_or_default();
    EnginePacket::Open(payload).encode()
}

/// Build the first duplex frame: the OPEN payload wrapped in an Engine.IO
/// MESSAGE packet, as Socket.IO clients expect after an upgrade.
pub fn encode_duplex_open(sid: String) -> String {
    let payload = serde_json::to_string(&OpenPayload::new(sid)).unwrap_or_default();
    EnginePacket::Message(payload).encode()
}

/// Build a CONNECT ack frame carrying the namespace sid.
pub fn encode_connect_ack(sid: &str) -> String {
    let packet = SocketPacket::Connect {
        payload: serde_json::json!({ "sid": sid }),
    };
    EnginePacket::Message(packet.encode()).encode()
}

/// Build a server-originated EVENT frame.
pub fn encode_event(event: &str, data: Value) -> String {
    let packet = SocketPacket::Event {
        event: event.to_string(),
        args: vec![data],
        ack_id: None,
    };
    EnginePacket::Message(packet.encode()).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_packets_roundtrip_byte_exact() {
        let frames = [
            "0{\"sid\":\"abc\"}",
            "1",
            "2",
            "2probe",
            "3",
            "3probe",
            "4hello",
            "5",
            "6",
        ];
        for frame in frames {
            let packet = EnginePacket::parse(frame).unwrap();
            assert_eq!(packet.encode(), frame);
        }
    }

    #[test]
    fn engine_parse_rejects_garbage() {
        assert!(matches!(
            EnginePacket::parse(""),
            Err(ChatError::MalformedPacket(_))
        ));
        assert!(matches!(
            EnginePacket::parse("9oops"),
            Err(ChatError::MalformedPacket(_))
        ));
        assert!(matches!(
            EnginePacket::parse("x"),
            Err(ChatError::MalformedPacket(_))
        ));
    }

    #[test]
    fn event_with_trailing_ack_id_roundtrips() {
        let packet = SocketPacket::Event {
            event: "message".into(),
            args: vec![json!({"content": "hi"})],
            ack_id: Some(17),
        };
        let encoded = packet.encode();
        assert!(encoded.ends_with(",17]"));

        let decoded = SocketPacket::parse(&encoded).unwrap();
        let SocketPacket::Event { event, args, ack_id } = decoded else {
            panic!("expected event");
        };
        assert_eq!(event, "message");
        assert_eq!(args, vec![json!({"content": "hi"})]);
        assert_eq!(ack_id, Some(17));
    }

    #[test]
    fn event_without_ack_id() {
        let decoded = SocketPacket::parse("2[\"message\",{\"a\":1}]").unwrap();
        let SocketPacket::Event { event, args, ack_id } = decoded else {
            panic!("expected event");
        };
        assert_eq!(event, "message");
        assert_eq!(args, vec![json!({"a": 1})]);
        assert_eq!(ack_id, None);
    }

    #[test]
    fn lone_numeric_event_name_is_not_an_ack_id() {
        // ["ping"] has one element; a single trailing number is the whole
        // body, not an ack id.
        let err = SocketPacket::parse("2[42]").unwrap_err();
        assert!(matches!(err, ChatError::BadSocketIoSubpacket(_)));
    }

    #[test]
    fn numeric_event_payload_survives() {
        // A numeric last argument is peeled as the ack id only when it is
        // the trailing element; the event name keeps its position.
        let decoded = SocketPacket::parse("2[\"count\",3,7]").unwrap();
        let SocketPacket::Event { args, ack_id, .. } = decoded else {
            panic!("expected event");
        };
        assert_eq!(args, vec![json!(3)]);
        assert_eq!(ack_id, Some(7));
    }

    #[test]
    fn default_namespace_forms() {
        let bare = SocketPacket::parse("0").unwrap();
        assert_eq!(bare, SocketPacket::Connect { payload: Value::Null });

        let explicit = SocketPacket::parse("0/,{\"token\":\"t\"}").unwrap();
        assert_eq!(
            explicit,
            SocketPacket::Connect {
                payload: json!({"token": "t"})
            }
        );
    }

    #[test]
    fn non_default_namespace_rejected() {
        let err = SocketPacket::parse("2/admin,[\"message\",{}]").unwrap_err();
        assert!(matches!(err, ChatError::UnknownNamespace(ns) if ns == "/admin"));
    }

    #[test]
    fn bad_event_bodies_rejected() {
        assert!(matches!(
            SocketPacket::parse("2{\"not\":\"array\"}"),
            Err(ChatError::BadSocketIoSubpacket(_))
        ));
        assert!(matches!(
            SocketPacket::parse("2[\"message\""),
            Err(ChatError::BadSocketIoSubpacket(_))
        ));
        assert!(matches!(
            SocketPacket::parse(""),
            Err(ChatError::MalformedPacket(_))
        ));
    }

    #[test]
    fn handshake_payload_shape() {
        let body = encode_polling_handshake("sid-1".into());
        assert!(body.starts_with('0'));
        let payload: OpenPayload = serde_json::from_str(&body[1..]).unwrap();
        assert_eq!(payload.sid, "sid-1");
        assert_eq!(payload.upgrades, vec!["websocket"]);
        assert_eq!(payload.ping_interval, 25_000);
        assert_eq!(payload.ping_timeout, 20_000);
        assert_eq!(payload.max_payload, 1_000_000);
    }

    #[test]
    fn duplex_open_is_message_wrapped() {
        let frame = encode_duplex_open("sid-2".into());
        assert!(frame.starts_with('4'));
        let payload: OpenPayload = serde_json::from_str(&frame[1..]).unwrap();
        assert_eq!(payload.sid, "sid-2");
    }

    #[test]
    fn connect_ack_carries_sid() {
        let frame = encode_connect_ack("sid-3");
        assert!(frame.starts_with("40"));
        let packet = SocketPacket::parse(&frame[1..]).unwrap();
        let SocketPacket::Connect { payload } = packet else {
            panic!("expected connect");
        };
        assert_eq!(payload, json!({"sid": "sid-3"}));
    }

    #[test]
    fn event_frame_builder() {
        let frame = encode_event("message", json!({"msgId": "m-1"}));
        let engine = EnginePacket::parse(&frame).unwrap();
        let EnginePacket::Message(payload) = engine else {
            panic!("expected message");
        };
        let socket = SocketPacket::parse(&payload).unwrap();
        let SocketPacket::Event { event, args, ack_id } = socket else {
            panic!("expected event");
        };
        assert_eq!(event, "message");
        assert_eq!(args, vec![json!({"msgId": "m-1"})]);
        assert_eq!(ack_id, None);
    }
}
