use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ChatError;

macro_rules! numeric_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn as_u8(self) -> u8 {
                self as u8
            }

            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u8(self.as_u8())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = u8::deserialize(deserializer)?;
                $name::from_u8(value).ok_or_else(|| {
                    D::Error::custom(format!(
                        concat!("invalid ", stringify!($name), " value: {}"),
                        value
                    ))
                })
            }
        }
    };
}

numeric_enum! {
    /// Message kind on the wire.
    MsgType {
        Msg = 1,
        Ntf = 2,
        Ack = 3,
    }
}

numeric_enum! {
    /// Content kind of a chat message.
    ContentType {
        Text = 1,
        Image = 2,
        File = 3,
    }
}

numeric_enum! {
    /// Delivery status of a stored message.
    MsgStatus {
        New = 1,
        History = 2,
        Offline = 3,
        Recall = 4,
        Sent = 5,
        Delivered = 6,
        Read = 7,
    }
}

impl MsgStatus {
    /// Whether the edge `self -> to` is on the delivery-status graph.
    ///
    /// Recall is reachable from anywhere (admin override) and terminal.
    pub fn can_transition_to(self, to: MsgStatus) -> bool {
        if to == MsgStatus::Recall {
            return self != MsgStatus::Recall;
        }
        matches!(
            (self, to),
            (MsgStatus::New, MsgStatus::Sent)
                | (MsgStatus::New, MsgStatus::Offline)
                | (MsgStatus::Sent, MsgStatus::Delivered)
                | (MsgStatus::Sent, MsgStatus::Offline)
                | (MsgStatus::Delivered, MsgStatus::Read)
                | (MsgStatus::Offline, MsgStatus::Delivered)
        )
    }
}

/// Unix-millisecond timestamp that marshals as a decimal string.
///
/// Peer SDKs send `ts` as either a string or a bare number; null and the
/// empty string both decode to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StringTimestamp(pub i64);

impl StringTimestamp {
    pub fn now() -> Self {
        StringTimestamp(Utc::now().timestamp_millis())
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for StringTimestamp {
    fn from(ms: i64) -> Self {
        StringTimestamp(ms)
    }
}

impl Serialize for StringTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for StringTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        match raw {
            None | Some(serde_json::Value::Null) => Ok(StringTimestamp(0)),
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .map(StringTimestamp)
                .ok_or_else(|| D::Error::custom("ts out of range")),
            Some(serde_json::Value::String(s)) => {
                if s.is_empty() {
                    return Ok(StringTimestamp(0));
                }
                s.parse::<i64>()
                    .map(StringTimestamp)
                    .map_err(|_| D::Error::custom("ts is not a base-10 integer"))
            }
            Some(other) => Err(D::Error::custom(format!(
                "ts must be a string or number, got {other}"
            ))),
        }
    }
}

/// The atomic unit of the message plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "subSessionId", default)]
    pub sub_session_id: String,
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "contentType", default = "default_content_type")]
    pub content_type: ContentType,
    #[serde(default)]
    pub ts: StringTimestamp,
    #[serde(default = "default_status")]
    pub status: MsgStatus,
    #[serde(default)]
    pub ext: HashMap<String, serde_json::Value>,
}

fn default_content_type() -> ContentType {
    ContentType::Text
}

fn default_status() -> MsgStatus {
    MsgStatus::New
}

impl Message {
    /// Validate the required fields of an inbound message.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.session_id.is_empty() {
            return Err(ChatError::InvalidParameter("sessionId is required".into()));
        }
        if self.msg_id.is_empty() {
            return Err(ChatError::InvalidParameter("msgId is required".into()));
        }
        if self.src.is_empty() || self.dst.is_empty() {
            return Err(ChatError::InvalidParameter("src and dst are required".into()));
        }
        if self.content.is_empty() && self.msg_type != MsgType::Ack {
            return Err(ChatError::InvalidParameter(
                "content is required for non-ack messages".into(),
            ));
        }
        Ok(())
    }
}

/// Tagged destination address: `U:`/`A:`/`S:`/`UA:` prefixes for direct
/// recipients, `room:` for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address<'a> {
    Direct(&'a str),
    Room(&'a str),
}

impl<'a> Address<'a> {
    /// Parse a wire destination into its bare recipient.
    ///
    /// Untagged destinations are treated as bare client ids.
    pub fn parse(dst: &'a str) -> Address<'a> {
        if let Some(room) = dst.strip_prefix("room:") {
            return Address::Room(room);
        }
        // "UA:" must be tried before "U:".
        for tag in ["UA:", "U:", "A:", "S:"] {
            if let Some(id) = dst.strip_prefix(tag) {
                return Address::Direct(id);
            }
        }
        Address::Direct(dst)
    }

    /// The bare recipient id for direct addresses.
    pub fn direct_id(&self) -> Option<&'a str> {
        match self {
            Address::Direct(id) => Some(id),
            Address::Room(_) => None,
        }
    }
}

/// A logical customer ↔ agent dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "subSessionId", default)]
    pub sub_session_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "agentId", default)]
    pub agent_id: String,
    pub status: SessionStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

/// A chat participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: UserRole,
    pub status: UserStatus,
    #[serde(rename = "lastActive")]
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Agent,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Customer => "customer",
            UserRole::Agent => "agent",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customer" => Some(UserRole::Customer),
            "agent" => Some(UserRole::Agent),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Busy,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::Busy => "busy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(UserStatus::Online),
            "offline" => Some(UserStatus::Offline),
            "busy" => Some(UserStatus::Busy),
            _ => None,
        }
    }
}

/// Generic `{code, msg, data}` envelope shared by the REST surface and
/// server-pushed error events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub msg: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn success(data: serde_json::Value) -> Self {
        Envelope {
            code: crate::error::codes::SUCCESS,
            msg: "success".into(),
            data,
        }
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Envelope {
            code,
            msg: msg.into(),
            data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_type: MsgType, content: &str) -> Message {
        Message {
            msg_type,
            session_id: "se-1".into(),
            sub_session_id: String::new(),
            msg_id: "m-1".into(),
            src: "U:c-a".into(),
            dst: "U:c-b".into(),
            content: content.into(),
            content_type: ContentType::Text,
            ts: StringTimestamp(0),
            status: MsgStatus::New,
            ext: HashMap::new(),
        }
    }

    #[test]
    fn string_timestamp_accepts_both_wire_forms() {
        let from_string: StringTimestamp = serde_json::from_str("\"1745690716604\"").unwrap();
        let from_number: StringTimestamp = serde_json::from_str("1745690716604").unwrap();
        assert_eq!(from_string, from_number);
        assert_eq!(from_string.0, 1745690716604);

        let empty: StringTimestamp = serde_json::from_str("\"\"").unwrap();
        assert_eq!(empty.0, 0);
        let null: StringTimestamp = serde_json::from_str("null").unwrap();
        assert_eq!(null.0, 0);
    }

    #[test]
    fn string_timestamp_marshals_as_string() {
        let encoded = serde_json::to_string(&StringTimestamp(1745690716604)).unwrap();
        assert_eq!(encoded, "\"1745690716604\"");
    }

    #[test]
    fn string_timestamp_rejects_garbage() {
        assert!(serde_json::from_str::<StringTimestamp>("\"abc\"").is_err());
        assert!(serde_json::from_str::<StringTimestamp>("true").is_err());
    }

    #[test]
    fn numeric_enums_use_wire_values() {
        assert_eq!(serde_json::to_value(MsgType::Ack).unwrap(), 3);
        assert_eq!(serde_json::to_value(MsgStatus::Offline).unwrap(), 3);
        assert_eq!(serde_json::to_value(ContentType::File).unwrap(), 3);
        let status: MsgStatus = serde_json::from_str("7").unwrap();
        assert_eq!(status, MsgStatus::Read);
        assert!(serde_json::from_str::<MsgStatus>("8").is_err());
        assert!(serde_json::from_str::<MsgType>("0").is_err());
    }

    #[test]
    fn status_graph_edges() {
        use MsgStatus::*;
        assert!(New.can_transition_to(Sent));
        assert!(New.can_transition_to(Offline));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Offline));
        assert!(Delivered.can_transition_to(Read));
        assert!(Offline.can_transition_to(Delivered));
        assert!(Read.can_transition_to(Recall));

        assert!(!Sent.can_transition_to(Read));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Offline.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Sent));
    }

    #[test]
    fn recall_is_reachable_from_anywhere_and_terminal() {
        use MsgStatus::*;
        for from in [New, History, Offline, Sent, Delivered, Read] {
            assert!(from.can_transition_to(Recall), "{from:?} -> Recall");
        }
        for to in [New, History, Offline, Sent, Delivered, Read, Recall] {
            assert!(!Recall.can_transition_to(to), "Recall -> {to:?}");
        }
    }

    #[test]
    fn validation_requires_core_fields() {
        assert!(message(MsgType::Msg, "hi").validate().is_ok());

        let mut m = message(MsgType::Msg, "hi");
        m.session_id.clear();
        assert!(m.validate().is_err());

        let mut m = message(MsgType::Msg, "hi");
        m.msg_id.clear();
        assert!(m.validate().is_err());

        let mut m = message(MsgType::Msg, "hi");
        m.dst.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn ack_may_have_empty_content() {
        assert!(message(MsgType::Ack, "").validate().is_ok());
        assert!(message(MsgType::Msg, "").validate().is_err());
        assert!(message(MsgType::Ntf, "").validate().is_err());
    }

    #[test]
    fn address_tags_strip() {
        assert_eq!(Address::parse("U:c-1"), Address::Direct("c-1"));
        assert_eq!(Address::parse("A:a-1"), Address::Direct("a-1"));
        assert_eq!(Address::parse("S:auto"), Address::Direct("auto"));
        assert_eq!(Address::parse("UA:admin"), Address::Direct("admin"));
        assert_eq!(Address::parse("room:lobby"), Address::Room("lobby"));
        assert_eq!(Address::parse("c-bare"), Address::Direct("c-bare"));
    }

    #[test]
    fn message_wire_shape() {
        let m = message(MsgType::Msg, "hello");
        let value = serde_json::to_value(&m).unwrap();
        let obj = value.as_object().unwrap();
        for field in [
            "msgType",
            "sessionId",
            "subSessionId",
            "msgId",
            "src",
            "dst",
            "content",
            "contentType",
            "ts",
            "status",
            "ext",
        ] {
            assert!(obj.contains_key(field), "missing {field}");
        }
        assert_eq!(obj["msgType"], 1);
        assert_eq!(obj["ts"], "0");

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.msg_id, "m-1");
        assert_eq!(back.msg_type, MsgType::Msg);
    }
}
