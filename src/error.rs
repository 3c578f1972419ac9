use thiserror::Error;

/// Service-wide error taxonomy.
///
/// The dispatcher returns these to its caller verbatim; the transport layer
/// converts protocol-level variants into an `"error"` event and keeps the
/// connection open; the REST layer maps them onto the response envelope.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: u8, to: u8 },

    #[error("user {0} not connected")]
    UserNotConnected(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("bad socket.io sub-packet: {0}")]
    BadSocketIoSubpacket(String),

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ChatError {
    /// Envelope code for the REST surface.
    pub fn envelope_code(&self) -> i64 {
        match self {
            ChatError::InvalidParameter(_)
            | ChatError::MalformedPacket(_)
            | ChatError::BadSocketIoSubpacket(_)
            | ChatError::UnknownNamespace(_) => codes::PARAM_INVALID,
            ChatError::NotFound(_)
            | ChatError::SessionNotFound(_)
            | ChatError::InvalidTransition { .. }
            | ChatError::UserNotConnected(_) => codes::PARAM_INVALID,
            ChatError::Persistence(_) | ChatError::Cancelled => codes::SYSTEM_ERROR,
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".into()),
            other => ChatError::Persistence(other.to_string()),
        }
    }
}

/// Wire-visible envelope codes.
pub mod codes {
    pub const SUCCESS: i64 = 200;
    pub const CLIENT_ERROR: i64 = 400;
    pub const PARAM_INVALID: i64 = 40010010000;
    pub const PARAM_USER_ID_MISSING: i64 = 40010010001;
    pub const SYSTEM_ERROR: i64 = 50010010000;
    pub const USER_INIT_FAILED: i64 = 50010010001;
    pub const SESSION_CREATE_FAILED: i64 = 50010010002;
    pub const TOKEN_GENERATE_FAILED: i64 = 50010010003;
}
