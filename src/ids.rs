use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mint a client id (`c` + UUIDv4).
pub fn generate_client_id() -> String {
    format!("c{}", Uuid::new_v4())
}

/// Mint a session id (`se` + UUIDv4).
pub fn generate_session_id() -> String {
    format!("se{}", Uuid::new_v4())
}

/// Mint a sub-session id (`ss` + UUIDv4).
pub fn generate_sub_session_id() -> String {
    format!("ss{}", Uuid::new_v4())
}

/// Mint a message id (`m` + UUIDv4).
pub fn generate_message_id() -> String {
    format!("m{}", Uuid::new_v4())
}

/// Mint an Engine.IO transport sid.
pub fn generate_transport_sid() -> String {
    Uuid::new_v4().to_string()
}

fn has_uuid_suffix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

pub fn is_valid_client_id(id: &str) -> bool {
    has_uuid_suffix(id, "c")
}

pub fn is_valid_session_id(id: &str) -> bool {
    has_uuid_suffix(id, "se")
}

pub fn is_valid_sub_session_id(id: &str) -> bool {
    has_uuid_suffix(id, "ss")
}

pub fn is_valid_message_id(id: &str) -> bool {
    has_uuid_suffix(id, "m")
}

/// Mint an opaque bearer token bound to a client id.
///
/// The token is never verified by this service; it exists so clients can
/// present a stable credential to collaborating services.
pub fn generate_token(client_id: &str) -> String {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(nonce.as_bytes());
    format!("ct{:x}", hasher.finalize())
}
