use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Sender label reserved for messages the room itself originates.
pub const SYSTEM_NAME: &str = "System";

pub const WELCOME_TEXT: &str = "Welcome to the Live Room! You are now connected.";

/// The conventional chat shape. The relay never requires it: anything that
/// parses as JSON is forwarded, extra fields included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn welcome() -> Self {
        Self::new(SYSTEM_NAME, WELCOME_TEXT)
    }
}

/// The frame greeting each new connection, sent to that connection only.
pub fn welcome_frame() -> String {
    serde_json::json!({ "name": SYSTEM_NAME, "text": WELCOME_TEXT }).to_string()
}

/// Checks that a raw inbound payload is one well-formed JSON value. This is
/// the only check the relay applies before forwarding; the original text is
/// kept so numbers and strings reach other participants exactly as sent.
pub fn decode(payload: &[u8]) -> Result<Box<RawValue>, serde_json::Error> {
    serde_json::from_slice(payload)
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
