//! Wire envelopes
//!
//! Control messages travel as JSON text frames tagged by `type`.
//! Encrypted payloads are `[12-byte nonce][ciphertext]`, sent either raw in a
//! binary frame or base64-encoded inside a `data` envelope.

use crate::error::{ChannelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    pub session_id: String,
    pub algorithm: String,
    pub key_id: String,
    pub timestamp: DateTime<Utc>,
    /// Base64 X25519 public key, present with forward secrecy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    /// Base64 session id sealed under the new key (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    pub session_id: String,
    pub key_id: String,
    /// Base64 HKDF salt
    pub salt: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    /// Key that was current on the sending side when it rotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces_key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    pub key_id: String,
    /// Base64 of `[nonce][ciphertext]`
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub code: u16,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    HandshakeInit(HandshakeMessage),
    HandshakeResponse(HandshakeMessage),
    KeyRotation(KeyRotation),
    Data(DataMessage),
    Close(CloseMessage),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::HandshakeInit(_) => "handshake-init",
            Envelope::HandshakeResponse(_) => "handshake-response",
            Envelope::KeyRotation(_) => "key-rotation",
            Envelope::Data(_) => "data",
            Envelope::Close(_) => "close",
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ChannelError::Protocol(format!("malformed envelope: {e}")))
    }
}
