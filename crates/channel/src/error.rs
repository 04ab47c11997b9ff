//! Channel error type

use shared::GatewayError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("channel is not secured")]
    NotSecured,

    #[error("channel closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ChannelError> for GatewayError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Handshake(m) | ChannelError::Protocol(m) => GatewayError::HandshakeFailed(m),
            ChannelError::Encryption(m) => GatewayError::EncryptionFailed(m),
            ChannelError::NotSecured => GatewayError::EncryptionFailed(err.to_string()),
            ChannelError::Decryption(m) => GatewayError::DecryptionFailed(m),
            ChannelError::Config(m) => GatewayError::Config(m),
            ChannelError::Closed { .. } | ChannelError::Transport(_) => {
                GatewayError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, err.to_string()))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
