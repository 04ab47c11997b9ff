//! # Toolgate Channel
//!
//! End-to-end encrypted message channel with key rotation.
//!
//! - [`SecureSession`]: handshake and key schedule, no I/O
//! - [`EncryptedChannel`]: drives a session over any [`Transport`]
//! - [`memory_pair`]: in-process transport for tests and demos

mod crypto;
mod encrypted_channel;
mod error;
mod metrics;
mod reconnect;
mod session;
mod transport;
mod wire;

pub use crypto::{derive_key, KeyRing, SessionKey, KEY_LEN, NONCE_LEN};
pub use encrypted_channel::{ChannelEvent, ChannelState, EncryptedChannel};
pub use error::{ChannelError, Result};
pub use metrics::{EncryptionMetrics, MetricsSnapshot, LATENCY_WINDOW};
pub use reconnect::Backoff;
pub use session::{HandshakeState, Role, SecureSession, SessionInfo};
pub use transport::{close_code, is_clean_close, memory_pair, Connector, Frame, MemoryTransport, Transport};
pub use wire::{CloseMessage, DataMessage, Envelope, HandshakeMessage, KeyRotation};
