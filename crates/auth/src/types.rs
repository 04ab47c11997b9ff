//! Auth types

use sha2::{Digest, Sha256};
use shared::{ClientKeyMode, GatewayError, Identity};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a credential was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential expired")]
    Expired,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::AuthenticationFailed {
            reason: err.to_string(),
        }
    }
}

/// Strip an optional `Bearer ` scheme prefix and surrounding whitespace
pub fn bearer_token(credential: &str) -> &str {
    let trimmed = credential.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// SHA-256 digest of a credential
pub fn credential_digest(credential: &str) -> [u8; 32] {
    Sha256::digest(credential.as_bytes()).into()
}

/// Short, non-reversible identifier of a credential, safe to log
pub fn fingerprint(credential: &str) -> String {
    credential_digest(credential)[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

type KeyFn = dyn Fn(&Identity, Option<&str>) -> String + Send + Sync;

/// Derives the client key the rate limiter buckets on
#[derive(Clone, Default)]
pub enum ClientKeyStrategy {
    #[default]
    UserId,
    /// Credential fingerprint; falls back to the user id
    Credential,
    /// Remote address; falls back to the user id
    RemoteAddr,
    Custom(Arc<KeyFn>),
}

impl ClientKeyStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Identity, Option<&str>) -> String + Send + Sync + 'static,
    {
        ClientKeyStrategy::Custom(Arc::new(f))
    }

    pub fn client_key(&self, identity: &Identity, remote_addr: Option<&str>) -> String {
        match self {
            ClientKeyStrategy::UserId => identity.user_id.clone(),
            ClientKeyStrategy::Credential => identity
                .credential_fingerprint
                .clone()
                .unwrap_or_else(|| identity.user_id.clone()),
            ClientKeyStrategy::RemoteAddr => remote_addr
                .map(str::to_string)
                .unwrap_or_else(|| identity.user_id.clone()),
            ClientKeyStrategy::Custom(f) => f(identity, remote_addr),
        }
    }
}

impl From<ClientKeyMode> for ClientKeyStrategy {
    fn from(mode: ClientKeyMode) -> Self {
        match mode {
            ClientKeyMode::UserId => ClientKeyStrategy::UserId,
            ClientKeyMode::Credential => ClientKeyStrategy::Credential,
            ClientKeyMode::RemoteAddr => ClientKeyStrategy::RemoteAddr,
        }
    }
}

impl fmt::Debug for ClientKeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKeyStrategy::UserId => f.write_str("UserId"),
            ClientKeyStrategy::Credential => f.write_str("Credential"),
            ClientKeyStrategy::RemoteAddr => f.write_str("RemoteAddr"),
            ClientKeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
