//! ApiKeyAuthenticator - Static API keys
//!
//! Keys are held only as SHA-256 digests and compared in constant time.

use crate::authenticator::Authenticator;
use crate::types::{bearer_token, credential_digest, fingerprint, AuthError};
use async_trait::async_trait;
use shared::{AuthMethod, Identity};
use subtle::ConstantTimeEq;
use tracing::debug;

struct KeyEntry {
    digest: [u8; 32],
    user_id: String,
    roles: Vec<String>,
}

/// Authenticates callers by a pre-shared API key
#[derive(Default)]
pub struct ApiKeyAuthenticator {
    keys: Vec<KeyEntry>,
}

impl ApiKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: accept `key` as `user_id` holding `roles`
    pub fn with_key<I, S>(mut self, key: &str, user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_key(key, user_id, roles);
        self
    }

    pub fn add_key<I, S>(&mut self, key: &str, user_id: impl Into<String>, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.push(KeyEntry {
            digest: credential_digest(key),
            user_id: user_id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        let key = bearer_token(credential);
        if key.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let digest = credential_digest(key);
        // Scan every entry so timing does not reveal which one matched
        let mut found: Option<&KeyEntry> = None;
        for entry in &self.keys {
            if bool::from(entry.digest[..].ct_eq(&digest[..])) {
                found = Some(entry);
            }
        }

        let entry = found.ok_or(AuthError::InvalidCredential)?;
        let fp = fingerprint(key);
        debug!(user = %entry.user_id, fingerprint = %fp, "api key accepted");

        Ok(Identity::new(entry.user_id.clone(), AuthMethod::ApiKey)
            .with_roles(entry.roles.iter().cloned())
            .with_fingerprint(fp))
    }

    fn name(&self) -> &str {
        "api-key"
    }
}
