//! Authenticator trait and composition

use crate::types::AuthError;
use async_trait::async_trait;
use shared::Identity;
use std::sync::Arc;
use tracing::debug;

/// Validates a bearer credential
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Tries each authenticator in order; the first success wins
#[derive(Default, Clone)]
pub struct ChainAuthenticator {
    links: Vec<Arc<dyn Authenticator>>,
}

impl ChainAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append an authenticator
    pub fn with(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.links.push(Arc::new(authenticator));
        self
    }

    pub fn push(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.links.push(authenticator);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[async_trait]
impl Authenticator for ChainAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let mut last = AuthError::InvalidCredential;
        for link in &self.links {
            match link.authenticate(credential).await {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    debug!(authenticator = link.name(), error = %e, "credential rejected");
                    // A malformed token says more than "unknown key"
                    if !matches!(e, AuthError::InvalidCredential) {
                        last = e;
                    }
                }
            }
        }
        Err(last)
    }

    fn name(&self) -> &str {
        "chain"
    }
}
