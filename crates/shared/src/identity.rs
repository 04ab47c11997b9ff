//! Authenticated caller identity

use serde::{Deserialize, Serialize};

/// How a caller proved who they are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Custom,
}

/// Result of a successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub method: AuthMethod,
    /// Stable, non-reversible fingerprint of the presented credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_fingerprint: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
            method,
            credential_fingerprint: None,
        }
    }

    /// Builder: set roles
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set credential fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.credential_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True if any of `roles` is held by this identity
    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(r.as_ref()))
    }
}
