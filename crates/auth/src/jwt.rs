//! JwtAuthenticator - HS256 bearer tokens

use crate::authenticator::Authenticator;
use crate::types::{bearer_token, fingerprint, AuthError};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{AuthMethod, Identity};
use tracing::debug;

/// Claims read from (and written to) a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Verification settings
#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: Vec<u8>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp`, in seconds
    pub leeway_secs: u64,
}

impl JwtSettings {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
            leeway_secs: 30,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }
}

/// Verifies HS256-signed JWTs; `sub` and `exp` are mandatory
pub struct JwtAuthenticator {
    settings: JwtSettings,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(settings: JwtSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = settings.leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &settings.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            decoding_key: DecodingKey::from_secret(&settings.secret),
            settings,
            validation,
        }
    }

    /// Sign a token for `sub` valid for `ttl_secs` (used by the CLI and tests)
    pub fn issue<I, S>(&self, sub: &str, roles: I, ttl_secs: i64) -> Result<String, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            sub: sub.to_string(),
            exp: now + ttl_secs,
            iat: Some(now),
            roles: roles.into_iter().map(Into::into).collect(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &JwtClaims) -> Result<String, AuthError> {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.settings.secret),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        let token = bearer_token(credential);
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }
        debug!(user = %claims.sub, roles = ?claims.roles, "jwt accepted");

        Ok(Identity::new(claims.sub, AuthMethod::Jwt)
            .with_roles(claims.roles)
            .with_fingerprint(fingerprint(token)))
    }

    fn name(&self) -> &str {
        "jwt"
    }
}
