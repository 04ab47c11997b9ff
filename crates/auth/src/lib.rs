//! # Toolgate Auth
//!
//! Turns an opaque bearer credential into an [`shared::Identity`].
//!
//! Authenticators are pluggable: API keys, HS256 JWTs, or a chain of both.

mod api_key;
mod authenticator;
mod jwt;
mod types;

pub use api_key::ApiKeyAuthenticator;
pub use authenticator::{Authenticator, ChainAuthenticator};
pub use jwt::{JwtAuthenticator, JwtClaims, JwtSettings};
pub use types::*;
