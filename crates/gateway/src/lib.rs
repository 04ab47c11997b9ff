//! # Toolgate Gateway
//!
//! Composition root: one [`Gateway`] owns the tool registry, access
//! controller, audit log and rate limiter, and threads every call through
//! them. Encrypted channels attach per connection below the wire adapter.

mod connections;
mod gateway;
mod handler;
mod response;

pub use connections::{ConnectionInfo, ConnectionRegistry};
pub use gateway::{CallContext, ChannelRequest, Gateway, MaintenanceReport, ANONYMOUS_USER, SYSTEM_USER};
pub use handler::{FnTool, ToolHandler};
pub use response::{ExecuteResponse, GatewayMetrics, HealthReport, HealthStatus};

// Re-export the component crates
pub use audit::{AuditAction, AuditFilter, AuditLog, AuditLogEntry, RateLimitDecision, TokenBucketLimiter};
pub use auth::{ApiKeyAuthenticator, Authenticator, ChainAuthenticator, ClientKeyStrategy, JwtAuthenticator, JwtSettings};
pub use rbac::{AccessController, Permission, Quota, ToolRegistry};
