//! # Toolgate Audit
//!
//! Audit logging and rate limiting for toolgate.

mod audit_logger;
mod rate_limiter;

pub use audit_logger::{AuditAction, AuditEvent, AuditFilter, AuditLog, AuditLogEntry, AuditStats};
pub use rate_limiter::{LimiterMetrics, RateLimitDecision, TokenBucket, TokenBucketLimiter};
