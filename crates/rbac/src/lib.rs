//! Tool registry and access control for toolgate
//!
//! - [`ToolRegistry`] stores and validates tool definitions, tracks usage
//! - [`AccessController`] evaluates permissions and usage quotas

pub mod access_control;
pub mod tool_registry;

pub use access_control::{tool_subject, AccessController, AccessDecision, AccessReason, Permission, Quota};
pub use tool_registry::{RegistrationOutcome, RegistryError, RegistryEvent, RegistryStats, ToolRegistry};
