//! # Toolgate Shared
//!
//! Common types and interfaces used across all toolgate crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod tool;

// Re-exports
pub use clock::*;
pub use config::*;
pub use error::*;
pub use identity::*;
pub use tool::*;
