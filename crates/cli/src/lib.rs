//! # Toolgate CLI
//!
//! Commands and the interactive REPL behind the `toolgate` binary.

pub mod commands;
pub mod demo;
pub mod interactive;
