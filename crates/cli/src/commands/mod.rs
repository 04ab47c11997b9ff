//! CLI Commands

pub mod call;
pub mod channel;
pub mod config;
pub mod init;

pub use call::CallCommand;
pub use channel::ChannelCommand;
pub use config::ConfigCommand;
pub use init::InitCommand;
