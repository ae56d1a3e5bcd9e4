//! # bastion-config
//!
//! Configuration for the Bastion plugin host. Reads `bastion.toml`, then
//! applies environment variable overrides on top.

pub mod schema;
pub mod loader;

pub use schema::BastionConfig;
pub use schema::{
    ConfigWarning, HostConfig, LoggingConfig, PermissionsConfig, PluginsConfig, SandboxConfig,
    WarningSeverity,
};
pub use loader::ConfigLoader;
