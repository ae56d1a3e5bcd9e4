//! # bastion-cli
//!
//! Command-line interface for the Bastion plugin host.
//!
//! ## Commands
//!
//! - `bastion validate <dir>`: Validate a plugin package without installing it
//! - `bastion install <dir>`: Install a package (prompts for sensitive permissions)
//! - `bastion fetch <id> --mirror <dir>`: Install a package from a local mirror
//! - `bastion enable | disable | uninstall <id>`: Lifecycle transitions
//! - `bastion list` / `bastion state <id>`: Inspect installed plugins
//! - `bastion run <id>`: Load a plugin and execute one entry in the sandbox
//! - `bastion grant | revoke <id> <permission>`: Edit the grant table
//! - `bastion permissions`: Show the permission catalog and current grants
//! - `bastion config` / `bastion doctor`: Show and audit configuration

pub mod commands;

pub use commands::Cli;
