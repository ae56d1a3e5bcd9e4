//! # bastion-core
//!
//! Core types and primitives for the Bastion plugin host.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! plugin identifiers, validation issues, the unified error type, and the
//! atomic replace-on-write helper used for every durable file.

pub mod error;
pub mod issue;
pub mod persist;
pub mod types;

pub use error::{BastionError, Result};
pub use issue::{Issue, IssueCode};
pub use types::*;
