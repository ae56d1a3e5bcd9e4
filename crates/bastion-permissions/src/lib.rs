//! # bastion-permissions
//!
//! The capability model of the plugin host:
//!
//! - [`catalog`]: the static table of every permission a plugin may request
//! - [`store`]: the durable plugin → granted-permissions table consulted on
//!   every gated host call
//! - [`approval`]: the install-time grant policy and the approver seam

pub mod approval;
pub mod catalog;
pub mod store;

pub use approval::{AllowAll, ApprovalPolicy, DenyAll, InstallGrantOutcome, apply_install_policy};
pub use catalog::{CapabilityClass, Permission, RiskLevel};
pub use store::PermissionStore;
