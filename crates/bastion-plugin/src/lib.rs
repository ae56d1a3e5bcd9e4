//! # bastion-plugin
//!
//! The plugin trust boundary: package validation, the WebAssembly sandbox
//! and the lifecycle state machine that ties them to the permission store.
//!
//! ## Plugin package
//!
//! A package is a directory with a `plugin.toml` manifest and an entry code
//! unit (WebAssembly binary or text format):
//!
//! ```toml
//! manifest_version = 1
//! dependencies = ["com.example.base"]
//! permissions = ["log.write", "storage.read"]
//!
//! [plugin]
//! id = "com.example.hello"
//! name = "Hello"
//! version = "1.0.0"
//! min_host_version = "0.1.0"
//! entry = "plugin.wat"
//! ```
//!
//! The entry may import only functions from the `bastion` host module; gated
//! functions need the matching permission to be both requested and granted.

pub mod deps;
pub mod enabled;
pub mod inspect;
pub mod lifecycle;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod validator;

pub use enabled::EnabledSet;
pub use lifecycle::{InstallReport, LifecycleManager, LifecycleOptions, PluginRecord, RestoreReport};
pub use manifest::PluginManifest;
pub use registry::{DirectoryRegistry, MirrorRepository, PackageRepository, PluginRegistry};
pub use sandbox::{
    CodeUnit, ExecutionRequest, ExecutionResult, ResourceCeiling, SandboxExecutor, SandboxFailure, SandboxOptions,
    ScopedServices, cpu_time_from_secs,
};
pub use validator::{ValidationOutcome, validate, validate_with_grants};
