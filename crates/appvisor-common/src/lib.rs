//! Shared types and errors for the appvisor workspace.
//!
//! Everything here is dependency-light on purpose: the error taxonomy and
//! the core value types (package names, host versions) are used by every
//! other crate in the workspace.

pub mod errors;
pub mod types;

pub use errors::{Error, Result, SupervisorError, SupervisorResult};
pub use types::{validate_package_name, HostVersion};
