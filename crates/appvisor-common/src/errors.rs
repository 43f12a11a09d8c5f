//! Error types for appvisor.
//!
//! Two enums: [`Error`] covers orchestrator and configuration-store
//! operations, [`SupervisorError`] covers the per-unit process state
//! machine. Callers pattern-match on variants rather than inspecting
//! message strings.

use thiserror::Error;

/// Result type alias for orchestrator and store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for supervisor operations.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Errors surfaced by the orchestrator and the configuration store.
#[derive(Debug, Error)]
pub enum Error {
    /// A staged package directory has no manifest file.
    #[error("no manifest found in {path}")]
    NoManifest { path: String },

    /// A package name contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid package name: {name:?}")]
    InvalidName { name: String },

    /// A staged package requires a newer host than the one running.
    #[error("package requires host version {required}, running {running}")]
    IncompatibleVersion { required: String, running: String },

    /// A version string could not be parsed as dotted numerics.
    #[error("malformed version string: {value:?}")]
    VersionFormat { value: String },

    /// A unit with the given name is not registered.
    #[error("package not found: {name}")]
    NotFound { name: String },

    /// A configuration group was never loaded.
    #[error("unknown configuration group: {group}")]
    UnknownGroup { group: String },

    /// The dependency-installation subprocess exited non-zero.
    #[error("install command {command:?} failed with status {status}")]
    Subprocess { command: String, status: i32 },

    /// No free TCP port could be found in the configured range.
    #[error("no free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    /// I/O failure during install, uninstall, or a store write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a manifest or settings document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn no_manifest(path: impl Into<String>) -> Self {
        Self::NoManifest { path: path.into() }
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    pub fn incompatible_version(
        required: impl Into<String>,
        running: impl Into<String>,
    ) -> Self {
        Self::IncompatibleVersion {
            required: required.into(),
            running: running.into(),
        }
    }

    pub fn version_format(value: impl Into<String>) -> Self {
        Self::VersionFormat {
            value: value.into(),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn unknown_group(group: impl Into<String>) -> Self {
        Self::UnknownGroup {
            group: group.into(),
        }
    }

    pub fn subprocess(command: impl Into<String>, status: i32) -> Self {
        Self::Subprocess {
            command: command.into(),
            status,
        }
    }

    pub fn no_free_port(start: u16, end: u16) -> Self {
        Self::NoFreePort { start, end }
    }
}

/// Errors surfaced by the process supervisor.
///
/// `AlreadyRunning` and `NotRunning` are programmer errors for callers
/// going through a `Unit`, whose idempotent enable/disable wrappers never
/// trigger them.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start()` was called while the supervisor is already enabled.
    #[error("process already set to run: {id}")]
    AlreadyRunning { id: String },

    /// `stop()` or `restart()` was called with nothing to act on.
    #[error("process not running: {id}")]
    NotRunning { id: String },

    /// The child process could not be spawned.
    #[error("failed to spawn {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    /// A signal could not be delivered to the child.
    #[error("failed to signal {id}: {reason}")]
    SignalFailed { id: String, reason: String },
}

impl SupervisorError {
    pub fn already_running(id: impl Into<String>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    pub fn spawn_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn signal_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_construction() {
        let err = Error::not_found("foo");
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(err.to_string(), "package not found: foo");

        let err = Error::incompatible_version("2.0.0", "1.4.2");
        assert!(err.to_string().contains("2.0.0"));
        assert!(err.to_string().contains("1.4.2"));
    }

    #[test]
    fn io_error_wraps() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn supervisor_error_display() {
        let err = SupervisorError::already_running("foo");
        assert_eq!(err.to_string(), "process already set to run: foo");
    }
}
