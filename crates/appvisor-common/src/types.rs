//! Core value types: package names and host versions.

use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};

/// Validate a package name for filesystem safety.
///
/// Names double as storage directory names, so only ASCII letters,
/// digits, `_` and `-` are allowed.
pub fn validate_package_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_name(name))
    }
}

/// A dotted numeric version, e.g. `1.4.2`.
///
/// Comparison is component-wise and requires both sides to have the same
/// number of components; the host and its packages agree on the scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostVersion(Vec<u32>);

impl HostVersion {
    /// Check that this (running) host satisfies a package's minimum
    /// required version.
    ///
    /// Fails with `IncompatibleVersion` when the requirement is newer
    /// than the host, and with `VersionFormat` when the component counts
    /// differ.
    pub fn ensure_supports(&self, required: &HostVersion) -> Result<()> {
        if self.0.len() != required.0.len() {
            return Err(Error::version_format(required.to_string()));
        }
        for (host, req) in self.0.iter().zip(required.0.iter()) {
            if req > host {
                return Err(Error::incompatible_version(
                    required.to_string(),
                    self.to_string(),
                ));
            }
            if req < host {
                break;
            }
        }
        Ok(())
    }
}

impl FromStr for HostVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let components: std::result::Result<Vec<u32>, _> =
            s.split('.').map(|part| part.parse::<u32>()).collect();
        match components {
            Ok(parts) if !parts.is_empty() => Ok(HostVersion(parts)),
            _ => Err(Error::version_format(s)),
        }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}
