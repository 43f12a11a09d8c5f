//! Package manifest: the `manifest.json` every package ships at its root.

use std::path::Path;

use appvisor_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Manifest file name inside a package directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Descriptive metadata shipped with a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Canonical package name; doubles as the storage directory name.
    pub package_name: String,
    /// Human-readable name shown in listings.
    pub package_menu_name: String,
    /// Minimum host version the package needs, dotted components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_host_version: Option<String>,
    /// Optional path into the package's bundled assets to open in a UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_link: Option<String>,
}

/// Read and parse the manifest from a package directory.
pub fn read_manifest(dir: &Path) -> Result<Manifest> {
    let path = dir.join(MANIFEST_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::no_manifest(dir.display().to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_full_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{
                "package_name": "weather",
                "package_menu_name": "Weather Overlay",
                "required_host_version": "1.2.0",
                "ui_link": "settings.html"
            }"#,
        )
        .unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(manifest.package_name, "weather");
        assert_eq!(manifest.package_menu_name, "Weather Overlay");
        assert_eq!(manifest.required_host_version.as_deref(), Some("1.2.0"));
        assert_eq!(manifest.ui_link.as_deref(), Some("settings.html"));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"package_name": "a", "package_menu_name": "A"}"#,
        )
        .unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert!(manifest.required_host_version.is_none());
        assert!(manifest.ui_link.is_none());
    }

    #[test]
    fn missing_manifest_is_its_own_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_manifest(dir.path()),
            Err(Error::NoManifest { .. })
        ));
    }

    #[test]
    fn malformed_manifest_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(matches!(read_manifest(dir.path()), Err(Error::Json(_))));
    }
}
