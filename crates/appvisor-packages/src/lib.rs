//! Package lifecycle orchestration.
//!
//! A package ("unit") is a directory under the storage root containing an
//! entry program, a manifest, bundled web assets, and a `localdata/`
//! directory for persistent state. The [`Orchestrator`] keeps a registry
//! of units mirrored against that directory tree, installs and uninstalls
//! packages, and reconciles each unit's run state against the enablement
//! group in the configuration store.

mod manifest;
mod orchestrator;
mod ports;
mod unit;
mod watch;

pub use manifest::{read_manifest, Manifest, MANIFEST_FILE};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use ports::{allocate_port, PortRange, PRIVATE_PORT_RANGE, PUBLIC_PORT_RANGE};
pub use unit::{Unit, UnitEnvironment, ASSETS_DIR, ENTRY_PROGRAM, LOCALDATA_DIR};
