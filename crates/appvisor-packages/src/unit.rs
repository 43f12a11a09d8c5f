//! A registered package and its runtime handle.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appvisor_common::{Result, SupervisorResult};
use appvisor_supervisor::{
    ProcessSupervisor, SupervisorEvent, SupervisorSpec, SupervisorState, UnitSignal,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::manifest::{read_manifest, Manifest};

/// Entry program inside a package directory.
pub const ENTRY_PROGRAM: &str = "main";

/// Persistent per-package state directory.
pub const LOCALDATA_DIR: &str = "localdata";

/// Bundled web assets directory.
pub const ASSETS_DIR: &str = "html";

const SETTINGS_FILE: &str = "settings.json";
const LOG_FILE: &str = "log.txt";

/// Values injected into a unit's process environment.
#[derive(Debug, Clone)]
pub struct UnitEnvironment {
    pub private_port: u16,
    pub public_port: u16,
    pub install_path: PathBuf,
    pub persistent_data_path: PathBuf,
}

impl UnitEnvironment {
    fn to_env_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("HTTP_PORT".to_string(), self.private_port.to_string()),
            ("HTTP_PORT_PUBLIC".to_string(), self.public_port.to_string()),
            (
                "INSTALL_PATH".to_string(),
                self.install_path.display().to_string(),
            ),
            (
                "PERSISTENT_DATA_PATH".to_string(),
                self.persistent_data_path.display().to_string(),
            ),
        ])
    }
}

/// One installed package: its storage directory plus a supervisor for its
/// entry program. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Unit {
    shared: Arc<UnitShared>,
}

struct UnitShared {
    name: String,
    storage: PathBuf,
    env: UnitEnvironment,
    enabled: AtomicBool,
    supervisor: ProcessSupervisor,
}

impl Unit {
    /// Build a unit over an existing package directory.
    ///
    /// Creates the `localdata/` directory if missing; everything else in
    /// the directory is taken as-is. The unit starts disabled.
    pub fn new(
        storage: PathBuf,
        private_port: u16,
        public_port: u16,
        restart_delay: Duration,
        grace_period: Duration,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<Self> {
        let name = storage
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let localdata = storage.join(LOCALDATA_DIR);
        std::fs::create_dir_all(&localdata)?;

        let env = UnitEnvironment {
            private_port,
            public_port,
            install_path: storage.clone(),
            persistent_data_path: localdata.clone(),
        };
        let mut spec = SupervisorSpec::new(
            name.clone(),
            storage.join(ENTRY_PROGRAM),
            storage.clone(),
            localdata.join(LOG_FILE),
        );
        spec.env = env.to_env_map();
        spec.restart_delay = restart_delay;
        spec.grace_period = grace_period;

        Ok(Self {
            shared: Arc::new(UnitShared {
                name,
                storage,
                env,
                enabled: AtomicBool::new(false),
                supervisor: ProcessSupervisor::new(spec, events),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn storage_path(&self) -> &Path {
        &self.shared.storage
    }

    pub fn environment(&self) -> &UnitEnvironment {
        &self.shared.env
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.supervisor.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.supervisor.pid()
    }

    /// Enable the unit, starting its process. Idempotent.
    pub fn enable(&self) {
        if !self.shared.enabled.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.shared.supervisor.start() {
                error!(unit = %self.name(), %err, "enable failed to start supervisor");
            }
        }
    }

    /// Disable the unit, stopping its process. Idempotent.
    pub fn disable(&self) {
        if self.shared.enabled.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.shared.supervisor.stop() {
                error!(unit = %self.name(), %err, "disable failed to stop supervisor");
            }
        }
    }

    /// Signal the running process so it reloads; it is respawned
    /// immediately if it exits in response.
    pub fn soft_restart(&self, signal: UnitSignal) -> SupervisorResult<()> {
        self.shared.supervisor.restart(signal)
    }

    /// Read the manifest fresh from disk; it may change across upgrades.
    pub fn read_manifest(&self) -> Result<Manifest> {
        read_manifest(&self.shared.storage)
    }

    /// The unit's persisted settings document, or an empty object when the
    /// settings file is missing or unreadable.
    pub fn settings(&self) -> Value {
        let path = self.settings_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(err) => {
                    debug!(unit = %self.name(), %err, "malformed settings file");
                    Value::Object(Default::default())
                }
            },
            Err(_) => Value::Object(Default::default()),
        }
    }

    /// Overwrite the settings document. The settings watcher picks up the
    /// change and soft-restarts the unit.
    pub fn set_settings(&self, value: &Value) -> Result<()> {
        let raw = serde_json::to_string_pretty(value)?;
        std::fs::write(self.settings_path(), raw)?;
        Ok(())
    }

    /// Resolve a relative path inside the unit's bundled assets.
    ///
    /// Parent-directory components are rejected so a request can never
    /// escape the assets directory. Returns `None` when the file does not
    /// exist.
    pub fn asset_file(&self, relative: &str) -> Option<PathBuf> {
        let mut path = self.shared.storage.join(ASSETS_DIR);
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        path.is_file().then_some(path)
    }

    /// Path to the unit's log file, if any output has been captured.
    pub fn log_file(&self) -> Option<PathBuf> {
        let path = self
            .shared
            .storage
            .join(LOCALDATA_DIR)
            .join(LOG_FILE);
        path.is_file().then_some(path)
    }

    fn settings_path(&self) -> PathBuf {
        self.shared
            .storage
            .join(LOCALDATA_DIR)
            .join(SETTINGS_FILE)
    }
}
