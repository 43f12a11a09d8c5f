//! The package orchestrator: registry, install/uninstall, reconciliation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use appvisor_common::{validate_package_name, Error, HostVersion, Result, SupervisorError};
use appvisor_config_store::{ConfigStore, StoreEvent};
use appvisor_supervisor::{
    SupervisorEvent, SupervisorEventKind, UnitSignal, DEFAULT_GRACE_PERIOD, DEFAULT_RESTART_DELAY,
};
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::manifest::{read_manifest, Manifest};
use crate::ports::{allocate_port, PortRange, PRIVATE_PORT_RANGE, PUBLIC_PORT_RANGE};
use crate::unit::{Unit, LOCALDATA_DIR};
use crate::watch::{watch_packages, WatchEvent};

/// Static orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding one subdirectory per installed package.
    pub storage_root: PathBuf,
    /// Version of the running host, checked against package requirements.
    pub host_version: HostVersion,
    pub private_ports: PortRange,
    pub public_ports: PortRange,
    /// Optional command run inside a staged package before installation,
    /// e.g. a dependency fetch. Program followed by its arguments.
    pub install_command: Option<Vec<String>>,
    pub restart_delay: Duration,
    pub grace_period: Duration,
}

impl OrchestratorConfig {
    pub fn new(storage_root: impl Into<PathBuf>, host_version: HostVersion) -> Self {
        Self {
            storage_root: storage_root.into(),
            host_version,
            private_ports: PRIVATE_PORT_RANGE,
            public_ports: PUBLIC_PORT_RANGE,
            install_command: None,
            restart_delay: DEFAULT_RESTART_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Owns the unit registry and keeps it mirrored against the storage root.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    store: ConfigStore,
    units: RwLock<HashMap<String, Unit>>,
    /// Set for the duration of an install; pauses reactive registration
    /// and reconciliation so the migration sequence is not raced.
    lock_mode: AtomicBool,
    ready: AtomicBool,
    /// Enablement group name, set by `connect`.
    directive_group: Mutex<Option<String>>,
    supervisor_events: mpsc::UnboundedSender<SupervisorEvent>,
    // Held only to keep the OS watch registrations alive.
    _watchers: Mutex<Option<(RecommendedWatcher, RecommendedWatcher)>>,
}

impl Orchestrator {
    /// Open the orchestrator over a storage root.
    ///
    /// Creates the root if absent, starts the filesystem watchers,
    /// registers a unit for every existing package directory (dot-entries
    /// are skipped), and spawns the event loop. No unit is enabled yet;
    /// that is `connect`'s job.
    pub async fn open(config: OrchestratorConfig, store: ConfigStore) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root).await?;

        // Watchers come up before the scan so nothing slips between the
        // two; the registry check deduplicates any overlap.
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let watchers = watch_packages(&config.storage_root, watch_tx)?;
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                units: RwLock::new(HashMap::new()),
                lock_mode: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                directive_group: Mutex::new(None),
                supervisor_events: supervisor_tx,
                _watchers: Mutex::new(Some(watchers)),
            }),
        };

        let root = orchestrator.inner.config.storage_root.clone();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Err(err) = orchestrator.register_unit(name) {
                error!(package = %name, %err, "failed to register package at startup");
            }
        }

        tokio::spawn(event_loop(
            Arc::downgrade(&orchestrator.inner),
            watch_rx,
            supervisor_rx,
        ));

        orchestrator.inner.ready.store(true, Ordering::SeqCst);
        info!(
            root = %root.display(),
            packages = orchestrator.inner.units.read().len(),
            "package orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.units.read().contains_key(name)
    }

    pub fn get_unit(&self, name: &str) -> Option<Unit> {
        self.inner.units.read().get(name).cloned()
    }

    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.units.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Manifests of every registered package, ordered by menu name.
    /// Packages whose manifest cannot be read are skipped with a warning.
    pub fn list_manifests(&self) -> Vec<Manifest> {
        let units: Vec<Unit> = self.inner.units.read().values().cloned().collect();
        let mut manifests = Vec::with_capacity(units.len());
        for unit in units {
            match unit.read_manifest() {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => warn!(package = %unit.name(), %err, "unreadable package manifest"),
            }
        }
        manifests.sort_by(|a, b| a.package_menu_name.cmp(&b.package_menu_name));
        manifests
    }

    /// Install (or upgrade) the package staged at `staging`.
    ///
    /// Validates the staged manifest, name, and host-version requirement,
    /// runs the optional dependency step, then migrates the directory
    /// into the storage root under the install lock. On upgrade the old
    /// version's `localdata/` survives, shadowing any staged defaults,
    /// and an enabled unit comes back enabled. The staged directory is
    /// consumed on success and untouched on validation failure.
    ///
    /// File operations are deliberately blocking; installs are rare and
    /// operator-driven.
    pub fn install_package(&self, staging: &Path) -> Result<()> {
        let manifest = read_manifest(staging)?;
        validate_package_name(&manifest.package_name)?;
        if let Some(required) = &manifest.required_host_version {
            let required: HostVersion = required.parse()?;
            self.inner.config.host_version.ensure_supports(&required)?;
        }
        if let Some(command) = &self.inner.config.install_command {
            run_install_command(command, staging)?;
        }

        let name = manifest.package_name.clone();
        info!(package = %name, from = %staging.display(), "installing package");
        self.inner.lock_mode.store(true, Ordering::SeqCst);
        let result = self.migrate_into_place(&name, staging);
        self.inner.lock_mode.store(false, Ordering::SeqCst);
        // Watch events were ignored while the lock was held; re-derive
        // the registry from the tree before reporting the outcome.
        self.resync();
        result?;

        // One reconciliation pass to apply any directive that arrived
        // while the lock was held.
        let group = self.inner.directive_group.lock().clone();
        if let Some(group) = group {
            self.reconcile(&group);
        }
        info!(package = %name, "package installed");
        Ok(())
    }

    /// Remove a package: stop it, drop it from the registry, and delete
    /// its directory including `localdata/`.
    pub fn uninstall_package(&self, name: &str) -> Result<()> {
        let unit = self
            .inner
            .units
            .write()
            .remove(name)
            .ok_or_else(|| Error::not_found(name))?;
        unit.disable();
        match std::fs::remove_dir_all(unit.storage_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                // Deletion failed with the directory still on disk; put
                // the registration back so registry and tree agree.
                self.inner.units.write().insert(name.to_string(), unit);
                return Err(err.into());
            }
        }
        info!(package = %name, "package uninstalled");
        Ok(())
    }

    /// Bind enablement to a configuration group and keep reconciling on
    /// its refreshes. Runs one pass immediately.
    pub fn connect(&self, group: &str) {
        *self.inner.directive_group.lock() = Some(group.to_string());
        let mut rx = self.inner.store.subscribe();
        self.reconcile(group);

        // Weak so the directive task never keeps the orchestrator alive.
        let weak = Arc::downgrade(&self.inner);
        let group = group.to_string();
        info!(group = %group, "enablement directives connected");
        tokio::spawn(async move {
            loop {
                let relevant = match rx.recv().await {
                    Ok(StoreEvent::Refresh(g) | StoreEvent::GroupAdded(g)) => g == group,
                    Ok(_) => false,
                    // A lag dropped events; run a catch-up pass.
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !relevant {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                let orchestrator = Orchestrator { inner };
                if !orchestrator.inner.lock_mode.load(Ordering::SeqCst) {
                    orchestrator.reconcile(&group);
                }
            }
        });
    }

    /// Stop every unit. Called at daemon shutdown.
    pub fn shutdown(&self) {
        let units: Vec<Unit> = self.inner.units.read().values().cloned().collect();
        info!(units = units.len(), "stopping all packages");
        for unit in units {
            unit.disable();
        }
    }

    /// Drive every unit to the state the directives ask for. Total: a
    /// unit absent from the group counts as disabled.
    fn reconcile(&self, group: &str) {
        let directives = self.inner.store.get(group);
        let units: Vec<Unit> = self.inner.units.read().values().cloned().collect();
        debug!(group, units = units.len(), "reconciling package enablement");
        for unit in units {
            let desired = directives
                .get(unit.name())
                .and_then(|d| d.get("enabled"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if desired {
                unit.enable();
            } else {
                unit.disable();
            }
        }
    }

    /// Build a unit over `storage_root/<name>` and add it to the registry.
    fn register_unit(&self, name: &str) -> Result<Unit> {
        let (private_port, public_port) = self.allocate_ports()?;
        let unit = Unit::new(
            self.inner.config.storage_root.join(name),
            private_port,
            public_port,
            self.inner.config.restart_delay,
            self.inner.config.grace_period,
            self.inner.supervisor_events.clone(),
        )?;
        self.inner
            .units
            .write()
            .insert(name.to_string(), unit.clone());
        info!(package = %name, private_port, public_port, "package registered");
        Ok(unit)
    }

    fn allocate_ports(&self) -> Result<(u16, u16)> {
        let (private_reserved, public_reserved): (HashSet<u16>, HashSet<u16>) = {
            let units = self.inner.units.read();
            (
                units.values().map(|u| u.environment().private_port).collect(),
                units.values().map(|u| u.environment().public_port).collect(),
            )
        };
        let private = allocate_port(self.inner.config.private_ports, &private_reserved)?;
        let public = allocate_port(self.inner.config.public_ports, &public_reserved)?;
        Ok((private, public))
    }

    /// Replace (or create) the installed package from the staged one.
    /// Runs under the install lock.
    fn migrate_into_place(&self, name: &str, staging: &Path) -> Result<()> {
        let dest = self.inner.config.storage_root.join(name);
        let prior = self.inner.units.write().remove(name);
        let was_enabled = prior.as_ref().map(Unit::is_enabled).unwrap_or(false);

        if let Some(unit) = &prior {
            unit.disable();
            let localdata = dest.join(LOCALDATA_DIR);
            if localdata.is_dir() {
                // User data survives the upgrade, shadowing staged
                // defaults.
                copy_dir_all(&localdata, &staging.join(LOCALDATA_DIR))?;
            }
            std::fs::remove_dir_all(&dest)?;
            debug!(package = %name, "previous version removed");
        }

        move_dir(staging, &dest)?;
        let unit = match self.register_unit(name) {
            Ok(unit) => unit,
            Err(err) => {
                // Roll the directory back out so the tree matches the
                // registry; preserved localdata is already inside it.
                if let Err(rollback_err) = move_dir(&dest, staging) {
                    error!(
                        package = %name,
                        %rollback_err,
                        "rollback of failed install left the directory in place"
                    );
                }
                return Err(err);
            }
        };
        if was_enabled {
            unit.enable();
        }
        Ok(())
    }

    /// Re-derive the registry from the storage root: register
    /// directories that have no unit and drop units whose directory is
    /// gone. Used after windows where watch events were ignored.
    fn resync(&self) {
        let root = &self.inner.config.storage_root;
        let mut present = HashSet::new();
        match std::fs::read_dir(root) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name.starts_with('.') {
                        continue;
                    }
                    present.insert(name.to_string());
                    if !self.contains(name) {
                        if let Err(err) = self.register_unit(name) {
                            error!(package = %name, %err, "failed to register package during resync");
                        }
                    }
                }
            }
            Err(err) => {
                error!(root = %root.display(), %err, "failed to read storage root during resync");
                return;
            }
        }
        let stale: Vec<Unit> = {
            let mut units = self.inner.units.write();
            let gone: Vec<String> = units
                .keys()
                .filter(|name| !present.contains(*name))
                .cloned()
                .collect();
            gone.iter().filter_map(|name| units.remove(name)).collect()
        };
        for unit in stale {
            unit.disable();
            info!(package = %unit.name(), "package directory gone; unit unregistered");
        }
    }

    /// React to classified filesystem activity. Watcher events can be
    /// stale by the time they are handled, so the filesystem is
    /// re-checked before acting.
    fn handle_watch_event(&self, event: WatchEvent) {
        if self.inner.lock_mode.load(Ordering::SeqCst) {
            debug!(?event, "install in progress; watch event ignored");
            return;
        }
        match event {
            WatchEvent::PackageDirAdded(name) => {
                if self.contains(&name)
                    || !self.inner.config.storage_root.join(&name).is_dir()
                {
                    return;
                }
                match self.register_unit(&name) {
                    Ok(_) => {
                        let group = self.inner.directive_group.lock().clone();
                        if let Some(group) = group {
                            self.reconcile(&group);
                        }
                    }
                    Err(err) => {
                        error!(package = %name, %err, "failed to register appearing package")
                    }
                }
            }
            WatchEvent::PackageDirRemoved(name) => {
                if self.inner.config.storage_root.join(&name).is_dir() {
                    // Already replaced; the removal is stale.
                    return;
                }
                if let Some(unit) = self.inner.units.write().remove(&name) {
                    unit.disable();
                    info!(package = %name, "package directory removed; unit unregistered");
                }
            }
            WatchEvent::SettingsChanged(name) => {
                let Some(unit) = self.get_unit(&name) else {
                    return;
                };
                match unit.soft_restart(UnitSignal::Interrupt) {
                    Ok(()) => info!(package = %name, "settings changed; package restarting"),
                    Err(SupervisorError::NotRunning { .. }) => {
                        debug!(package = %name, "settings changed while stopped")
                    }
                    Err(err) => {
                        warn!(package = %name, %err, "settings-change restart failed")
                    }
                }
            }
        }
    }
}

/// Drain watcher and supervisor events for the orchestrator's lifetime.
async fn event_loop(
    inner: Weak<OrchestratorInner>,
    mut watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
    mut supervisor_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    loop {
        tokio::select! {
            event = watch_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                Orchestrator { inner }.handle_watch_event(event);
            }
            event = supervisor_rx.recv() => {
                let Some(event) = event else { break };
                log_supervisor_event(&event);
            }
        }
    }
}

fn log_supervisor_event(event: &SupervisorEvent) {
    match event.kind {
        SupervisorEventKind::Started => info!(package = %event.id, "package started"),
        SupervisorEventKind::Stopped => info!(package = %event.id, "package stopped"),
        SupervisorEventKind::Restarted => info!(package = %event.id, "package restarted"),
        SupervisorEventKind::Killed => warn!(package = %event.id, "package force-killed"),
    }
}

fn run_install_command(command: &[String], dir: &Path) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    info!(command = %command.join(" "), dir = %dir.display(), "running dependency install step");
    let status = std::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .status()?;
    if !status.success() {
        return Err(Error::subprocess(
            command.join(" "),
            status.code().unwrap_or(-1),
        ));
    }
    Ok(())
}

fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy-and-delete for cross-device moves.
fn move_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_all(src, dest)?;
            std::fs::remove_dir_all(src)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use appvisor_config_store::ENABLEMENT_GROUP;
    use appvisor_supervisor::SupervisorState;
    use serde_json::json;

    fn make_package(parent: &Path, name: &str, menu_name: &str) {
        make_package_with(parent, name, menu_name, None)
    }

    fn make_package_with(
        parent: &Path,
        name: &str,
        menu_name: &str,
        required_version: Option<&str>,
    ) {
        use std::os::unix::fs::PermissionsExt;

        let dir = parent.join(name);
        std::fs::create_dir_all(dir.join("html")).unwrap();
        std::fs::write(dir.join("html").join("index.html"), "<html/>").unwrap();

        let mut manifest = json!({
            "package_name": name,
            "package_menu_name": menu_name,
        });
        if let Some(version) = required_version {
            manifest["required_host_version"] = json!(version);
        }
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();

        let program = dir.join("main");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&program, perms).unwrap();
    }

    async fn setup(tmp: &Path) -> (ConfigStore, Orchestrator) {
        let store = ConfigStore::open(tmp.join("params")).await.unwrap();
        let mut config = OrchestratorConfig::new(
            tmp.join("packages"),
            "1.4.0".parse().unwrap(),
        );
        config.restart_delay = Duration::from_millis(100);
        config.grace_period = Duration::from_millis(500);
        let orchestrator = Orchestrator::open(config, store.clone()).await.unwrap();
        (store, orchestrator)
    }

    async fn wait_for(mut pred: impl FnMut() -> bool, timeout: Duration, what: &str) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn open_scans_existing_packages() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Beta");
        make_package(&root, "bar", "Alpha");
        std::fs::create_dir_all(root.join(".staging")).unwrap();

        let (_store, orchestrator) = setup(tmp.path()).await;
        assert!(orchestrator.is_ready());
        assert!(orchestrator.contains("foo"));
        assert!(orchestrator.contains("bar"));
        assert!(!orchestrator.contains(".staging"));

        let manifests = orchestrator.list_manifests();
        let menu: Vec<&str> = manifests
            .iter()
            .map(|m| m.package_menu_name.as_str())
            .collect();
        assert_eq!(menu, vec!["Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn units_get_distinct_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        make_package(&root, "bar", "Bar");

        let (_store, orchestrator) = setup(tmp.path()).await;
        let foo = orchestrator.get_unit("foo").unwrap();
        let bar = orchestrator.get_unit("bar").unwrap();
        assert_ne!(
            foo.environment().private_port,
            bar.environment().private_port
        );
        assert_ne!(foo.environment().public_port, bar.environment().public_port);
    }

    #[tokio::test]
    async fn install_moves_the_staged_package_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, orchestrator) = setup(tmp.path()).await;

        let staging = tmp.path().join("stage");
        make_package(&staging, "foo", "Foo");
        orchestrator.install_package(&staging.join("foo")).unwrap();

        assert!(orchestrator.contains("foo"));
        assert!(tmp.path().join("packages/foo/main").is_file());
        assert!(!staging.join("foo").exists());
        assert!(!orchestrator.get_unit("foo").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn install_requires_a_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, orchestrator) = setup(tmp.path()).await;

        let staging = tmp.path().join("stage/bare");
        std::fs::create_dir_all(&staging).unwrap();
        assert!(matches!(
            orchestrator.install_package(&staging),
            Err(Error::NoManifest { .. })
        ));
        assert!(staging.exists());
    }

    #[tokio::test]
    async fn install_rejects_unsafe_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, orchestrator) = setup(tmp.path()).await;

        let staging = tmp.path().join("stage/evil");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(
            staging.join("manifest.json"),
            r#"{"package_name": "../evil", "package_menu_name": "Evil"}"#,
        )
        .unwrap();
        assert!(matches!(
            orchestrator.install_package(&staging),
            Err(Error::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn install_enforces_the_version_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Old Foo");
        let (_store, orchestrator) = setup(tmp.path()).await;

        let staging = tmp.path().join("stage");
        make_package_with(&staging, "foo", "New Foo", Some("9.0.0"));
        assert!(matches!(
            orchestrator.install_package(&staging.join("foo")),
            Err(Error::IncompatibleVersion { .. })
        ));

        // The installed version is untouched.
        assert!(orchestrator.contains("foo"));
        let manifest = orchestrator.get_unit("foo").unwrap().read_manifest().unwrap();
        assert_eq!(manifest.package_menu_name, "Old Foo");
    }

    #[tokio::test]
    async fn upgrade_preserves_localdata_and_run_state() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo v1");
        let (_store, orchestrator) = setup(tmp.path()).await;

        let unit = orchestrator.get_unit("foo").unwrap();
        unit.enable();
        let probe = unit.clone();
        wait_for(
            move || probe.state() == SupervisorState::Running,
            Duration::from_secs(5),
            "v1 running",
        )
        .await;
        std::fs::write(root.join("foo/localdata/user.txt"), "keep me").unwrap();

        let staging = tmp.path().join("stage");
        make_package(&staging, "foo", "Foo v2");
        orchestrator.install_package(&staging.join("foo")).unwrap();

        let upgraded = orchestrator.get_unit("foo").unwrap();
        assert_eq!(
            upgraded.read_manifest().unwrap().package_menu_name,
            "Foo v2"
        );
        assert_eq!(
            std::fs::read_to_string(root.join("foo/localdata/user.txt")).unwrap(),
            "keep me"
        );
        assert!(upgraded.is_enabled());
        let probe = upgraded.clone();
        wait_for(
            move || probe.state() == SupervisorState::Running,
            Duration::from_secs(5),
            "v2 running",
        )
        .await;
    }

    #[tokio::test]
    async fn uninstall_removes_the_package_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        let (_store, orchestrator) = setup(tmp.path()).await;

        orchestrator.uninstall_package("foo").unwrap();
        assert!(!orchestrator.contains("foo"));
        assert!(!root.join("foo").exists());

        assert!(matches!(
            orchestrator.uninstall_package("foo"),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reconciliation_follows_the_enablement_group() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        make_package(&root, "bar", "Bar");
        let (store, orchestrator) = setup(tmp.path()).await;
        orchestrator.connect(ENABLEMENT_GROUP);

        store
            .update(ENABLEMENT_GROUP, json!({"foo": {"enabled": true}}))
            .unwrap();
        let foo = orchestrator.get_unit("foo").unwrap();
        let bar = orchestrator.get_unit("bar").unwrap();
        let probe = foo.clone();
        wait_for(
            move || probe.state() == SupervisorState::Running,
            Duration::from_secs(10),
            "foo enabled by directive",
        )
        .await;
        assert_eq!(bar.state(), SupervisorState::Stopped);

        store
            .update(ENABLEMENT_GROUP, json!({"foo": {"enabled": false}}))
            .unwrap();
        let probe = foo.clone();
        wait_for(
            move || probe.state() == SupervisorState::Stopped,
            Duration::from_secs(10),
            "foo disabled by directive",
        )
        .await;
    }

    #[tokio::test]
    async fn dependency_step_failure_aborts_the_install() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(tmp.path().join("params")).await.unwrap();
        let mut config = OrchestratorConfig::new(
            tmp.path().join("packages"),
            "1.4.0".parse().unwrap(),
        );
        config.install_command = Some(vec!["false".to_string()]);
        let orchestrator = Orchestrator::open(config, store).await.unwrap();

        let staging = tmp.path().join("stage");
        make_package(&staging, "foo", "Foo");
        assert!(matches!(
            orchestrator.install_package(&staging.join("foo")),
            Err(Error::Subprocess { .. })
        ));
        assert!(!orchestrator.contains("foo"));
        assert!(staging.join("foo").exists());
    }

    #[tokio::test]
    async fn failed_registration_rolls_the_staged_package_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(tmp.path().join("params")).await.unwrap();
        let mut config = OrchestratorConfig::new(
            tmp.path().join("packages"),
            "1.4.0".parse().unwrap(),
        );
        // Empty range: every allocation fails.
        config.private_ports = PortRange::new(52521, 52520);
        let orchestrator = Orchestrator::open(config, store).await.unwrap();

        let staging = tmp.path().join("stage");
        make_package(&staging, "foo", "Foo");
        assert!(matches!(
            orchestrator.install_package(&staging.join("foo")),
            Err(Error::NoFreePort { .. })
        ));

        // Registry and tree agree: nothing registered, nothing moved in,
        // and the staged directory is back where it started.
        assert!(!orchestrator.contains("foo"));
        assert!(!tmp.path().join("packages/foo").exists());
        assert!(staging.join("foo").is_dir());
    }

    #[tokio::test]
    async fn uninstall_tolerates_an_already_removed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        let (_store, orchestrator) = setup(tmp.path()).await;

        // Keep the watcher from unregistering it first.
        orchestrator.inner.lock_mode.store(true, Ordering::SeqCst);
        std::fs::remove_dir_all(root.join("foo")).unwrap();
        orchestrator.uninstall_package("foo").unwrap();
        orchestrator.inner.lock_mode.store(false, Ordering::SeqCst);
        assert!(!orchestrator.contains("foo"));
    }

    #[tokio::test]
    async fn resync_repairs_drift_accumulated_under_the_install_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        let (_store, orchestrator) = setup(tmp.path()).await;

        // Watch events are ignored while an install holds the lock;
        // mutate the tree underneath it.
        orchestrator.inner.lock_mode.store(true, Ordering::SeqCst);
        std::fs::remove_dir_all(root.join("foo")).unwrap();
        make_package(&root, "baz", "Baz");
        orchestrator.resync();
        orchestrator.inner.lock_mode.store(false, Ordering::SeqCst);

        assert!(!orchestrator.contains("foo"));
        assert!(orchestrator.contains("baz"));
    }

    #[tokio::test]
    async fn dropping_the_orchestrator_releases_its_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, orchestrator) = setup(tmp.path()).await;
        orchestrator.connect(ENABLEMENT_GROUP);

        let weak = Arc::downgrade(&orchestrator.inner);
        drop(orchestrator);
        let probe = weak.clone();
        wait_for(
            move || probe.upgrade().is_none(),
            Duration::from_secs(5),
            "orchestrator state released",
        )
        .await;
    }

    #[tokio::test]
    async fn settings_write_soft_restarts_the_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("packages");
        make_package(&root, "foo", "Foo");
        let (_store, orchestrator) = setup(tmp.path()).await;

        let unit = orchestrator.get_unit("foo").unwrap();
        unit.enable();
        let probe = unit.clone();
        wait_for(
            move || probe.pid().is_some(),
            Duration::from_secs(5),
            "first child",
        )
        .await;
        let first_pid = unit.pid().unwrap();

        unit.set_settings(&json!({"interval": 10})).unwrap();
        let probe = unit.clone();
        wait_for(
            move || probe.pid().is_some() && probe.pid() != Some(first_pid),
            Duration::from_secs(10),
            "replacement child after settings change",
        )
        .await;
        assert!(unit.is_enabled());
    }

    #[tokio::test]
    async fn appearing_directory_registers_a_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, orchestrator) = setup(tmp.path()).await;
        assert!(!orchestrator.contains("qux"));

        make_package(&tmp.path().join("packages"), "qux", "Qux");
        let probe = orchestrator.clone();
        wait_for(
            move || probe.contains("qux"),
            Duration::from_secs(10),
            "watcher registration",
        )
        .await;

        std::fs::remove_dir_all(tmp.path().join("packages/qux")).unwrap();
        let probe = orchestrator.clone();
        wait_for(
            move || !probe.contains("qux"),
            Duration::from_secs(10),
            "watcher unregistration",
        )
        .await;
    }
}
