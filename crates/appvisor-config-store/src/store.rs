//! The watching configuration store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use appvisor_common::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::group::ConfigGroup;

/// Well-known group holding per-package enablement directives
/// (`{ "<name>": { "enabled": bool }, .. }`). Auto-created at startup so
/// first-run installs never have to special-case a missing group.
pub const ENABLEMENT_GROUP: &str = "packageconfigurations";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Store-level events broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The initial directory scan completed. Emitted exactly once.
    Ready,
    /// A group file appeared and was loaded.
    GroupAdded(String),
    /// A group file changed on disk and was reloaded.
    Refresh(String),
}

/// Persisted key/value configuration groups with change notification.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    groups: RwLock<HashMap<String, ConfigGroup>>,
    events: broadcast::Sender<StoreEvent>,
    ready: AtomicBool,
    // Held only to keep the OS watch registration alive.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigStore {
    /// Open the store over a directory of `<group>.json` files.
    ///
    /// Creates the directory and the default enablement group if absent,
    /// loads every group, and starts the directory watcher. The initial
    /// scan is complete once this returns.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let default_path = dir.join(format!("{ENABLEMENT_GROUP}.json"));
        if !default_path.exists() {
            debug!(group = ENABLEMENT_GROUP, "creating default configuration group");
            tokio::fs::write(&default_path, "{}").await?;
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(StoreInner {
            dir: dir.clone(),
            groups: RwLock::new(HashMap::new()),
            events,
            ready: AtomicBool::new(false),
            _watcher: Mutex::new(None),
        });

        // Initial scan.
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(name) = group_name(&path) {
                match ConfigGroup::load(&name, &path) {
                    Ok(group) => {
                        debug!(group = %name, "configuration group loaded");
                        inner.groups.write().insert(name, group);
                    }
                    Err(err) => {
                        // Fatal for this group only; the store keeps going.
                        error!(group = %name, %err, "failed to load configuration group");
                    }
                }
            }
        }

        // Bridge notify callbacks into a tokio task.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            },
        )
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        *inner._watcher.lock() = Some(watcher);

        tokio::spawn(watch_loop(Arc::downgrade(&inner), rx));

        inner.ready.store(true, Ordering::SeqCst);
        let _ = inner.events.send(StoreEvent::Ready);
        info!(dir = %dir.display(), groups = inner.groups.read().len(), "configuration store ready");

        Ok(Self { inner })
    }

    /// Current value of a group, or `{}` if the group does not exist.
    /// Absence is a legitimate default, never an error.
    pub fn get(&self, group: &str) -> Value {
        self.inner
            .groups
            .read()
            .get(group)
            .map(|g| g.value().clone())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Persist a new value for a group that was previously loaded.
    pub fn update(&self, group: &str, value: Value) -> Result<()> {
        let mut groups = self.inner.groups.write();
        let entry = groups
            .get_mut(group)
            .ok_or_else(|| Error::unknown_group(group))?;
        entry.update(value)
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

/// Derive a group name from a `*.json` path.
fn group_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

/// Consume filesystem notifications and fold them into the group map.
async fn watch_loop(
    inner: Weak<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    while let Some(res) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "configuration watcher error");
                continue;
            }
        };
        if !matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) {
            continue;
        }
        for path in &event.paths {
            let Some(name) = group_name(path) else {
                continue;
            };
            handle_group_file(&inner, &name, path);
        }
    }
}

fn handle_group_file(inner: &StoreInner, name: &str, path: &Path) {
    let mut groups = inner.groups.write();
    match groups.get_mut(name) {
        Some(group) => match group.refresh() {
            Ok(()) => {
                debug!(group = %name, "configuration group refreshed");
                let _ = inner.events.send(StoreEvent::Refresh(name.to_string()));
            }
            Err(err) => {
                // Leave the previous value in place; the group is stale
                // until a subsequent valid write.
                error!(group = %name, %err, "failed to refresh configuration group");
            }
        },
        None => match ConfigGroup::load(name, path) {
            Ok(group) => {
                debug!(group = %name, "configuration group added");
                groups.insert(name.to_string(), group);
                let _ = inner.events.send(StoreEvent::GroupAdded(name.to_string()));
            }
            Err(err) => {
                error!(group = %name, %err, "failed to load new configuration group");
            }
        },
    }
}
