//! Filesystem watches over the package storage root.
//!
//! Two watchers feed the orchestrator's event loop: a non-recursive one
//! classifying top-level directory churn (packages appearing or
//! vanishing) and a recursive one spotting writes to any unit's
//! `localdata/settings.json`. The events are advisory; handlers re-check
//! the filesystem before acting on them.

use std::path::{Path, PathBuf};

use appvisor_common::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::unit::LOCALDATA_DIR;

const SETTINGS_FILE: &str = "settings.json";

/// Classified storage-root activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchEvent {
    /// A directory appeared directly under the storage root.
    PackageDirAdded(String),
    /// A top-level entry was removed.
    PackageDirRemoved(String),
    /// A unit's settings file was written.
    SettingsChanged(String),
}

/// Start both watchers over `root`, sending classified events to `tx`.
///
/// The returned watchers must be kept alive for the OS registrations to
/// persist.
pub(crate) fn watch_packages(
    root: &Path,
    tx: mpsc::UnboundedSender<WatchEvent>,
) -> Result<(RecommendedWatcher, RecommendedWatcher)> {
    let dirs = {
        let root = root.to_path_buf();
        let tx = tx.clone();
        make_watcher(root.clone(), RecursiveMode::NonRecursive, move |event| {
            for path in &event.paths {
                if let Some(classified) = classify_dir_event(&root, &event.kind, path) {
                    let _ = tx.send(classified);
                }
            }
        })?
    };
    let settings = {
        let root = root.to_path_buf();
        make_watcher(root.clone(), RecursiveMode::Recursive, move |event| {
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                return;
            }
            for path in &event.paths {
                if let Some(unit) = settings_owner(&root, path) {
                    let _ = tx.send(WatchEvent::SettingsChanged(unit));
                }
            }
        })?
    };
    Ok((dirs, settings))
}

fn make_watcher(
    root: PathBuf,
    mode: RecursiveMode,
    mut handle: impl FnMut(notify::Event) + Send + 'static,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            handle(event);
        }
    })
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    watcher
        .watch(&root, mode)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(watcher)
}

/// Top-level create/remove classification. Creates only count when the
/// path is (still) a directory; removals are reported unconditionally and
/// filtered against the registry downstream.
fn classify_dir_event(
    root: &Path,
    kind: &notify::EventKind,
    path: &Path,
) -> Option<WatchEvent> {
    if path.parent() != Some(root) {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    match kind {
        notify::EventKind::Create(_) if path.is_dir() => {
            Some(WatchEvent::PackageDirAdded(name.to_string()))
        }
        notify::EventKind::Remove(_) => Some(WatchEvent::PackageDirRemoved(name.to_string())),
        _ => None,
    }
}

/// Match `<root>/<unit>/localdata/settings.json`, yielding the unit name.
fn settings_owner(root: &Path, path: &Path) -> Option<String> {
    if path.file_name()?.to_str()? != SETTINGS_FILE {
        return None;
    }
    let localdata = path.parent()?;
    if localdata.file_name()?.to_str()? != LOCALDATA_DIR {
        return None;
    }
    let unit_dir = localdata.parent()?;
    if unit_dir.parent() != Some(root) {
        return None;
    }
    unit_dir.file_name()?.to_str().map(|s| s.to_string())
}
