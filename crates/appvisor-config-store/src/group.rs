//! A single named configuration group backed by one JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use appvisor_common::Result;
use serde_json::Value;

/// One configuration group: a name, its current in-memory value, and the
/// file that backs it.
///
/// Mutations write through to disk before touching memory, so a reload
/// always observes at least the last successful `update`.
#[derive(Debug)]
pub struct ConfigGroup {
    name: String,
    path: PathBuf,
    value: Value,
}

impl ConfigGroup {
    /// Load a group from its backing file.
    pub fn load(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&raw)?;
        Ok(Self {
            name: name.into(),
            path,
            value,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Persist a new value to disk, then update memory.
    ///
    /// No partial-write recovery: a crash mid-write leaves whatever the
    /// OS completed, which is acceptable for this embedded use.
    pub fn update(&mut self, value: Value) -> Result<()> {
        fs::write(&self.path, serde_json::to_string(&value)?)?;
        self.value = value;
        Ok(())
    }

    /// Re-read the backing file into memory.
    pub fn refresh(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)?;
        self.value = serde_json::from_str(&raw)?;
        Ok(())
    }
}
