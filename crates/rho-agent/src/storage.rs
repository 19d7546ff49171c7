//! Record persistence
//!
//! Records are addressed by slash-free key segments such as
//! `["message", session_id, message_id]`. [`JsonStorage`] maps each key to a
//! pretty-printed JSON file under a root directory; [`MemoryStorage`] keeps
//! everything in a map and is what tests and ephemeral runtimes use.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Key-value persistence for conversation records
pub trait Storage: Send + Sync {
    /// Write a record, replacing any previous value
    fn write(&self, key: &[&str], value: &Value) -> Result<()>;

    /// Remove a record. Removing a missing record is not an error.
    fn remove(&self, key: &[&str]) -> Result<()>;

    /// Every record whose key starts with `prefix`, in key order
    fn list(&self, prefix: &[&str]) -> Result<Vec<Value>>;
}

#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<BTreeMap<Vec<String>, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned(key: &[&str]) -> Vec<String> {
    key.iter().map(|s| s.to_string()).collect()
}

impl Storage for MemoryStorage {
    fn write(&self, key: &[&str], value: &Value) -> Result<()> {
        self.records.lock().insert(owned(key), value.clone());
        Ok(())
    }

    fn remove(&self, key: &[&str]) -> Result<()> {
        self.records.lock().remove(&owned(key));
        Ok(())
    }

    fn list(&self, prefix: &[&str]) -> Result<Vec<Value>> {
        let prefix = owned(prefix);
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value.clone())
            .collect())
    }
}

/// One JSON file per record under `root`
pub struct JsonStorage {
    root: PathBuf,
}

impl JsonStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location under the user's data directory
    pub fn default_root() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("rho").join("storage"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }

    fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect(&path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "json") {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl Storage for JsonStorage {
    fn write(&self, key: &[&str], value: &Value) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write to a sibling then rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "wrote record");
        Ok(())
    }

    fn remove(&self, key: &[&str]) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list(&self, prefix: &[&str]) -> Result<Vec<Value>> {
        let mut dir = self.root.clone();
        for segment in prefix {
            dir.push(segment);
        }
        let mut files = Vec::new();
        match Self::collect(&dir, &mut files) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            other => other?,
        }
        files
            .iter()
            .map(|path| Ok(serde_json::from_slice(&fs::read(path)?)?))
            .collect()
    }
}
