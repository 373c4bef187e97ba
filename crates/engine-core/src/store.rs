//! Persistent key-value state
//!
//! Saves and loads a JSON file inside the session workspace. Values are
//! script values, so byte strings and integer/float distinctions survive
//! a round trip.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_policy::resolve_workspace_path;
use tether_protocol::{Rejection, ScriptValue};

/// Store file schema version
pub const STORE_VERSION: u32 = 1;

/// Longest key accepted by `set`
pub const MAX_KEY_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, ScriptValue>,
}

/// A key-value store backed by one workspace file
#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    entries: BTreeMap<String, ScriptValue>,
    dirty: bool,
}

impl KvStore {
    /// Open `relative` inside `workspace_root`, loading it if it exists
    pub fn open(workspace_root: &Path, relative: &str) -> Result<Self, StoreError> {
        let path = resolve_workspace_path(relative, workspace_root).map_err(StoreError::Rejected)?;
        let entries = if path.exists() {
            Self::load(&path)?.entries
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "Store opened");
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    fn load(path: &Path) -> Result<StoreFile, StoreError> {
        let content = fs::read_to_string(path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        let file: StoreFile = serde_json::from_str(&content).map_err(|e| StoreError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        if file.version > STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                file_version: file.version,
                supported_version: STORE_VERSION,
            });
        }

        Ok(file)
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.entries.get(key)
    }

    /// Set a value; returns the previous one
    pub fn set(&mut self, key: &str, value: ScriptValue) -> Result<Option<ScriptValue>, StoreError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidKey(key.chars().take(32).collect()));
        }
        if let Some(type_name) = unstorable(&value) {
            return Err(StoreError::Unstorable(type_name.to_string()));
        }
        self.dirty = true;
        Ok(self.entries.insert(key.to_string(), value))
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    /// Keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store to disk if it changed since the last flush
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }

        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.entries.clone(),
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| StoreError::SerializeError {
                error: e.to_string(),
            })?;

        let io_err = |path: &Path, e: std::io::Error| StoreError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        // Write then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;

        self.dirty = false;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "Store flushed");
        Ok(())
    }
}

fn unstorable(value: &ScriptValue) -> Option<&str> {
    match value {
        ScriptValue::Opaque(type_name) => Some(type_name),
        ScriptValue::Table(pairs) => pairs
            .iter()
            .find_map(|(k, v)| unstorable(k).or_else(|| unstorable(v))),
        _ => None,
    }
}

/// Store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error for {path}: {error}")]
    Io { path: String, error: String },

    #[error("Failed to parse {path}: {error}")]
    ParseError { path: String, error: String },

    #[error("Failed to serialize store: {error}")]
    SerializeError { error: String },

    #[error("Store version {file_version} is newer than supported version {supported_version}")]
    VersionMismatch {
        file_version: u32,
        supported_version: u32,
    },

    #[error("Store path rejected: {0}")]
    Rejected(Rejection),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Cannot store a {0} value")]
    Unstorable(String),
}
