//! Durable key-value storage shared by the model manager and the credit ledger.
//!
//! Values are plain strings; callers parse them into their own types.
//! Writes go through [`KeyValueStore::commit`] so that related keys (for
//! example a credit balance and its reset timestamp) land together.

mod file;

pub use file::JsonFileStore;

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use thiserror::Error;

/// Logical keys of the persisted layout.
pub mod keys {
    pub const MODEL_STATE: &str = "model.state";
    pub const MODEL_PATH: &str = "model.path";
    pub const MODEL_VERSION: &str = "model.version";
    pub const CREDITS_REGULAR: &str = "credits.regular";
    pub const CREDITS_EXTRA: &str = "credits.extra";
    pub const CREDITS_LAST_RESET: &str = "credits.lastReset";
    pub const CREDITS_LAST_CONSUMED_POOL: &str = "credits.lastConsumedPool";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store contents could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Set(String, String),
    Remove(String),
}

impl Edit {
    pub fn set(key: &str, value: impl ToString) -> Self {
        Edit::Set(key.to_string(), value.to_string())
    }

    pub fn remove(key: &str) -> Self {
        Edit::Remove(key.to_string())
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Applies every edit or none of them.
    fn commit(&self, edits: &[Edit]) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.commit(&[Edit::set(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.commit(&[Edit::remove(key)])
    }
}

pub(crate) fn apply_edits(entries: &mut BTreeMap<String, String>, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Set(key, value) => {
                entries.insert(key.clone(), value.clone());
            }
            Edit::Remove(key) => {
                entries.remove(key);
            }
        }
    }
}

/// Volatile store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn commit(&self, edits: &[Edit]) -> Result<(), StoreError> {
        let mut guard = self.entries.write();
        apply_edits(&mut guard, edits);
        Ok(())
    }
}
