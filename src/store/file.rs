use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::{apply_edits, Edit, KeyValueStore, StoreError};

/// Key-value store persisted as a single JSON object on disk.
///
/// Every commit rewrites the whole file through a sibling temp file and a
/// rename, so a crash mid-write leaves either the old or the new contents.
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = load_entries(&path)?;
        tracing::debug!(path = %path.display(), keys = entries.len(), "opened state store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn commit(&self, edits: &[Edit]) -> Result<(), StoreError> {
        let mut guard = self.entries.write();
        let mut next = guard.clone();
        apply_edits(&mut next, edits);
        persist_entries(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn persist_entries(path: &Path, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let serialized = serde_json::to_vec_pretty(entries)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, serialized).map_err(io_error)?;
    fs::rename(&staging, path).map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keys;

    #[test]
    fn commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store
            .commit(&[
                Edit::set(keys::MODEL_STATE, "READY"),
                Edit::set(keys::MODEL_VERSION, "v1"),
            ])
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(keys::MODEL_STATE).unwrap().as_deref(),
            Some("READY")
        );
        assert_eq!(
            reopened.get(keys::MODEL_VERSION).unwrap().as_deref(),
            Some("v1")
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_parent_directory_is_created_on_first_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set(keys::CREDITS_REGULAR, "10").unwrap();

        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let result = JsonFileStore::open(&path);
        assert!(matches!(result, Err(StoreError::Parse(_))));
    }

    #[test]
    fn empty_file_opens_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"  \n").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get(keys::MODEL_STATE).unwrap(), None);
    }
}
