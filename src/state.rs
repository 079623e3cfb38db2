//! Per-chat capture state and the key-value port it persists through.
use eyre::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const FOLDERS_KEY: &str = "chat_folders_v7";
pub const FINGERPRINTS_KEY: &str = "chat_fingerprints_v7";
pub const LAST_CONTENT_KEY: &str = "chat_last_content_v7";

/// String key-value persistence, in the shape of browser local storage.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    fn entries(&self) -> Vec<(String, String)>;
}

#[derive(Default, Debug, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A JSON object on disk. Every write replaces the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)
                .wrap_err_with(|| format!("Failed to read state: {}", path.display()))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "state file unreadable, starting empty");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("Failed to create state dir: {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir).wrap_err("Failed to create temporary file")?;
        serde_json::to_writer_pretty(&mut tmp, &self.values).wrap_err("Failed to encode state")?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .wrap_err_with(|| format!("Failed to write state: {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.values.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

type ChatMap = BTreeMap<String, String>;

/// Folder mappings, fingerprints and tails, keyed by chat identifier.
pub struct CaptureState {
    store: Box<dyn KeyValueStore>,
    folders: ChatMap,
    fingerprints: ChatMap,
    last_content: ChatMap,
}

impl CaptureState {
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let folders = load_map(store.as_ref(), FOLDERS_KEY);
        let fingerprints = load_map(store.as_ref(), FINGERPRINTS_KEY);
        let last_content = load_map(store.as_ref(), LAST_CONTENT_KEY);
        info!(
            folders = folders.len(),
            fingerprints = fingerprints.len(),
            tails = last_content.len(),
            "capture state loaded"
        );
        Self {
            store,
            folders,
            fingerprints,
            last_content,
        }
    }

    pub fn save(&mut self) -> Result<()> {
        let folders = serde_json::to_string(&self.folders)?;
        let fingerprints = serde_json::to_string(&self.fingerprints)?;
        let last_content = serde_json::to_string(&self.last_content)?;
        self.store.set(FOLDERS_KEY, folders)?;
        self.store.set(FINGERPRINTS_KEY, fingerprints)?;
        self.store.set(LAST_CONTENT_KEY, last_content)?;
        Ok(())
    }

    pub fn folder(&self, chat_id: &str) -> Option<&str> {
        self.folders.get(chat_id).map(String::as_str)
    }

    pub fn set_folder(&mut self, chat_id: &str, folder: &str) {
        self.folders.insert(chat_id.to_string(), folder.to_string());
    }

    pub fn folders(&self) -> impl Iterator<Item = (&str, &str)> {
        self.folders.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn fingerprint(&self, chat_id: &str) -> Option<&str> {
        self.fingerprints.get(chat_id).map(String::as_str)
    }

    pub fn set_fingerprint(&mut self, chat_id: &str, fingerprint: &str) {
        self.fingerprints
            .insert(chat_id.to_string(), fingerprint.to_string());
    }

    pub fn tail(&self, chat_id: &str) -> Option<&str> {
        self.last_content.get(chat_id).map(String::as_str)
    }

    pub fn set_tail(&mut self, chat_id: &str, tail: &str) {
        self.last_content
            .insert(chat_id.to_string(), tail.to_string());
    }

    pub fn tracked_chats(&self) -> usize {
        self.folders.len()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len()
    }

    /// Forget folder mappings and fingerprints. Tails are kept; without a
    /// fingerprint they are never consulted.
    pub fn reset_mappings(&mut self) -> Result<()> {
        self.store.remove(FOLDERS_KEY)?;
        self.store.remove(FINGERPRINTS_KEY)?;
        self.folders.clear();
        self.fingerprints.clear();
        Ok(())
    }
}

fn load_map(store: &dyn KeyValueStore, key: &str) -> ChatMap {
    let Some(raw) = store.get(key) else {
        return ChatMap::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(key, error = %e, "discarding unreadable state blob");
        ChatMap::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_file_store_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut state = CaptureState::load(Box::new(JsonFileStore::open(&path).unwrap()));
        state.set_folder("Rust questions", "Learning");
        state.set_fingerprint("Rust questions", "Human: what is a lifetime?");
        state.set_tail("Rust questions", "Assistant: a region of code");
        state.save().unwrap();

        let reloaded = CaptureState::load(Box::new(JsonFileStore::open(&path).unwrap()));
        assert_eq!(reloaded.folder("Rust questions"), Some("Learning"));
        assert_eq!(
            reloaded.fingerprint("Rust questions"),
            Some("Human: what is a lifetime?")
        );
        assert_eq!(
            reloaded.tail("Rust questions"),
            Some("Assistant: a region of code")
        );
    }

    #[test]
    fn blobs_are_stored_under_versioned_keys() {
        let mut state = CaptureState::load(Box::new(MemoryStore::default()));
        state.set_folder("a", "General");
        state.save().unwrap();

        let keys: Vec<String> = state.store.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![FINGERPRINTS_KEY, FOLDERS_KEY, LAST_CONTENT_KEY]);
    }

    #[test]
    fn corrupt_blob_loads_empty() {
        let mut store = MemoryStore::default();
        store.set(FINGERPRINTS_KEY, "{not json".into()).unwrap();
        store.set(FOLDERS_KEY, r#"{"chat":"Work"}"#.into()).unwrap();
        let state = CaptureState::load(Box::new(store));
        assert_eq!(state.fingerprint_count(), 0);
        assert_eq!(state.folder("chat"), Some("Work"));
    }

    #[test]
    fn reset_clears_folders_and_fingerprints() {
        let mut state = CaptureState::load(Box::new(MemoryStore::default()));
        state.set_folder("c", "f");
        state.set_fingerprint("c", "fp");
        state.set_tail("c", "tail");
        state.save().unwrap();

        state.reset_mappings().unwrap();
        assert_eq!(state.folder("c"), None);
        assert_eq!(state.fingerprint("c"), None);
        assert_eq!(state.tail("c"), Some("tail"));
        assert!(state.store.get(FOLDERS_KEY).is_none());
    }
}
