//! Chute store: durable registry of installed chutes keyed by name.
//!
//! The whole registry is one YAML document (`name → chute`) rewritten
//! atomically on every mutation. A mutator builds the next map, persists it,
//! and only then publishes it, so the in-memory view never runs ahead of disk.
//!
//! Only the update worker mutates the store. Readers take snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chute_core::fs::{read_optional, write_atomic};
use chute_core::Chute;
use parking_lot::{Mutex, RwLock};

use crate::error::{PipelineError, Result};

#[derive(Clone)]
pub struct ChuteStore {
    chutes: Arc<RwLock<BTreeMap<String, Chute>>>,
    /// Serializes mutators so a persist never interleaves with another.
    writer: Arc<Mutex<()>>,
    path: Arc<PathBuf>,
}

impl ChuteStore {
    /// Open the registry at `path`, loading existing entries.
    ///
    /// Entries that fail to parse or validate are dropped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let chutes = load(&path)?;
        tracing::info!(path = %path.display(), count = chutes.len(), "chute store loaded");
        Ok(Self {
            chutes: Arc::new(RwLock::new(chutes)),
            writer: Arc::new(Mutex::new(())),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<Chute> {
        self.chutes.read().get(name).cloned()
    }

    /// Insert or replace a chute and persist the registry.
    pub fn put(&self, chute: Chute) -> Result<()> {
        let name = chute.name.clone();
        self.mutate(|map| {
            map.insert(chute.name.clone(), chute);
        })?;
        tracing::debug!(chute = %name, "chute stored");
        Ok(())
    }

    /// Remove a chute. Absent names are a no-op and do not touch disk.
    pub fn delete(&self, name: &str) -> Result<()> {
        if !self.chutes.read().contains_key(name) {
            return Ok(());
        }
        self.mutate(|map| {
            map.remove(name);
        })?;
        tracing::debug!(chute = %name, "chute deleted");
        Ok(())
    }

    /// Snapshot of all chutes, ordered by name.
    pub fn list(&self) -> Vec<Chute> {
        self.chutes.read().values().cloned().collect()
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(BTreeMap::clear)?;
        tracing::info!("chute store cleared");
        Ok(())
    }

    /// Replace the whole registry with `chutes`.
    pub fn replace_all(&self, chutes: Vec<Chute>) -> Result<()> {
        self.mutate(|map| {
            map.clear();
            map.extend(chutes.into_iter().map(|c| (c.name.clone(), c)));
        })
    }

    pub fn len(&self) -> usize {
        self.chutes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chutes.read().is_empty()
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, Chute>)) -> Result<()> {
        let _writer = self.writer.lock();
        let mut next = self.chutes.read().clone();
        f(&mut next);

        let text = serde_yaml::to_string(&next)?;
        write_atomic(&self.path, text.as_bytes())
            .map_err(|e| PipelineError::io(format!("write {}", self.path.display()), e))?;

        *self.chutes.write() = next;
        Ok(())
    }
}

fn load(path: &Path) -> Result<BTreeMap<String, Chute>> {
    let text = match read_optional(path)
        .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?
    {
        Some(text) if !text.trim().is_empty() => text,
        _ => return Ok(BTreeMap::new()),
    };

    let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&text)?;
    let mut chutes = BTreeMap::new();
    for (name, value) in raw {
        let chute: Chute = match serde_yaml::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(chute = %name, error = %e, "dropping unreadable store entry");
                continue;
            }
        };
        if chute.name != name {
            tracing::warn!(chute = %name, stored = %chute.name, "dropping store entry with mismatched name");
            continue;
        }
        if let Err(e) = chute.validate() {
            tracing::warn!(chute = %name, error = %e, "dropping invalid store entry");
            continue;
        }
        chutes.insert(name, chute);
    }
    Ok(chutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chute_core::{ChuteSpec, ChuteState};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "chute-store-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("chutes.yaml")
    }

    fn chute(name: &str, version: u64) -> Chute {
        let spec: ChuteSpec = serde_json::from_value(serde_json::json!({
            "version": version,
            "services": {"main": {"image": "python2", "command": "python main.py"}}
        }))
        .unwrap();
        Chute::build(name, spec, None, ChuteState::Running).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let store = ChuteStore::open(temp_path()).unwrap();
        let c = chute("seccam", 1);
        store.put(c.clone()).unwrap();
        assert_eq!(store.get("seccam"), Some(c));
        assert!(store.get("other").is_none());
    }

    #[test]
    fn disk_matches_memory_after_each_mutation() {
        let path = temp_path();
        let store = ChuteStore::open(&path).unwrap();

        store.put(chute("a", 1)).unwrap();
        store.put(chute("b", 2)).unwrap();
        assert_eq!(ChuteStore::open(&path).unwrap().list(), store.list());

        store.delete("a").unwrap();
        assert_eq!(ChuteStore::open(&path).unwrap().list(), store.list());

        store.clear().unwrap();
        assert!(ChuteStore::open(&path).unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = ChuteStore::open(temp_path()).unwrap();
        store.put(chute("a", 1)).unwrap();
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert!(store.get("a").is_none());
    }

    #[test]
    fn put_replaces_existing() {
        let store = ChuteStore::open(temp_path()).unwrap();
        store.put(chute("a", 1)).unwrap();
        store.put(chute("a", 2)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().version, 2);
    }

    #[test]
    fn invalid_entries_dropped_on_load() {
        let path = temp_path();
        let store = ChuteStore::open(&path).unwrap();
        store.put(chute("good", 1)).unwrap();

        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("bad:\n  name: bad\n  version: nope\n");
        text.push_str("renamed:\n  name: other\n  version: 1\n");
        std::fs::write(&path, text).unwrap();

        let reloaded = ChuteStore::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("good").is_some());
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = temp_path().parent().unwrap().to_path_buf();
        std::fs::create_dir_all(&dir).unwrap();
        // A directory where the registry file should be makes the rename fail.
        let path = dir.join("blocked.yaml");
        std::fs::create_dir_all(path.join("inner")).unwrap();

        let store = ChuteStore {
            chutes: Arc::new(RwLock::new(BTreeMap::new())),
            writer: Arc::new(Mutex::new(())),
            path: Arc::new(path),
        };
        let err = store.put(chute("a", 1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
        assert!(store.is_empty());
    }
}
