use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::TransferCacheEntry;
use crate::quota::QuotaEntry;

/// A single JSON document on disk. Writes go through a temp file followed
/// by a rename so concurrent readers see either the old or the new
/// document, never a torn one.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document. Any failure logs a warning and yields
    /// the default value; a broken ledger must not take the process down.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                if self.path.exists() {
                    tracing::warn!("failed to read {}: {}, starting empty", self.path.display(), e);
                }
                return T::default();
            }
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to parse {}: {}, starting empty", self.path.display(), e);
                T::default()
            }
        }
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = self.path.with_extension(format!("tmp-{}", std::process::id()));
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// `cache.json`: ban ledgers and the transferred-files sets, one document
/// with distinct top-level keys.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CacheDocument {
    /// uploader name -> suspended-until epoch seconds
    #[serde(default)]
    pub uploader_bans: BTreeMap<String, i64>,
    /// uploader name -> identity path -> banned-until epoch seconds (None = usable)
    #[serde(default)]
    pub sa_bans: BTreeMap<String, BTreeMap<String, Option<i64>>>,
    /// syncer name -> suspended-until epoch seconds
    #[serde(default)]
    pub syncer_bans: BTreeMap<String, i64>,
    #[serde(default)]
    pub transferred_files: BTreeMap<String, TransferCacheEntry>,
}

/// `sa_quota_cache.json`: uploader name -> identity path -> usage entry.
pub type QuotaDocument = BTreeMap<String, BTreeMap<String, QuotaEntry>>;

/// Process-wide typed registry over the two ledger files. Every mutation
/// happens under the mutex and is flushed to disk before the lock drops;
/// a flush failure is logged and the in-memory state stays authoritative
/// until the next successful write repairs the file.
pub struct Ledgers {
    cache_store: JsonStore,
    quota_store: JsonStore,
    cache: Mutex<CacheDocument>,
    quota: Mutex<QuotaDocument>,
}

impl Ledgers {
    pub fn open(state_dir: &Path) -> Self {
        let cache_store = JsonStore::new(state_dir.join("cache.json"));
        let quota_store = JsonStore::new(state_dir.join("sa_quota_cache.json"));
        let cache = cache_store.load::<CacheDocument>();
        let quota = quota_store.load::<QuotaDocument>();
        Self {
            cache_store,
            quota_store,
            cache: Mutex::new(cache),
            quota: Mutex::new(quota),
        }
    }

    fn flush_cache(&self, doc: &CacheDocument) {
        if let Err(e) = self.cache_store.save(doc) {
            tracing::warn!(
                "{}",
                crate::UploadError::LedgerIo(
                    self.cache_store.path().display().to_string(),
                    e.to_string()
                )
            );
        }
    }

    fn flush_quota(&self, doc: &QuotaDocument) {
        if let Err(e) = self.quota_store.save(doc) {
            tracing::warn!(
                "{}",
                crate::UploadError::LedgerIo(
                    self.quota_store.path().display().to_string(),
                    e.to_string()
                )
            );
        }
    }

    /// Run `f` against the cache document and flush the result.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut CacheDocument) -> R) -> R {
        let mut doc = self.cache.lock().expect("cache ledger poisoned");
        let out = f(&mut doc);
        self.flush_cache(&doc);
        out
    }

    /// Read-only view of the cache document.
    pub fn read_cache<R>(&self, f: impl FnOnce(&CacheDocument) -> R) -> R {
        let doc = self.cache.lock().expect("cache ledger poisoned");
        f(&doc)
    }

    /// Run `f` against the quota document and flush the result.
    pub fn with_quota<R>(&self, f: impl FnOnce(&mut QuotaDocument) -> R) -> R {
        let mut doc = self.quota.lock().expect("quota ledger poisoned");
        let out = f(&mut doc);
        self.flush_quota(&doc);
        out
    }

    /// Read-only view of the quota document.
    pub fn read_quota<R>(&self, f: impl FnOnce(&QuotaDocument) -> R) -> R {
        let doc = self.quota.lock().expect("quota ledger poisoned");
        f(&doc)
    }

    pub fn uploader_ban(&self, name: &str) -> Option<i64> {
        self.read_cache(|c| c.uploader_bans.get(name).copied())
    }

    pub fn set_uploader_ban(&self, name: &str, until: i64) {
        self.with_cache(|c| {
            c.uploader_bans.insert(name.to_string(), until);
        });
    }

    pub fn clear_uploader_ban(&self, name: &str) -> bool {
        self.with_cache(|c| c.uploader_bans.remove(name).is_some())
    }

    pub fn snapshot(&self) -> (CacheDocument, QuotaDocument) {
        let cache = self.cache.lock().expect("cache ledger poisoned").clone();
        let quota = self.quota.lock().expect("quota ledger poisoned").clone();
        (cache, quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("cache.json"));
        let mut doc = CacheDocument::default();
        doc.uploader_bans.insert("gdrive".into(), 1_700_000_000);
        doc.sa_bans
            .entry("gdrive".into())
            .or_default()
            .insert("/sa/sa-1.json".into(), Some(1_700_000_123));
        store.save(&doc).expect("save");

        let loaded: CacheDocument = store.load();
        assert_eq!(loaded.uploader_bans.get("gdrive"), Some(&1_700_000_000));
        assert_eq!(
            loaded.sa_bans["gdrive"].get("/sa/sa-1.json"),
            Some(&Some(1_700_000_123))
        );
    }

    #[test]
    fn corrupt_ledger_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").expect("write");
        let store = JsonStore::new(path);
        let doc: CacheDocument = store.load();
        assert!(doc.uploader_bans.is_empty());
    }

    #[test]
    fn mutation_is_visible_immediately_and_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        ledgers.set_uploader_ban("gdrive", 42);
        // read-after-mutation through the registry
        assert_eq!(ledgers.uploader_ban("gdrive"), Some(42));
        // and through a fresh load of the on-disk document
        let reread = Ledgers::open(dir.path());
        assert_eq!(reread.uploader_ban("gdrive"), Some(42));
        assert!(ledgers.clear_uploader_ban("gdrive"));
        assert_eq!(ledgers.uploader_ban("gdrive"), None);
    }
}
