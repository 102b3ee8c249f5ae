use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Fingerprint of the uploader configuration a cache entry was built
/// under. A mismatch invalidates reads; a weekend full run re-seeds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheConfigKey {
    pub upload_remote: String,
    pub upload_folder: String,
    pub uploader_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferCacheEntry {
    pub config: CacheConfigKey,
    #[serde(default)]
    pub last_full_run: Option<i64>,
    #[serde(default)]
    pub files: BTreeSet<String>,
}

pub fn fingerprint(name: &str, remote: &crate::config::RemoteConfig) -> CacheConfigKey {
    CacheConfigKey {
        upload_remote: remote.upload_remote.clone(),
        upload_folder: remote.upload_folder.clone(),
        uploader_name: name.to_string(),
    }
}

/// Files already known to be transferred, usable as excludes. Returns an
/// empty set (with a warning) when the entry was built under a different
/// configuration; the next weekend full run will re-seed it.
pub fn cached_files(
    map: &BTreeMap<String, TransferCacheEntry>,
    name: &str,
    key: &CacheConfigKey,
) -> BTreeSet<String> {
    match map.get(name) {
        None => BTreeSet::new(),
        Some(entry) if entry.config != *key => {
            tracing::warn!("{}", crate::UploadError::ConfigFingerprintMismatch(name.to_string()));
            BTreeSet::new()
        }
        Some(entry) => entry.files.clone(),
    }
}

/// Weekend write-back: merge this run's transfers into the cache. A
/// changed configuration starts the entry fresh from this run's files.
pub fn update_full(
    map: &mut BTreeMap<String, TransferCacheEntry>,
    name: &str,
    key: &CacheConfigKey,
    transferred: &BTreeSet<String>,
    now: i64,
) {
    let files = match map.get(name) {
        Some(entry) if entry.config == *key => {
            let merged: BTreeSet<String> = entry.files.union(transferred).cloned().collect();
            tracing::info!(
                "cache update for {}: {} previous + {} new = {} total",
                name,
                entry.files.len(),
                transferred.len(),
                merged.len()
            );
            merged
        }
        Some(_) => {
            tracing::warn!("config changed for {}, starting a fresh cache", name);
            transferred.clone()
        }
        None => transferred.clone(),
    };
    map.insert(
        name.to_string(),
        TransferCacheEntry { config: key.clone(), last_full_run: Some(now), files },
    );
}

/// Weekday write-back: append this run's transfers. A first run seeds the
/// entry; a mid-week config change leaves the cache alone until the next
/// weekend re-seed.
pub fn update_incremental(
    map: &mut BTreeMap<String, TransferCacheEntry>,
    name: &str,
    key: &CacheConfigKey,
    transferred: &BTreeSet<String>,
) {
    match map.get_mut(name) {
        None => {
            tracing::info!("seeding cache for {} with {} file(s)", name, transferred.len());
            map.insert(
                name.to_string(),
                TransferCacheEntry {
                    config: key.clone(),
                    last_full_run: None,
                    files: transferred.clone(),
                },
            );
        }
        Some(entry) if entry.config != *key => {
            tracing::warn!("config changed mid-week for {}, cache untouched until weekend", name);
        }
        Some(entry) => {
            let before = entry.files.len();
            entry.files.extend(transferred.iter().cloned());
            tracing::info!(
                "cache update for {}: added {} file(s), {} total",
                name,
                entry.files.len() - before,
                entry.files.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheConfigKey {
        CacheConfigKey {
            upload_remote: "gdrive:/Media".into(),
            upload_folder: "/mnt/local/Media".into(),
            uploader_name: "gdrive".into(),
        }
    }

    fn files(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mismatched_fingerprint_yields_no_excludes() {
        let mut map = BTreeMap::new();
        map.insert(
            "gdrive".to_string(),
            TransferCacheEntry {
                config: CacheConfigKey { upload_folder: "/elsewhere".into(), ..key() },
                last_full_run: None,
                files: files(&["a.mkv"]),
            },
        );
        assert!(cached_files(&map, "gdrive", &key()).is_empty());
    }

    #[test]
    fn full_update_merges_and_stamps_run() {
        let mut map = BTreeMap::new();
        update_full(&mut map, "gdrive", &key(), &files(&["a.mkv", "b.mkv"]), 100);
        update_full(&mut map, "gdrive", &key(), &files(&["b.mkv", "c.mkv"]), 200);
        let entry = &map["gdrive"];
        assert_eq!(entry.files, files(&["a.mkv", "b.mkv", "c.mkv"]));
        assert_eq!(entry.last_full_run, Some(200));
    }

    #[test]
    fn full_update_reseeds_on_config_change() {
        let mut map = BTreeMap::new();
        update_full(&mut map, "gdrive", &key(), &files(&["a.mkv"]), 100);
        let new_key = CacheConfigKey { upload_folder: "/moved".into(), ..key() };
        update_full(&mut map, "gdrive", &new_key, &files(&["z.mkv"]), 200);
        assert_eq!(map["gdrive"].files, files(&["z.mkv"]));
        assert_eq!(map["gdrive"].config, new_key);
    }

    #[test]
    fn incremental_update_grows_monotonically() {
        let mut map = BTreeMap::new();
        update_incremental(&mut map, "gdrive", &key(), &files(&["a.mkv"]));
        update_incremental(&mut map, "gdrive", &key(), &files(&["b.mkv"]));
        assert_eq!(map["gdrive"].files, files(&["a.mkv", "b.mkv"]));
        assert_eq!(map["gdrive"].last_full_run, None);
    }

    #[test]
    fn incremental_update_skips_on_config_change() {
        let mut map = BTreeMap::new();
        update_incremental(&mut map, "gdrive", &key(), &files(&["a.mkv"]));
        let new_key = CacheConfigKey { upload_remote: "gd2:/Media".into(), ..key() };
        update_incremental(&mut map, "gdrive", &new_key, &files(&["z.mkv"]));
        // untouched until the weekend full run
        assert_eq!(map["gdrive"].files, files(&["a.mkv"]));
        assert_eq!(map["gdrive"].config, key());
    }
}
