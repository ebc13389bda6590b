//! Download and merge cache.
//!
//! Entries are keyed by a fingerprint of `(repository id or local path,
//! quant filter)` and recorded in `<root>/index.json`. The backing files live
//! under the cache root:
//!
//! ```text
//! <root>/
//!   downloads/<key>/...        remote downloads
//!   merged/<key>/<base>.gguf   merge outputs
//!   work/run-<uuid>/           per-run scratch space (never indexed)
//!   index.json
//!   .lock
//! ```
//!
//! Every read-modify-write of the index holds an exclusive advisory lock on
//! `.lock`. Files outside the cache root are never indexed, so clearing the
//! cache cannot touch a user's own model files.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PathsConfig;
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::{Result, ToolfitError};

const INDEX_VERSION: u32 = 1;

/// A model file ready for registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    /// Absolute path.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub is_merged: bool,
}

impl ResolvedArtifact {
    /// Describe an existing file, making its path absolute.
    pub fn from_path(path: &Path, is_merged: bool) -> Result<Self> {
        let path = std::path::absolute(path).map_err(|e| ToolfitError::io_with_path(e, path))?;
        let size_bytes = fs::metadata(&path)
            .map_err(|e| ToolfitError::io_with_path(e, &path))?
            .len();
        Ok(Self {
            path,
            size_bytes,
            is_merged,
        })
    }
}

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Reference the key was computed from, kept for `cache info`.
    pub reference: String,
    #[serde(default)]
    pub quant_filter: Option<String>,
    pub artifact_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub is_merged: bool,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        reference: impl Into<String>,
        quant_filter: Option<String>,
        artifact: &ResolvedArtifact,
    ) -> Self {
        Self {
            key: key.into(),
            reference: reference.into(),
            quant_filter,
            artifact_path: artifact.path.clone(),
            created_at: Utc::now(),
            size_bytes: artifact.size_bytes,
            is_merged: artifact.is_merged,
        }
    }

    pub fn artifact(&self) -> ResolvedArtifact {
        ResolvedArtifact {
            path: self.artifact_path.clone(),
            size_bytes: self.size_bytes,
            is_merged: self.is_merged,
        }
    }

    /// Whether the backing file still exists with the recorded size.
    fn is_fresh(&self) -> bool {
        match fs::metadata(&self.artifact_path) {
            Ok(meta) => meta.is_file() && meta.len() == self.size_bytes,
            Err(_) => false,
        }
    }
}

/// The JSON root object of `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Directories under the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheArea {
    Downloads,
    Merged,
    Work,
}

impl CacheArea {
    pub const ALL: [CacheArea; 3] = [CacheArea::Downloads, CacheArea::Merged, CacheArea::Work];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheArea::Downloads => PathsConfig::DOWNLOADS_DIR_NAME,
            CacheArea::Merged => PathsConfig::MERGED_DIR_NAME,
            CacheArea::Work => PathsConfig::WORK_DIR_NAME,
        }
    }
}

impl std::fmt::Display for CacheArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.dir_name())
    }
}

/// Size of one cache area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheAreaInfo {
    pub area: CacheArea,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Snapshot of the cache, as reported by `cache info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub root: PathBuf,
    pub areas: Vec<CacheAreaInfo>,
    pub entry_count: usize,
    /// Sum of the recorded sizes of all index entries.
    pub entries_size_bytes: u64,
}

impl CacheInfo {
    /// Bytes on disk across all areas.
    pub fn total_bytes(&self) -> u64 {
        self.areas.iter().map(|a| a.size_bytes).sum()
    }
}

/// What a clear removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    pub areas_removed: Vec<CacheArea>,
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

/// Exclusive lock on the cache; released on drop.
struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release cache lock: {}", e);
        }
    }
}

/// Persistent cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// A relative `root` is made absolute against the current directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn area_dir(&self, area: CacheArea) -> PathBuf {
        self.root.join(area.dir_name())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(PathsConfig::INDEX_FILE_NAME)
    }

    /// Compute the cache key for a reference and quant filter.
    ///
    /// Stable across runs and platforms; the quant filter is compared
    /// case-insensitively.
    pub fn fingerprint(reference: &str, quant_filter: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(reference.trim().as_bytes());
        hasher.update([0u8]);
        if let Some(quant) = quant_filter {
            hasher.update(quant.trim().to_ascii_uppercase().as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }

    /// Directory a remote download for `key` is written to.
    pub fn download_dir(&self, key: &str) -> PathBuf {
        self.area_dir(CacheArea::Downloads).join(key)
    }

    /// Destination of a merge output for `key`.
    pub fn merged_path(&self, key: &str, file_name: &str) -> PathBuf {
        self.area_dir(CacheArea::Merged).join(key).join(file_name)
    }

    /// Whether `path` lies inside this cache root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    fn lock(&self) -> Result<IndexLock> {
        fs::create_dir_all(&self.root)
            .map_err(|e| ToolfitError::io("creating cache root", &self.root, e))?;
        let lock_path = self.root.join(PathsConfig::LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ToolfitError::io("opening cache lock", &lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| ToolfitError::io("locking cache", &lock_path, e))?;
        Ok(IndexLock { file })
    }

    fn load_index(&self) -> CacheIndex {
        let path = self.index_path();
        match atomic_read_json::<CacheIndex>(&path) {
            Ok(Some(index)) => index,
            Ok(None) => CacheIndex::default(),
            Err(e) => {
                warn!("Ignoring unreadable cache index at {}: {}", path.display(), e);
                CacheIndex::default()
            }
        }
    }

    fn write_index(&self, index: &CacheIndex) -> Result<()> {
        debug!("Writing {} cache entries to {}", index.entries.len(), self.index_path().display());
        atomic_write_json(&self.index_path(), index)
    }

    /// Look up a fresh entry.
    ///
    /// An entry whose file is gone or whose size changed is dropped from the
    /// index and reported as a miss.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _lock = self.lock()?;
        let mut index = self.load_index();

        let Some(entry) = index.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_fresh() {
            debug!("Cache hit for {}: {}", key, entry.artifact_path.display());
            return Ok(Some(entry.clone()));
        }

        info!(
            "Cached artifact {} is missing or changed; ignoring it",
            entry.artifact_path.display()
        );
        index.entries.remove(key);
        self.write_index(&index)?;
        Ok(None)
    }

    /// Insert or replace the entry for `entry.key`.
    pub fn put(&self, entry: CacheEntry) -> Result<()> {
        if !self.contains(&entry.artifact_path) {
            return Err(ToolfitError::Config {
                message: format!(
                    "refusing to cache {} because it is outside the cache root {}",
                    entry.artifact_path.display(),
                    self.root.display()
                ),
            });
        }

        let _lock = self.lock()?;
        let mut index = self.load_index();
        debug!("Caching {} -> {}", entry.key, entry.artifact_path.display());
        index.entries.insert(entry.key.clone(), entry);
        self.write_index(&index)
    }

    /// Remove an entry from the index, leaving its file alone.
    pub fn remove(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _lock = self.lock()?;
        let mut index = self.load_index();
        let removed = index.entries.remove(key);
        if removed.is_some() {
            self.write_index(&index)?;
        }
        Ok(removed)
    }

    /// All index entries, including stale ones.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.load_index().entries.into_values().collect()
    }

    /// Delete the given areas and every index entry stored in them.
    pub fn clear(&self, areas: &[CacheArea]) -> Result<ClearSummary> {
        let _lock = self.lock()?;
        let mut index = self.load_index();
        let mut summary = ClearSummary::default();

        for &area in areas {
            let dir = self.area_dir(area);
            if !dir.exists() {
                continue;
            }
            summary.bytes_freed += dir_size(&dir);
            fs::remove_dir_all(&dir).map_err(|e| ToolfitError::io("removing cache area", &dir, e))?;
            info!("Removed {}", dir.display());
            summary.areas_removed.push(area);
        }

        let cleared: Vec<PathBuf> = areas.iter().map(|a| self.area_dir(*a)).collect();
        let before = index.entries.len();
        index
            .entries
            .retain(|_, entry| !cleared.iter().any(|dir| entry.artifact_path.starts_with(dir)));
        summary.entries_removed = before - index.entries.len();
        if summary.entries_removed > 0 {
            self.write_index(&index)?;
        }

        Ok(summary)
    }

    /// Report area sizes and index totals. Creates nothing.
    pub fn info(&self) -> CacheInfo {
        let areas = CacheArea::ALL
            .iter()
            .map(|&area| {
                let path = self.area_dir(area);
                CacheAreaInfo {
                    area,
                    size_bytes: dir_size(&path),
                    path,
                }
            })
            .collect();

        let index = self.load_index();
        CacheInfo {
            root: self.root.clone(),
            areas,
            entry_count: index.entries.len(),
            entries_size_bytes: index.entries.values().map(|e| e.size_bytes).sum(),
        }
    }
}

/// Total size of the regular files under `path`; 0 when it does not exist.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Human-readable byte count (`512 B`, `1.50 GB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cached_file(store: &CacheStore, key: &str, bytes: &[u8]) -> ResolvedArtifact {
        let dir = store.download_dir(key);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model-Q4_0.gguf");
        fs::write(&path, bytes).unwrap();
        ResolvedArtifact::from_path(&path, false).unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = CacheStore::fingerprint("owner/repo", Some("Q4_0"));
        let b = CacheStore::fingerprint("owner/repo", Some("q4_0"));
        let c = CacheStore::fingerprint("owner/repo", None);
        let d = CacheStore::fingerprint("owner/repo2", Some("Q4_0"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_put_then_get() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", None);
        let artifact = cached_file(&store, &key, b"GGUF1234");

        store
            .put(CacheEntry::new(&key, "owner/repo", None, &artifact))
            .unwrap();

        let entry = store.get(&key).unwrap().unwrap();
        assert_eq!(entry.artifact(), artifact);
        assert_eq!(entry.size_bytes, 8);
    }

    #[test]
    fn test_put_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", None);
        let artifact = cached_file(&store, &key, b"GGUF");

        store.put(CacheEntry::new(&key, "owner/repo", None, &artifact)).unwrap();
        store.put(CacheEntry::new(&key, "owner/repo", None, &artifact)).unwrap();

        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_deleted_file_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", None);
        let artifact = cached_file(&store, &key, b"GGUF");
        store.put(CacheEntry::new(&key, "owner/repo", None, &artifact)).unwrap();

        fs::remove_file(&artifact.path).unwrap();

        assert!(store.get(&key).unwrap().is_none());
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_resized_file_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", Some("Q8_0"));
        let artifact = cached_file(&store, &key, b"GGUF");
        store
            .put(CacheEntry::new(&key, "owner/repo", Some("Q8_0".into()), &artifact))
            .unwrap();

        fs::write(&artifact.path, b"GGUF-truncated-or-grown").unwrap();

        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_refuses_files_outside_root() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let path = outside.path().join("mine.gguf");
        fs::write(&path, b"GGUF").unwrap();

        let store = CacheStore::new(tmp.path().join("cache"));
        let artifact = ResolvedArtifact::from_path(&path, false).unwrap();
        let result = store.put(CacheEntry::new("k", "local", None, &artifact));
        assert!(matches!(result, Err(ToolfitError::Config { .. })));
    }

    #[test]
    fn test_clear_selected_areas() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", None);
        let download = cached_file(&store, &key, b"0123456789");
        store.put(CacheEntry::new(&key, "owner/repo", None, &download)).unwrap();

        let merged_path = store.merged_path("other", "model.gguf");
        fs::create_dir_all(merged_path.parent().unwrap()).unwrap();
        fs::write(&merged_path, b"merged").unwrap();
        let merged = ResolvedArtifact::from_path(&merged_path, true).unwrap();
        store.put(CacheEntry::new("other", "local", None, &merged)).unwrap();

        let summary = store.clear(&[CacheArea::Downloads]).unwrap();
        assert_eq!(summary.areas_removed, vec![CacheArea::Downloads]);
        assert_eq!(summary.entries_removed, 1);
        assert_eq!(summary.bytes_freed, 10);
        assert!(merged_path.exists());
        assert_eq!(store.entries().len(), 1);

        let summary = store.clear(&CacheArea::ALL).unwrap();
        assert_eq!(summary.entries_removed, 1);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_info_has_no_side_effects() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        let store = CacheStore::new(&root);

        let info = store.info();
        assert_eq!(info.entry_count, 0);
        assert_eq!(info.total_bytes(), 0);
        assert_eq!(info.areas.len(), 3);
        assert!(!root.exists());
    }

    #[test]
    fn test_info_totals() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        let key = CacheStore::fingerprint("owner/repo", None);
        let artifact = cached_file(&store, &key, b"0123456789");
        store.put(CacheEntry::new(&key, "owner/repo", None, &artifact)).unwrap();
        fs::create_dir_all(store.area_dir(CacheArea::Work).join("run-x")).unwrap();
        fs::write(store.area_dir(CacheArea::Work).join("run-x/Modelfile"), b"FROM").unwrap();

        let info = store.info();
        assert_eq!(info.entry_count, 1);
        assert_eq!(info.entries_size_bytes, 10);
        assert_eq!(info.total_bytes(), 14);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
