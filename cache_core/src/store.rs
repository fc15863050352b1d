use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::entry::{CacheEntry, CacheIndex, CacheStats};
use crate::error::{CacheError, Result};
use crate::persist::Debouncer;

/// Name of the JSON index inside the cache directory
pub const INDEX_FILE_NAME: &str = "index.json";
/// Prefix of in-progress writes; never treated as orphans
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_size_bytes: u64,
    /// Fraction of the limit above which the age phase runs
    pub eviction_threshold: f64,
    pub index_debounce: Duration,
    /// Extension of the audio files, without the dot
    pub extension: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache/audio"),
            max_size_bytes: 500 * 1024 * 1024,
            eviction_threshold: 0.85,
            index_debounce: Duration::from_secs(2),
            extension: "wav".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_bytes = mb * 1024 * 1024;
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_index_debounce(mut self, debounce: Duration) -> Self {
        self.index_debounce = debounce;
        self
    }
}

#[derive(Debug, Default)]
struct CacheState {
    index: CacheIndex,
    pinned: HashSet<String>,
    /// Keys whose file is being written but not yet indexed
    writing: HashSet<String>,
}

#[derive(Debug)]
struct Inner {
    config: CacheConfig,
    max_size_bytes: AtomicU64,
    current_size_bytes: AtomicU64,
    state: Mutex<CacheState>,
    persister: Debouncer,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Content-addressed audio store with a persisted index.
///
/// Cloning is cheap; all clones share the same directory and index. The
/// store is the only component that creates or deletes files in its
/// directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Open (or create) a cache directory and reconcile it with its index.
    ///
    /// Index rows whose file is missing are dropped, sizes are re-read from
    /// disk, and audio files with no index row are deleted. Call from within
    /// a tokio runtime to get debounced index writes; outside one every
    /// mutation writes the index immediately.
    pub fn open(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;

        let (index, changed) = load_index(&config)?;
        let total: u64 = index.values().map(|e| e.size_bytes).sum();
        info!(
            dir = %config.cache_dir.display(),
            entries = index.len(),
            size_bytes = total,
            "Audio cache opened"
        );

        let store = Self {
            inner: Arc::new(Inner {
                max_size_bytes: AtomicU64::new(config.max_size_bytes),
                current_size_bytes: AtomicU64::new(total),
                state: Mutex::new(CacheState {
                    index,
                    ..CacheState::default()
                }),
                persister: Debouncer::new(config.index_debounce),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                config,
            }),
        };

        let removed = store.sweep_orphans();
        if changed || removed > 0 {
            store.mark_dirty();
        }
        store.evict_if_needed();
        Ok(store)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.config.cache_dir
    }

    /// Path a key's audio file lives at (whether or not it exists).
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.inner
            .config
            .cache_dir
            .join(format!("{}.{}", key, self.inner.config.extension))
    }

    /// Look up a key, returning its file path on a hit.
    ///
    /// A hit bumps the entry's access time and hit count. An entry whose
    /// file has disappeared is dropped from the index and reported as a miss.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let path = self.path_for(key);
        let exists = path.is_file();

        let mut state = self.lock();
        match state.index.get_mut(key) {
            None => {
                drop(state);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) if exists => {
                entry.record_access();
                drop(state);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                self.mark_dirty();
                Some(path)
            }
            Some(_) => {
                if let Some(stale) = state.index.remove(key) {
                    self.inner
                        .current_size_bytes
                        .fetch_sub(stale.size_bytes, Ordering::SeqCst);
                }
                drop(state);
                warn!(key = %key, "Cached file missing on disk, dropping index entry");
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.mark_dirty();
                None
            }
        }
    }

    /// Whether a key is indexed and its file exists. Does not count as a hit.
    pub fn contains(&self, key: &str) -> bool {
        let indexed = self.lock().index.contains_key(key);
        indexed && self.path_for(key).is_file()
    }

    /// Snapshot of a key's index entry.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.lock().index.get(key).cloned()
    }

    /// Store audio bytes under `key`, replacing any previous entry, then run
    /// eviction if the store is over its limit.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        validate_key(key)?;
        let path = self.path_for(key);

        self.lock().writing.insert(key.to_string());
        let written = write_atomic(&path, bytes);

        {
            let mut state = self.lock();
            state.writing.remove(key);
            written?;

            let size = bytes.len() as u64;
            let previous = state.index.insert(key.to_string(), CacheEntry::new(size));
            self.inner.current_size_bytes.fetch_add(size, Ordering::SeqCst);
            if let Some(previous) = previous {
                self.inner
                    .current_size_bytes
                    .fetch_sub(previous.size_bytes, Ordering::SeqCst);
            }
        }

        debug!(key = %key, bytes = bytes.len(), "Audio cached");
        self.mark_dirty();
        self.evict_if_needed();
        Ok(path)
    }

    /// Remove a single entry and its file. Pinned entries are left alone.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            if state.pinned.contains(key) {
                return false;
            }
            state.index.remove(key)
        };

        match removed {
            Some(entry) => {
                self.inner
                    .current_size_bytes
                    .fetch_sub(entry.size_bytes, Ordering::SeqCst);
                self.delete_files(&[key.to_string()]);
                self.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Drop every entry that is not pinned. Returns the number removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<String> = {
            let mut state = self.lock();
            let CacheState { index, pinned, .. } = &mut *state;
            let keys: Vec<String> = index
                .keys()
                .filter(|k| !pinned.contains(*k))
                .cloned()
                .collect();
            for key in &keys {
                if let Some(entry) = index.remove(key) {
                    self.inner
                        .current_size_bytes
                        .fetch_sub(entry.size_bytes, Ordering::SeqCst);
                }
            }
            keys
        };

        self.delete_files(&removed);
        if !removed.is_empty() {
            info!(removed = removed.len(), "Audio cache cleared");
            self.mark_dirty();
        }
        removed.len()
    }

    /// Protect a key from eviction while it is being played.
    pub fn pin(&self, key: &str) {
        self.lock().pinned.insert(key.to_string());
    }

    pub fn unpin(&self, key: &str) {
        self.lock().pinned.remove(key);
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.lock().pinned.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_size_bytes(&self) -> u64 {
        self.inner.current_size_bytes.load(Ordering::SeqCst)
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.inner.max_size_bytes.load(Ordering::SeqCst)
    }

    /// Change the size limit, evicting immediately if it is now exceeded.
    pub fn set_max_size_bytes(&self, bytes: u64) {
        self.inner.max_size_bytes.store(bytes, Ordering::SeqCst);
        self.evict_if_needed();
    }

    pub fn usage_percent(&self) -> f64 {
        let max = self.max_size_bytes();
        if max == 0 {
            return 100.0;
        }
        self.current_size_bytes() as f64 / max as f64 * 100.0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, pinned) = {
            let state = self.lock();
            (state.index.len(), state.pinned.len())
        };
        CacheStats {
            entries,
            pinned,
            size_bytes: self.current_size_bytes(),
            max_size_bytes: self.max_size_bytes(),
            usage_percent: self.usage_percent(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Write the index now, regardless of any pending debounce timer.
    pub fn flush(&self) -> Result<()> {
        self.inner.persister.take_dirty();
        let result = self.write_index();
        if result.is_err() {
            self.inner.persister.restore_dirty();
        }
        result
    }

    /// Run eviction if the store is over its size limit.
    ///
    /// Phase one drops every unpinned entry that was never read back. If
    /// usage is still above the threshold fraction, phase two drops the
    /// least recently accessed half of the unpinned entries, repeating while
    /// usage exceeds the limit. Orphaned files are swept afterwards.
    pub fn evict_if_needed(&self) -> usize {
        let max = self.max_size_bytes();
        if self.current_size_bytes() <= max {
            return 0;
        }

        let mut removed = self.compress_phase();
        let threshold = (max as f64 * self.inner.config.eviction_threshold) as u64;
        if self.current_size_bytes() > threshold {
            loop {
                let aged = self.age_phase();
                let done = aged.is_empty() || self.current_size_bytes() <= max;
                removed.extend(aged);
                if done {
                    break;
                }
            }
        }

        let count = removed.len();
        if count > 0 {
            self.delete_files(&removed);
            self.inner.evictions.fetch_add(count as u64, Ordering::Relaxed);
            info!(
                evicted = count,
                size_bytes = self.current_size_bytes(),
                limit_bytes = max,
                "Audio cache eviction"
            );
            self.mark_dirty();
        }
        self.sweep_orphans();
        count
    }

    fn compress_phase(&self) -> Vec<String> {
        let mut state = self.lock();
        let CacheState {
            index,
            pinned,
            writing,
        } = &mut *state;

        let victims: Vec<String> = index
            .iter()
            .filter(|(k, e)| e.is_unused() && !pinned.contains(*k) && !writing.contains(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            if let Some(entry) = index.remove(key) {
                self.inner
                    .current_size_bytes
                    .fetch_sub(entry.size_bytes, Ordering::SeqCst);
            }
        }
        victims
    }

    fn age_phase(&self) -> Vec<String> {
        let mut state = self.lock();
        let CacheState { index, pinned, .. } = &mut *state;

        let mut candidates: Vec<(&String, &CacheEntry)> = index
            .iter()
            .filter(|(k, _)| !pinned.contains(*k))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by(|a, b| {
            a.1.last_access_time
                .cmp(&b.1.last_access_time)
                .then(a.1.created_time.cmp(&b.1.created_time))
                .then(a.0.cmp(b.0))
        });

        let take = (candidates.len() / 2).max(1);
        let victims: Vec<String> = candidates.into_iter().take(take).map(|(k, _)| k.clone()).collect();
        for key in &victims {
            if let Some(entry) = index.remove(key) {
                self.inner
                    .current_size_bytes
                    .fetch_sub(entry.size_bytes, Ordering::SeqCst);
            }
        }
        victims
    }

    /// Delete files for keys that are no longer indexed.
    fn delete_files(&self, keys: &[String]) {
        let doomed: Vec<PathBuf> = {
            let state = self.lock();
            keys.iter()
                .filter(|k| !state.index.contains_key(*k) && !state.writing.contains(*k))
                .map(|k| self.path_for(k))
                .collect()
        };

        for path in doomed {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to delete cached file: {e}"),
            }
        }
    }

    /// Delete audio files in the cache directory with no index entry.
    fn sweep_orphans(&self) -> usize {
        let read_dir = match fs::read_dir(self.cache_dir()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to scan cache directory: {e}");
                return 0;
            }
        };

        let candidates: Vec<(String, PathBuf)> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && self.is_audio_file(p))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?.to_string();
                Some((stem, p))
            })
            .collect();

        let orphans: Vec<PathBuf> = {
            let state = self.lock();
            candidates
                .into_iter()
                .filter(|(stem, _)| !state.index.contains_key(stem) && !state.writing.contains(stem))
                .map(|(_, p)| p)
                .collect()
        };

        let mut removed = 0;
        for path in orphans {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed orphaned cache file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), "Failed to remove orphaned file: {e}"),
            }
        }
        removed
    }

    fn is_audio_file(&self, path: &Path) -> bool {
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(TEMP_PREFIX))
            .unwrap_or(true);
        !is_temp
            && path.extension().and_then(|e| e.to_str()) == Some(self.inner.config.extension.as_str())
    }

    fn mark_dirty(&self) {
        let store = self.clone();
        self.inner.persister.mark_dirty(move || {
            if store.inner.persister.take_dirty() {
                if let Err(e) = store.write_index() {
                    warn!("Failed to persist cache index: {e}");
                    store.inner.persister.restore_dirty();
                }
            }
        });
    }

    fn write_index(&self) -> Result<()> {
        let snapshot = self.lock().index.clone();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.cache_dir().join(INDEX_FILE_NAME), &json)?;
        debug!(entries = snapshot.len(), "Cache index persisted");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read the index and reconcile it with the directory contents.
///
/// Returns the index and whether it differs from what was on disk. A missing
/// index starts empty. An unreadable one is rebuilt from the audio files
/// present, with zero hits.
fn load_index(config: &CacheConfig) -> Result<(CacheIndex, bool)> {
    let index_path = config.cache_dir.join(INDEX_FILE_NAME);
    let (raw, mut changed) = match fs::read_to_string(&index_path) {
        Ok(text) => match serde_json::from_str::<CacheIndex>(&text) {
            Ok(index) => (index, false),
            Err(e) => {
                warn!("Cache index is corrupt ({e}), rebuilding from files on disk");
                (rebuild_index(config)?, true)
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => (CacheIndex::new(), false),
        Err(e) => return Err(e.into()),
    };

    let mut index = CacheIndex::with_capacity(raw.len());
    for (key, mut entry) in raw {
        if validate_key(&key).is_err() {
            changed = true;
            continue;
        }
        let path = config.cache_dir.join(format!("{}.{}", key, config.extension));
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                if entry.size_bytes != meta.len() {
                    entry.size_bytes = meta.len();
                    changed = true;
                }
                index.insert(key, entry);
            }
            _ => {
                debug!(key = %key, "Dropping index entry with no file");
                changed = true;
            }
        }
    }
    Ok((index, changed))
}

fn rebuild_index(config: &CacheConfig) -> Result<CacheIndex> {
    let mut index = CacheIndex::new();
    for dir_entry in fs::read_dir(&config.cache_dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(config.extension.as_str()) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with(TEMP_PREFIX) || validate_key(stem).is_err() {
            continue;
        }
        let meta = fs::metadata(&path)?;
        if meta.is_file() {
            index.insert(stem.to_string(), CacheEntry::new(meta.len()));
        }
    }
    Ok(index)
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

/// Write via a temp file in the same directory, then rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = parent.join(format!("{}{}-{}", TEMP_PREFIX, std::process::id(), nanos));

    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(max_bytes: u64) -> (CacheStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig::new(temp.path()).with_max_size_bytes(max_bytes);
        (CacheStore::open(config).unwrap(), temp)
    }

    #[test]
    fn test_put_and_get() {
        let (store, _temp) = open_store(1024);

        let path = store.put("abc123", b"RIFFdata").unwrap();
        assert!(path.exists());
        assert_eq!(store.current_size_bytes(), 8);

        assert_eq!(store.get("abc123"), Some(path));
        let entry = store.entry("abc123").unwrap();
        assert_eq!(entry.hit_count, 1);
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn test_get_miss() {
        let (store, _temp) = open_store(1024);
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_put_replaces_and_applies_size_delta() {
        let (store, _temp) = open_store(1024);
        store.put("k", &[0u8; 100]).unwrap();
        store.put("k", &[0u8; 40]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size_bytes(), 40);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let (store, _temp) = open_store(1024);
        assert!(matches!(
            store.put("../escape", b"x"),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(store.put("", b"x").is_err());
    }

    #[test]
    fn test_missing_file_self_heals() {
        let (store, _temp) = open_store(1024);
        let path = store.put("gone", &[1u8; 10]).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(store.get("gone"), None);
        assert!(store.entry("gone").is_none());
        assert_eq!(store.current_size_bytes(), 0);
    }

    #[test]
    fn test_compress_phase_removes_unused_entries() {
        // limit 10, five 3-byte entries, none ever read back
        let (store, _temp) = open_store(10);
        for i in 0..5 {
            store.put(&format!("k{i}"), &[0u8; 3]).unwrap();
        }

        assert!(store.current_size_bytes() <= 10);
        assert!(store.stats().evictions >= 3);
        // the fourth put crossed the limit and cleared k0..k3
        assert!(store.contains("k4"));
        for i in 0..4 {
            assert!(!store.contains(&format!("k{i}")));
        }
    }

    #[test]
    fn test_age_phase_drops_least_recently_used_half() {
        let (store, _temp) = open_store(100);
        for i in 0..4 {
            store.put(&format!("k{i}"), &[0u8; 20]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        // every entry used at least once, k0 least recently
        for i in 0..4 {
            store.get(&format!("k{i}")).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        store.put("k4", &[0u8; 30]).unwrap();

        // 110 > 100: compress drops the new unused k4 (80 left, under 85),
        // so the age phase is not needed
        assert!(!store.contains("k4"));
        assert_eq!(store.current_size_bytes(), 80);

        // shrinking the limit forces the age phase
        store.set_max_size_bytes(50);
        assert!(store.current_size_bytes() <= 50);
        assert!(!store.contains("k0"));
        assert!(!store.contains("k1"));
        assert!(store.contains("k2"));
        assert!(store.contains("k3"));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let (store, _temp) = open_store(10);
        store.put("playing", &[0u8; 6]).unwrap();
        store.pin("playing");

        store.put("other", &[0u8; 6]).unwrap();

        assert!(store.contains("playing"));
        assert!(!store.contains("other"));

        store.set_max_size_bytes(1);
        assert!(store.contains("playing"));

        store.unpin("playing");
        store.set_max_size_bytes(2);
        assert!(!store.contains("playing"));
    }

    #[test]
    fn test_usage_within_limit_after_eviction() {
        let (store, _temp) = open_store(1000);
        for i in 0..40 {
            store.put(&format!("a{i}"), &[0u8; 90]).unwrap();
            if i % 2 == 0 {
                store.get(&format!("a{i}"));
            }
            assert!(store.current_size_bytes() <= 1000);
        }
    }

    #[test]
    fn test_clear_keeps_pinned() {
        let (store, _temp) = open_store(1024);
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.pin("b");

        assert_eq!(store.clear(), 1);
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert_eq!(store.current_size_bytes(), 1);
    }

    #[test]
    fn test_reopen_reconciles_index_and_files() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig::new(temp.path()).with_max_size_bytes(1024);
        {
            let store = CacheStore::open(config.clone()).unwrap();
            store.put("kept", &[0u8; 5]).unwrap();
            let lost = store.put("lost", &[0u8; 7]).unwrap();
            store.get("kept");
            store.flush().unwrap();
            fs::remove_file(lost).unwrap();
        }
        fs::write(temp.path().join("stray.wav"), b"orphan").unwrap();
        fs::write(temp.path().join("notes.txt"), b"not ours").unwrap();

        let store = CacheStore::open(config).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size_bytes(), 5);
        assert_eq!(store.entry("kept").unwrap().hit_count, 1);
        assert!(!temp.path().join("stray.wav").exists());
        assert!(temp.path().join("notes.txt").exists());
    }

    #[test]
    fn test_corrupt_index_rebuilt_from_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("abc.wav"), [0u8; 12]).unwrap();
        fs::write(temp.path().join(INDEX_FILE_NAME), b"{not json").unwrap();

        let store = CacheStore::open(CacheConfig::new(temp.path())).unwrap();
        assert!(store.contains("abc"));
        assert_eq!(store.current_size_bytes(), 12);
    }

    #[tokio::test]
    async fn test_index_write_is_debounced() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig::new(temp.path())
            .with_index_debounce(Duration::from_millis(50));
        let store = CacheStore::open(config).unwrap();
        let index_path = temp.path().join(INDEX_FILE_NAME);

        store.put("one", b"1").unwrap();
        store.put("two", b"2").unwrap();
        assert!(!index_path.exists());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let index: CacheIndex =
            serde_json::from_str(&fs::read_to_string(&index_path).unwrap()).unwrap();
        assert_eq!(index.len(), 2);
    }
}
