//! On-disk image cache with reference counting and idle expiry.
//!
//! Entries are keyed by `bucket/object`. An entry in use by a VM is never
//! expired: every user holds a [`CachedImage`] guard, and dropping the guard
//! gives the reference back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

const COMPRESSED_DIR: &str = "_compressed";
const EXTRACTED_DIR: &str = "_extracted";

#[derive(Debug)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    last_accessed: Instant,
    ref_count: u32,
}

type Entries = Arc<Mutex<HashMap<String, CacheEntry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub current_size_bytes: AtomicU64,
}

/// A referenced cache entry. The file stays on disk while any guard lives.
#[derive(Debug)]
pub struct CachedImage {
    key: String,
    path: PathBuf,
    entries: Entries,
}

impl CachedImage {
    /// Cache key, `bucket/object`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extracted file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for CachedImage {
    fn clone(&self) -> Self {
        if let Some(entry) = lock(&self.entries).get_mut(&self.key) {
            entry.ref_count += 1;
        }
        Self {
            key: self.key.clone(),
            path: self.path.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl Drop for CachedImage {
    fn drop(&mut self) {
        if let Some(entry) = lock(&self.entries).get_mut(&self.key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_accessed = Instant::now();
            debug!(key = %self.key, ref_count = entry.ref_count, "Released cached image");
        }
    }
}

/// Image cache rooted at one directory.
pub struct ImageCache {
    root: PathBuf,
    entries: Entries,
    stats: CacheStats,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
            stats: CacheStats::default(),
        }
    }

    /// Cache key of an object.
    pub fn key(bucket: &str, object: &str) -> String {
        format!("{}/{}", bucket, object)
    }

    /// Where a downloaded blob is staged before extraction.
    pub fn compressed_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(COMPRESSED_DIR).join(bucket).join(object)
    }

    /// Where the usable file of an object lives.
    pub fn extracted_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(EXTRACTED_DIR).join(bucket).join(object)
    }

    /// Take a reference to a cached entry.
    pub fn acquire(&self, key: &str) -> Option<CachedImage> {
        let mut entries = lock(&self.entries);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.last_accessed = Instant::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(CachedImage {
                    key: key.to_string(),
                    path: entry.path.clone(),
                    entries: self.entries.clone(),
                })
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Register a file and return the first reference to it.
    pub fn insert(&self, key: &str, path: PathBuf, size_bytes: u64) -> CachedImage {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            self.stats
                .current_size_bytes
                .fetch_add(size_bytes, Ordering::Relaxed);
            debug!(key = %key, size = size_bytes, "Registered cached image");
            CacheEntry {
                path,
                size_bytes,
                last_accessed: Instant::now(),
                ref_count: 0,
            }
        });
        entry.ref_count += 1;
        entry.last_accessed = Instant::now();

        CachedImage {
            key: key.to_string(),
            path: entry.path.clone(),
            entries: self.entries.clone(),
        }
    }

    /// Keys with no references, idle longer than `ttl`.
    pub fn expired_keys(&self, ttl: Duration) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && e.last_accessed.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop `key` and delete its file if it is still unreferenced and expired.
    ///
    /// Callers hold the key's download lock. Returns whether it was removed.
    pub fn remove_if_expired(&self, key: &str, ttl: Duration) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            match entries.get(key) {
                Some(e) if e.ref_count == 0 && e.last_accessed.elapsed() > ttl => entries.remove(key),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return false;
        };

        if let Err(e) = std::fs::remove_file(&entry.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %key, path = %entry.path.display(), error = %e, "Failed to delete cached image");
            }
        }
        self.stats
            .current_size_bytes
            .fetch_sub(entry.size_bytes, Ordering::Relaxed);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);

        info!(key = %key, size = entry.size_bytes, "Evicted cached image");
        true
    }

    /// References currently held on `key`.
    pub fn ref_count(&self, key: &str) -> Option<u32> {
        lock(&self.entries).get(key).map(|e| e.ref_count)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses, evictions, current_size_bytes)`.
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.evictions.load(Ordering::Relaxed),
            self.stats.current_size_bytes.load(Ordering::Relaxed),
        )
    }
}
