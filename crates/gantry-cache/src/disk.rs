use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bincode::Options;
use gantry_core::ContentHash;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::util::{
    atomic_write, bincode_options_limited, decode, encode, now_millis, read_file_limited,
    remove_file_best_effort,
};
use crate::{validate_kind, FileCache};

pub const DISK_CACHE_SCHEMA_VERSION: u32 = 1;

const GANTRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Persistent file cache: one file per `(kind, key)` under `root/<kind>/<key>.bin`.
///
/// Entries carry a versioned header and their own key, are written atomically, and anything
/// unreadable or stale is treated as a miss and deleted.
#[derive(Clone, Debug)]
pub struct DiskCache {
    root: PathBuf,
    policy: DiskCachePolicy,
    last_gc_millis: Arc<AtomicU64>,
}

#[derive(Clone, Copy, Debug)]
pub struct DiskCachePolicy {
    /// Time-to-live for entries, measured from when they were saved.
    pub ttl_millis: u64,
    /// Maximum total size of entries on disk.
    pub max_bytes: u64,
    /// Minimum time between GC runs triggered by writes.
    pub gc_interval_millis: u64,
}

impl Default for DiskCachePolicy {
    fn default() -> Self {
        Self {
            ttl_millis: 7 * 24 * 60 * 60 * 1000,
            max_bytes: 512 * 1024 * 1024,
            gc_interval_millis: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    schema_version: u32,
    gantry_version: String,
    saved_at_millis: u64,
    kind: String,
    key: ContentHash,
}

#[derive(Debug, Serialize)]
struct Entry<'a> {
    header: EntryHeader,
    value: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct EntryOwned {
    header: EntryHeader,
    value: Vec<u8>,
}

impl EntryHeader {
    fn is_current(&self) -> bool {
        self.schema_version == DISK_CACHE_SCHEMA_VERSION && self.gantry_version == GANTRY_VERSION
    }
}

impl DiskCache {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::new_with_policy(root, DiskCachePolicy::default())
    }

    pub fn new_with_policy(
        root: impl AsRef<Path>,
        policy: DiskCachePolicy,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let cache = Self {
            root,
            policy,
            last_gc_millis: Arc::new(AtomicU64::new(now_millis())),
        };
        if let Err(err) = cache.gc() {
            tracing::debug!(target = "gantry.cache", error = %err, "initial cache gc failed");
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, kind: &str, key: &ContentHash) -> PathBuf {
        self.root.join(kind).join(format!("{}.bin", key.to_hex()))
    }

    fn maybe_gc(&self) {
        let now = now_millis();
        let last = self.last_gc_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.policy.gc_interval_millis {
            return;
        }
        if self
            .last_gc_millis
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if let Err(err) = self.gc() {
            tracing::debug!(target = "gantry.cache", error = %err, "cache gc failed");
        }
    }

    /// Deletes stale, foreign and corrupted entries, then evicts the oldest entries until the
    /// cache fits in `max_bytes`.
    pub fn gc(&self) -> Result<(), CacheError> {
        let now = now_millis();
        let mut candidates = Vec::new();
        let mut total_bytes: u64 = 0;

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(target = "gantry.cache", error = %err, "skipping cache entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            // Leftovers from interrupted writes, or files we never wrote.
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                remove_file_best_effort(path, "gc.unexpected_file");
                continue;
            }
            let Some(header) = read_header(path) else {
                remove_file_best_effort(path, "gc.corrupt");
                continue;
            };
            let name_matches = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem == header.key.to_hex());
            if !header.is_current()
                || !name_matches
                || now.saturating_sub(header.saved_at_millis) > self.policy.ttl_millis
            {
                remove_file_best_effort(path, "gc.stale");
                continue;
            }

            let len = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            total_bytes = total_bytes.saturating_add(len);
            candidates.push((header.saved_at_millis, len, path.to_path_buf()));
        }

        if total_bytes <= self.policy.max_bytes {
            return Ok(());
        }
        candidates.sort_by_key(|(saved_at, _, _)| *saved_at);
        for (_, len, path) in candidates {
            if total_bytes <= self.policy.max_bytes {
                break;
            }
            if remove_file_best_effort(&path, "gc.evict") {
                total_bytes = total_bytes.saturating_sub(len);
            }
        }
        Ok(())
    }
}

fn read_header(path: &Path) -> Option<EntryHeader> {
    let bytes = read_file_limited(path)?;
    bincode_options_limited()
        .allow_trailing_bytes()
        .deserialize(&bytes)
        .ok()
}

impl FileCache for DiskCache {
    fn get(&self, kind: &str, key: &ContentHash) -> Result<Vec<u8>, CacheError> {
        validate_kind(kind)?;
        let path = self.entry_path(kind, key);
        let bytes = read_file_limited(&path).ok_or(CacheError::NotFound)?;

        let entry: EntryOwned = match decode(&bytes) {
            Ok(entry) => entry,
            Err(_) => {
                remove_file_best_effort(&path, "get.corrupt");
                return Err(CacheError::NotFound);
            }
        };
        if !entry.header.is_current() || entry.header.kind != kind || entry.header.key != *key {
            remove_file_best_effort(&path, "get.stale");
            return Err(CacheError::NotFound);
        }
        Ok(entry.value)
    }

    fn set(&self, kind: &str, key: &ContentHash, value: &[u8]) -> Result<(), CacheError> {
        validate_kind(kind)?;
        let entry = Entry {
            header: EntryHeader {
                schema_version: DISK_CACHE_SCHEMA_VERSION,
                gantry_version: GANTRY_VERSION.to_string(),
                saved_at_millis: now_millis(),
                kind: kind.to_string(),
                key: *key,
            },
            value,
        };
        atomic_write(&self.entry_path(kind, key), &encode(&entry)?)?;
        self.maybe_gc();
        Ok(())
    }
}
