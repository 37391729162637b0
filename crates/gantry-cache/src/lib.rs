//! Content-addressed cache for derived per-package data (diagnostics, cross references, method
//! sets). Values are opaque bytes keyed by a kind and a [`ContentHash`]; [`encode`] and
//! [`decode`] give callers a compact bincode encoding.

mod dir;
mod disk;
mod error;
mod memory;
mod util;

pub use dir::{default_cache_root, CacheConfig, CACHE_DIR_ENV};
pub use disk::{DiskCache, DiskCachePolicy, DISK_CACHE_SCHEMA_VERSION};
pub use error::{CacheError, Result};
pub use memory::MemoryCache;
pub use util::{atomic_write, decode, encode, now_millis, PAYLOAD_LIMIT_BYTES};

use std::sync::Arc;

use gantry_core::ContentHash;

/// A cache of derived data. `get` reports misses as [`CacheError::NotFound`].
pub trait FileCache: Send + Sync {
    fn get(&self, kind: &str, key: &ContentHash) -> Result<Vec<u8>>;
    fn set(&self, kind: &str, key: &ContentHash, value: &[u8]) -> Result<()>;
}

impl<T: FileCache + ?Sized> FileCache for Arc<T> {
    fn get(&self, kind: &str, key: &ContentHash) -> Result<Vec<u8>> {
        (**self).get(kind, key)
    }

    fn set(&self, kind: &str, key: &ContentHash, value: &[u8]) -> Result<()> {
        (**self).set(kind, key, value)
    }
}

/// Kinds name directories on disk, so they are restricted to a safe alphabet.
pub(crate) fn validate_kind(kind: &str) -> Result<()> {
    let valid = !kind.is_empty()
        && kind
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKind {
            kind: kind.to_string(),
        })
    }
}
