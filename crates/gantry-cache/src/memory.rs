use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use gantry_core::ContentHash;

use crate::error::CacheError;
use crate::{validate_kind, FileCache};

/// A process-local file cache, for tests and for clients that disable persistence.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, ContentHash), Arc<[u8]>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileCache for MemoryCache {
    fn get(&self, kind: &str, key: &ContentHash) -> Result<Vec<u8>, CacheError> {
        validate_kind(kind)?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(kind.to_string(), *key))
            .map(|value| value.to_vec())
            .ok_or(CacheError::NotFound)
    }

    fn set(&self, kind: &str, key: &ContentHash, value: &[u8]) -> Result<(), CacheError> {
        validate_kind(kind)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind.to_string(), *key), Arc::from(value));
        Ok(())
    }
}
