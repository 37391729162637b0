use std::path::PathBuf;

use crate::error::CacheError;

pub const CACHE_DIR_ENV: &str = "GANTRY_CACHE_DIR";

/// Selects the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Overrides the default cache directory.
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from),
        }
    }

    /// The directory the file cache lives in: the override if set, otherwise the per-user
    /// default.
    pub fn file_cache_dir(&self) -> Result<PathBuf, CacheError> {
        let base = match &self.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        Ok(base.join("files"))
    }
}

/// `$XDG_CACHE_HOME/gantry`, falling back to `~/.cache/gantry`.
pub fn default_cache_root() -> Result<PathBuf, CacheError> {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(xdg).join("gantry"));
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;
    Ok(home.join(".cache").join("gantry"))
}
