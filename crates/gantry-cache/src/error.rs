pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache lookups and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A cache miss. Callers compute the value and usually `set` it.
    #[error("cache entry not found")]
    NotFound,

    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("invalid cache kind {kind:?}: expected lowercase ASCII letters, digits, '-' or '_'")]
    InvalidKind { kind: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}
