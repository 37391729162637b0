use std::num::NonZeroUsize;
use std::sync::Arc;

use gantry_core::{FileUri, Range};
use gantry_vfs::{FileError, FileHandle, FileIdentity};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How much of a file to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParseMode {
    /// The package clause and import declarations.
    Header,
    /// The whole file, including comments.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Const,
    Func,
    Method,
    Type,
    Var,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
}

/// The output of a [`Parser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub uri: FileUri,
    pub mode: ParseMode,
    /// `None` if the package clause could not be parsed.
    pub package_name: Option<String>,
    /// A syntax error, if the file did not parse cleanly. The other fields hold whatever was
    /// recovered.
    pub parse_error: Option<String>,
    /// Import paths, unquoted, in source order.
    pub imports: Vec<String>,
    /// Build constraint lines (`//go:build ...`).
    pub build_constraints: Vec<String>,
    /// Embed directive lines (`//go:embed ...`). Only populated in [`ParseMode::Full`].
    pub embeds: Vec<String>,
    /// Top-level declarations. Only populated in [`ParseMode::Full`].
    pub symbols: Vec<Symbol>,
}

impl ParsedFile {
    pub fn new(uri: FileUri, mode: ParseMode) -> Self {
        Self {
            uri,
            mode,
            package_name: None,
            parse_error: None,
            imports: Vec::new(),
            build_constraints: Vec::new(),
            embeds: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Directives that affect which files a package contains or what it embeds.
    pub fn magic_comments(&self) -> impl Iterator<Item = &str> + '_ {
        self.build_constraints
            .iter()
            .chain(&self.embeds)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Unreadable(#[from] FileError),
    #[error("{uri} is not valid UTF-8")]
    InvalidUtf8 { uri: FileUri },
    #[error("failed to parse {uri}: {message}")]
    Failed { uri: FileUri, message: String },
}

/// Parses source files. Implementations must be deterministic: equal input gives equal output.
pub trait Parser: Send + Sync {
    fn parse(&self, uri: &FileUri, src: &[u8], mode: ParseMode) -> Result<ParsedFile, ParseError>;
}

const DEFAULT_PARSE_CACHE_CAPACITY: usize = 1024;

/// A bounded cache of parse results keyed by file identity and mode.
///
/// Shared by every snapshot of a view, so the header comparisons done during invalidation and
/// the full parses done for type checking do not repeat work for unchanged files.
pub struct ParseCache {
    parser: Arc<dyn Parser>,
    entries: Mutex<LruCache<(FileIdentity, ParseMode), Arc<ParsedFile>>>,
}

impl ParseCache {
    pub fn new(parser: Arc<dyn Parser>) -> Self {
        Self::with_capacity(parser, DEFAULT_PARSE_CACHE_CAPACITY)
    }

    pub fn with_capacity(parser: Arc<dyn Parser>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            parser,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Parses `fh`, reusing a previous result for the same content. Errors are not cached.
    pub fn parse(&self, fh: &FileHandle, mode: ParseMode) -> Result<Arc<ParsedFile>, ParseError> {
        let key = (fh.identity(), mode);
        if let Some(parsed) = self.entries.lock().get(&key) {
            return Ok(parsed.clone());
        }

        let content = fh.content()?;
        let parsed = Arc::new(self.parser.parse(fh.uri(), content, mode)?);
        self.entries.lock().put(key, parsed.clone());
        Ok(parsed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for ParseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
