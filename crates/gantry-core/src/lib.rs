//! Core shared types for Gantry.
//!
//! This crate is intentionally small: file URIs, content hashes, file kinds, text positions and
//! the persistent map that snapshots use to share structure.

mod hash;
mod kind;
mod persistent;
mod uri;

pub use hash::{ContentHash, Hasher};
pub use kind::FileKind;
pub use persistent::PersistentMap;
pub use uri::{normalize_local_path, FileUri, UriError};

use serde::{Deserialize, Serialize};

/// A position in a text document expressed as (line, UTF-16 code unit offset).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[inline]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A half-open range in a text document.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[inline]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// A zero-width range at `pos`.
    #[inline]
    pub const fn point(pos: Position) -> Self {
        Self { start: pos, end: pos }
    }
}
