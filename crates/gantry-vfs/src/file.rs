use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use gantry_core::{ContentHash, FileKind, FileUri};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(FileUri),
    #[error("failed to read {uri}: {message}")]
    Io { uri: FileUri, message: String },
}

impl FileError {
    pub fn from_io(uri: FileUri, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            FileError::NotFound(uri)
        } else {
            FileError::Io {
                uri,
                message: err.to_string(),
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FileError::NotFound(_))
    }
}

/// A file's URI plus the hash of its content. Equal identities mean equal content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    pub uri: FileUri,
    pub hash: ContentHash,
}

/// A file as read from disk. A file that could not be read keeps the error and the zero hash.
#[derive(Debug)]
pub struct DiskFile {
    uri: FileUri,
    mod_time: Option<SystemTime>,
    content: Result<Arc<[u8]>, FileError>,
    hash: ContentHash,
}

impl DiskFile {
    /// Reads `uri` from disk now.
    pub fn read(uri: FileUri) -> Self {
        let mod_time = std::fs::metadata(uri.path())
            .and_then(|meta| meta.modified())
            .ok();
        match std::fs::read(uri.path()) {
            Ok(bytes) => Self::from_bytes(uri, mod_time, bytes),
            Err(err) => {
                let err = FileError::from_io(uri.clone(), &err);
                Self::failed(uri, err)
            }
        }
    }

    pub fn from_bytes(
        uri: FileUri,
        mod_time: Option<SystemTime>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let content: Arc<[u8]> = bytes.into();
        let hash = ContentHash::of(&content);
        Self {
            uri,
            mod_time,
            content: Ok(content),
            hash,
        }
    }

    /// A tombstone for a file that does not exist.
    pub fn missing(uri: FileUri) -> Self {
        let err = FileError::NotFound(uri.clone());
        Self::failed(uri, err)
    }

    pub fn failed(uri: FileUri, err: FileError) -> Self {
        Self {
            uri,
            mod_time: None,
            content: Err(err),
            hash: ContentHash::ZERO,
        }
    }

    pub fn uri(&self) -> &FileUri {
        &self.uri
    }

    pub fn mod_time(&self) -> Option<SystemTime> {
        self.mod_time
    }

    pub fn len(&self) -> Option<usize> {
        self.content.as_ref().ok().map(|content| content.len())
    }

    pub fn content(&self) -> Result<&[u8], FileError> {
        match &self.content {
            Ok(content) => Ok(&content[..]),
            Err(err) => Err(err.clone()),
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

/// An editor buffer. Values are immutable: edits produce a new `Overlay` with a higher version.
#[derive(Debug, Clone)]
pub struct Overlay {
    uri: FileUri,
    content: Arc<[u8]>,
    hash: ContentHash,
    version: i32,
    kind: FileKind,
    saved: bool,
}

impl Overlay {
    pub fn new(
        uri: FileUri,
        content: impl Into<Arc<[u8]>>,
        version: i32,
        kind: FileKind,
        saved: bool,
    ) -> Self {
        let content: Arc<[u8]> = content.into();
        let hash = ContentHash::of(&content);
        Self {
            uri,
            content,
            hash,
            version,
            kind,
            saved,
        }
    }

    pub fn uri(&self) -> &FileUri {
        &self.uri
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn saved(&self) -> bool {
        self.saved
    }
}

/// A read-only view of one file: either disk-backed or an editor overlay.
#[derive(Debug, Clone)]
pub enum FileHandle {
    Disk(Arc<DiskFile>),
    Overlay(Arc<Overlay>),
}

impl FileHandle {
    pub fn uri(&self) -> &FileUri {
        match self {
            FileHandle::Disk(file) => file.uri(),
            FileHandle::Overlay(overlay) => overlay.uri(),
        }
    }

    pub fn content(&self) -> Result<&[u8], FileError> {
        match self {
            FileHandle::Disk(file) => file.content(),
            FileHandle::Overlay(overlay) => Ok(overlay.content()),
        }
    }

    pub fn identity(&self) -> FileIdentity {
        let hash = match self {
            FileHandle::Disk(file) => file.hash(),
            FileHandle::Overlay(overlay) => overlay.hash(),
        };
        FileIdentity {
            uri: self.uri().clone(),
            hash,
        }
    }

    /// The client version of an overlay; disk files report 0.
    pub fn version(&self) -> i32 {
        match self {
            FileHandle::Disk(_) => 0,
            FileHandle::Overlay(overlay) => overlay.version(),
        }
    }

    /// Whether this content is what is stored on disk. Overlays claim this only once saved.
    pub fn same_contents_on_disk(&self) -> bool {
        match self {
            FileHandle::Disk(_) => true,
            FileHandle::Overlay(overlay) => overlay.saved(),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            FileHandle::Disk(file) => FileKind::for_path(file.uri().path()),
            FileHandle::Overlay(overlay) => overlay.kind(),
        }
    }

    pub fn exists(&self) -> bool {
        self.content().is_ok()
    }

    pub fn as_overlay(&self) -> Option<&Arc<Overlay>> {
        match self {
            FileHandle::Overlay(overlay) => Some(overlay),
            FileHandle::Disk(_) => None,
        }
    }

    pub fn is_overlay(&self) -> bool {
        self.as_overlay().is_some()
    }
}

impl From<DiskFile> for FileHandle {
    fn from(file: DiskFile) -> Self {
        FileHandle::Disk(Arc::new(file))
    }
}

impl From<Overlay> for FileHandle {
    fn from(overlay: Overlay) -> Self {
        FileHandle::Overlay(Arc::new(overlay))
    }
}
