use gantry_core::FileUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

/// A logical file event, as produced by the watcher or reported by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEvent {
    pub uri: FileUri,
    pub kind: FileChangeKind,
}

impl FileEvent {
    pub fn new(uri: FileUri, kind: FileChangeKind) -> Self {
        Self { uri, kind }
    }
}
