use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use gantry_core::{FileUri, PersistentMap};
use gantry_vfs::{FileHandle, Overlay};

/// The files a snapshot has observed, plus the overlays among them and the set of their parent
/// directories.
///
/// Cloning is cheap: both maps share structure until one of them is written.
#[derive(Debug, Clone, Default)]
pub struct FileMap {
    files: PersistentMap<FileUri, FileHandle>,
    overlays: PersistentMap<FileUri, Arc<Overlay>>,
    /// Every ancestor directory of every file; computed on first use.
    dirs: Option<Arc<BTreeSet<FileUri>>>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &FileUri) -> Option<&FileHandle> {
        self.files.get(uri)
    }

    pub fn set(&mut self, uri: FileUri, fh: FileHandle) {
        match fh.as_overlay() {
            Some(overlay) => self.overlays.set(uri.clone(), overlay.clone()),
            None => {
                self.overlays.delete(&uri);
            }
        }
        if let Some(dirs) = &mut self.dirs {
            if !ancestors(&uri).all(|dir| dirs.contains(&dir)) {
                Arc::make_mut(dirs).extend(ancestors(&uri));
            }
        }
        self.files.set(uri, fh);
    }

    pub fn delete(&mut self, uri: &FileUri) {
        if self.files.delete(uri) {
            self.overlays.delete(uri);
            // A directory may have lost its last file.
            self.dirs = None;
        }
    }

    /// A copy of this map with `changes` applied.
    pub fn clone_with(&self, changes: &BTreeMap<FileUri, FileHandle>) -> FileMap {
        let mut next = self.clone();
        for (uri, fh) in changes {
            next.set(uri.clone(), fh.clone());
        }
        next
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileUri, &FileHandle)> + '_ {
        self.files.iter()
    }

    /// Files whose URI starts with `dir`'s, i.e. the files at or below `dir`.
    pub fn range_under<'a>(&'a self, dir: &'a FileUri) -> impl Iterator<Item = (&'a FileUri, &'a FileHandle)> + 'a {
        self.files
            .range(dir.clone()..)
            .take_while(move |(uri, _)| uri.as_str().starts_with(dir.as_str()))
            .filter(move |(uri, _)| dir.encloses(uri))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn overlays(&self) -> Vec<Arc<Overlay>> {
        self.overlays.iter().map(|(_, overlay)| overlay.clone()).collect()
    }

    /// Every directory containing an observed file, at any depth.
    pub fn dirs(&mut self) -> Arc<BTreeSet<FileUri>> {
        if let Some(dirs) = &self.dirs {
            return dirs.clone();
        }
        let dirs: Arc<BTreeSet<FileUri>> = Arc::new(self.files.keys().flat_map(ancestors).collect());
        self.dirs = Some(dirs.clone());
        dirs
    }

    /// Releases this map's entries.
    pub fn destroy(self) {
        self.files.destroy();
        self.overlays.destroy();
    }
}

fn ancestors(uri: &FileUri) -> impl Iterator<Item = FileUri> {
    std::iter::successors(uri.dir(), FileUri::dir)
}
