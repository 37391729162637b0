use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use gantry_core::FileUri;

use crate::file::{DiskFile, FileError, FileHandle};
use crate::lock::lock;

/// A source of file handles. Reading never fails: unreadable files are returned as handles whose
/// `content()` carries the error.
pub trait FileSource: Send + Sync {
    fn read_file(&self, uri: &FileUri) -> FileHandle;
}

impl<T: FileSource + ?Sized> FileSource for Arc<T> {
    fn read_file(&self, uri: &FileUri) -> FileHandle {
        (**self).read_file(uri)
    }
}

/// Files modified this recently are always re-read: some file systems only record mtimes with
/// one or two second granularity.
const MTIME_GRANULARITY: Duration = Duration::from_secs(2);

/// Reads files from the OS file system, reusing the previous read while `(mtime, len)` is stable.
#[derive(Debug, Default)]
pub struct DiskFs {
    cache: Mutex<HashMap<FileUri, Arc<DiskFile>>>,
}

impl DiskFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, uri: &FileUri, meta: &std::fs::Metadata) -> Option<Arc<DiskFile>> {
        let mod_time = meta.modified().ok()?;
        let recent = SystemTime::now()
            .duration_since(mod_time)
            .map(|age| age < MTIME_GRANULARITY)
            .unwrap_or(true);
        if recent {
            return None;
        }
        let cache = lock(&self.cache);
        let file = cache.get(uri)?;
        (file.mod_time() == Some(mod_time) && file.len() == Some(meta.len() as usize))
            .then(|| file.clone())
    }
}

impl FileSource for DiskFs {
    fn read_file(&self, uri: &FileUri) -> FileHandle {
        let meta = match std::fs::metadata(uri.path()) {
            Ok(meta) => meta,
            Err(err) => {
                lock(&self.cache).remove(uri);
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "gantry.vfs",
                        uri = %uri,
                        error = %err,
                        "failed to stat file"
                    );
                }
                let err = FileError::from_io(uri.clone(), &err);
                return FileHandle::from(DiskFile::failed(uri.clone(), err));
            }
        };

        if let Some(file) = self.cached(uri, &meta) {
            return FileHandle::Disk(file);
        }

        let file = Arc::new(DiskFile::read(uri.clone()));
        if file.content().is_ok() {
            lock(&self.cache).insert(uri.clone(), file.clone());
        } else {
            lock(&self.cache).remove(uri);
        }
        FileHandle::Disk(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_reflect_disk_writes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.go");
        let uri = FileUri::from_path(&path).unwrap();
        let fs = DiskFs::new();

        assert!(!fs.read_file(&uri).exists());

        std::fs::write(&path, "package a").unwrap();
        let first = fs.read_file(&uri);
        assert_eq!(first.content().unwrap(), b"package a");

        std::fs::write(&path, "package b").unwrap();
        let second = fs.read_file(&uri);
        assert_eq!(second.content().unwrap(), b"package b");
        assert_ne!(first.identity(), second.identity());

        std::fs::remove_file(&path).unwrap();
        assert!(fs.read_file(&uri).content().unwrap_err().is_not_found());
    }
}
