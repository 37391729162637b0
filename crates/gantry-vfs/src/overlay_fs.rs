use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gantry_core::{FileKind, FileUri};

use crate::file::{FileHandle, Overlay};
use crate::fs::FileSource;
use crate::lock::lock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    #[error("{0} is not open")]
    NotOpen(FileUri),
    #[error("stale version {requested} for {uri} (current version is {current})")]
    StaleVersion {
        uri: FileUri,
        current: i32,
        requested: i32,
    },
}

/// A file source that serves editor overlays before delegating to a base source.
pub struct OverlayFs {
    delegate: Arc<dyn FileSource>,
    overlays: Mutex<HashMap<FileUri, Arc<Overlay>>>,
}

impl OverlayFs {
    pub fn new(delegate: Arc<dyn FileSource>) -> Self {
        Self {
            delegate,
            overlays: Mutex::new(HashMap::new()),
        }
    }

    pub fn delegate(&self) -> &Arc<dyn FileSource> {
        &self.delegate
    }

    pub fn overlay(&self, uri: &FileUri) -> Option<Arc<Overlay>> {
        lock(&self.overlays).get(uri).cloned()
    }

    /// A point-in-time copy of every overlay.
    pub fn overlays(&self) -> Vec<Arc<Overlay>> {
        lock(&self.overlays).values().cloned().collect()
    }

    /// Adds, replaces (`Some`) or removes (`None`) the overlay for `uri`.
    pub fn set(&self, uri: FileUri, overlay: Option<Overlay>) {
        let mut overlays = lock(&self.overlays);
        match overlay {
            Some(overlay) => {
                overlays.insert(uri, Arc::new(overlay));
            }
            None => {
                overlays.remove(&uri);
            }
        }
    }

    /// Overlays whose content the loader must be told about: everything except saved overlays
    /// that still match the disk.
    pub fn unsaved_overlays(&self) -> Vec<Arc<Overlay>> {
        let overlays = self.overlays();
        overlays
            .into_iter()
            .filter(|overlay| {
                if !overlay.saved() {
                    return true;
                }
                let disk = self.delegate.read_file(overlay.uri());
                disk.identity().hash != overlay.hash()
            })
            .collect()
    }

    pub fn open(
        &self,
        uri: FileUri,
        version: i32,
        content: impl Into<Arc<[u8]>>,
        kind: FileKind,
    ) -> Arc<Overlay> {
        let overlay = Arc::new(Overlay::new(uri.clone(), content, version, kind, false));
        lock(&self.overlays).insert(uri, overlay.clone());
        overlay
    }

    /// Replaces the content of an open overlay. `version` must increase.
    pub fn change(
        &self,
        uri: &FileUri,
        version: i32,
        content: impl Into<Arc<[u8]>>,
    ) -> Result<Arc<Overlay>, OverlayError> {
        let mut overlays = lock(&self.overlays);
        let current = overlays
            .get(uri)
            .ok_or_else(|| OverlayError::NotOpen(uri.clone()))?;
        if version <= current.version() {
            return Err(OverlayError::StaleVersion {
                uri: uri.clone(),
                current: current.version(),
                requested: version,
            });
        }
        let next = Arc::new(Overlay::new(
            uri.clone(),
            content,
            version,
            current.kind(),
            false,
        ));
        overlays.insert(uri.clone(), next.clone());
        Ok(next)
    }

    /// Marks an overlay as saved, optionally replacing its content with the saved text.
    pub fn save(
        &self,
        uri: &FileUri,
        content: Option<Arc<[u8]>>,
    ) -> Result<Arc<Overlay>, OverlayError> {
        let mut overlays = lock(&self.overlays);
        let current = overlays
            .get(uri)
            .ok_or_else(|| OverlayError::NotOpen(uri.clone()))?;
        let content = content.unwrap_or_else(|| Arc::from(current.content()));
        let next = Arc::new(Overlay::new(
            uri.clone(),
            content,
            current.version(),
            current.kind(),
            true,
        ));
        overlays.insert(uri.clone(), next.clone());
        Ok(next)
    }

    pub fn close(&self, uri: &FileUri) -> Result<(), OverlayError> {
        lock(&self.overlays)
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| OverlayError::NotOpen(uri.clone()))
    }
}

impl FileSource for OverlayFs {
    fn read_file(&self, uri: &FileUri) -> FileHandle {
        if let Some(overlay) = self.overlay(uri) {
            return FileHandle::Overlay(overlay);
        }
        self.delegate.read_file(uri)
    }
}
