//! The editor-facing entry point: one overlay store shared by every view, and the routing of
//! file modifications to the views they affect.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel as channel;
use gantry_core::{FileKind, FileUri, UriError};
use gantry_vfs::{
    DiskFs, FileChangeKind, FileEvent, FileSource, FileWatcher, OverlayError, OverlayFs, WatchError,
};
use parking_lot::Mutex;

use crate::collab::Collaborators;
use crate::definition::define_view;
use crate::options::Options;
use crate::snapshot::StateChange;
use crate::view::{View, ViewError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("failed to spawn {name} thread: {message}")]
    Spawn { name: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// The editor opened a buffer.
    Open,
    /// The editor changed a buffer.
    Change,
    /// The editor saved a buffer.
    Save,
    /// The editor closed a buffer.
    Close,
    /// Changes observed on disk.
    Created,
    Changed,
    Deleted,
}

/// One change reported by the editor or the file watcher.
#[derive(Debug, Clone)]
pub struct FileModification {
    pub uri: FileUri,
    pub action: FileAction,
    pub version: i32,
    /// New buffer content for `Open` and `Change`; optional for `Save`.
    pub text: Option<Arc<[u8]>>,
    pub language_id: Option<String>,
}

impl FileModification {
    pub fn new(uri: FileUri, action: FileAction) -> Self {
        Self {
            uri,
            action,
            version: 0,
            text: None,
            language_id: None,
        }
    }

    pub fn open(uri: FileUri, version: i32, text: impl Into<Arc<[u8]>>) -> Self {
        Self {
            version,
            text: Some(text.into()),
            ..Self::new(uri, FileAction::Open)
        }
    }

    pub fn change(uri: FileUri, version: i32, text: impl Into<Arc<[u8]>>) -> Self {
        Self {
            version,
            text: Some(text.into()),
            ..Self::new(uri, FileAction::Change)
        }
    }

    pub fn with_language_id(mut self, id: impl Into<String>) -> Self {
        self.language_id = Some(id.into());
        self
    }
}

impl From<FileEvent> for FileModification {
    fn from(event: FileEvent) -> Self {
        let action = match event.kind {
            FileChangeKind::Created => FileAction::Created,
            FileChangeKind::Changed => FileAction::Changed,
            FileChangeKind::Deleted => FileAction::Deleted,
        };
        FileModification::new(event.uri, action)
    }
}

pub struct Session {
    options: Options,
    collaborators: Collaborators,
    fs: Arc<OverlayFs>,
    views: Mutex<Vec<Arc<View>>>,
    next_view_id: AtomicU64,
    retired: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Session {
    pub fn new(options: Options, collaborators: Collaborators) -> Self {
        Self::with_file_source(options, collaborators, Arc::new(DiskFs::new()))
    }

    /// A session reading unopened files from `disk` instead of the local file system.
    pub fn with_file_source(options: Options, collaborators: Collaborators, disk: Arc<dyn FileSource>) -> Self {
        Self {
            options,
            collaborators,
            fs: Arc::new(OverlayFs::new(disk)),
            views: Mutex::new(Vec::new()),
            next_view_id: AtomicU64::new(1),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn file_source(&self) -> &Arc<OverlayFs> {
        &self.fs
    }

    fn create_view(&self, folder: &FileUri) -> Result<Arc<View>, SessionError> {
        let definition = define_view(
            folder,
            &self.options.env,
            &self.options.build_flags,
            &*self.fs,
        )?;
        let id = self.next_view_id.fetch_add(1, Ordering::Relaxed).to_string();
        let view = View::new(
            id,
            definition,
            self.fs.clone(),
            self.collaborators.clone(),
            &self.options,
        )?;
        Ok(Arc::new(view))
    }

    /// Adds a view for the workspace folder `folder`, returning the existing one if there is
    /// already a view for it.
    pub fn add_view(&self, folder: &FileUri) -> Result<Arc<View>, SessionError> {
        if let Some(view) = self.views.lock().iter().find(|view| view.folder() == folder) {
            return Ok(view.clone());
        }
        let view = self.create_view(folder)?;
        self.views.lock().push(view.clone());
        Ok(view)
    }

    /// Removes and shuts down the view for `folder`. Returns false if there is none.
    pub fn remove_view(&self, folder: &FileUri) -> bool {
        let removed = {
            let mut views = self.views.lock();
            let index = views.iter().position(|view| view.folder() == folder);
            index.map(|index| views.remove(index))
        };
        match removed {
            Some(view) => {
                view.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn views(&self) -> Vec<Arc<View>> {
        self.views.lock().clone()
    }

    /// The view whose folder most closely encloses `uri`.
    pub fn view_of(&self, uri: &FileUri) -> Option<Arc<View>> {
        self.views
            .lock()
            .iter()
            .filter(|view| view.folder().encloses(uri) || view.definition().root.encloses(uri))
            .max_by_key(|view| view.folder().as_str().len())
            .cloned()
    }

    /// Applies editor and file system modifications, invalidating every view they affect.
    /// Views whose build configuration changed are replaced. Returns the affected views.
    pub fn did_modify_files(&self, modifications: &[FileModification]) -> Result<Vec<Arc<View>>, SessionError> {
        tracing::debug!(
            target = "gantry.workspace",
            modifications = ?summarize(modifications),
            "modifying files"
        );
        for modification in modifications {
            self.apply_to_overlays(modification)?;
        }

        let mut change = StateChange::default();
        for modification in modifications {
            let uri = &modification.uri;
            change.files.insert(uri.clone(), self.fs.read_file(uri));
        }
        let manifest_changed = change
            .files
            .keys()
            .any(|uri| matches!(uri.base_name(), "go.mod" | "go.work"));

        let mut affected = Vec::new();
        let views = self.views();
        for view in views {
            if !change.files.keys().any(|uri| is_relevant(&view, uri)) {
                continue;
            }

            if manifest_changed {
                let definition = define_view(
                    view.folder(),
                    &self.options.env,
                    &self.options.build_flags,
                    &*self.fs,
                )?;
                if &definition != view.definition() {
                    let replacement = self.create_view(view.folder())?;
                    tracing::info!(
                        target = "gantry.workspace",
                        folder = %view.folder(),
                        old = view.id(),
                        new = replacement.id(),
                        "workspace definition changed; replacing view"
                    );
                    self.replace_view(&view, replacement.clone());
                    affected.push(replacement);
                    continue;
                }
            }

            let (_snapshot, _release) = view.invalidate(change.clone())?;
            affected.push(view);
        }
        Ok(affected)
    }

    fn apply_to_overlays(&self, modification: &FileModification) -> Result<(), SessionError> {
        let uri = &modification.uri;
        let text = || modification.text.clone().unwrap_or_else(|| Arc::from(&[][..]));
        match modification.action {
            FileAction::Open => {
                let kind = modification
                    .language_id
                    .as_deref()
                    .and_then(FileKind::from_language_id)
                    .unwrap_or_else(|| FileKind::for_path(uri.path()));
                self.fs.open(uri.clone(), modification.version, text(), kind);
            }
            FileAction::Change => {
                self.fs.change(uri, modification.version, text())?;
            }
            FileAction::Save => {
                self.fs.save(uri, modification.text.clone())?;
            }
            FileAction::Close => self.fs.close(uri)?,
            FileAction::Created | FileAction::Changed | FileAction::Deleted => {}
        }
        Ok(())
    }

    fn replace_view(&self, old: &Arc<View>, replacement: Arc<View>) {
        {
            let mut views = self.views.lock();
            match views.iter_mut().find(|view| Arc::ptr_eq(view, old)) {
                Some(slot) => *slot = replacement,
                None => views.push(replacement),
            }
        }

        let old = old.clone();
        let mut retired = self.retired.lock();
        retired.retain(|handle| !handle.is_finished());
        let spawned = thread::Builder::new()
            .name("gantry-view-shutdown".to_owned())
            .spawn({
                let old = old.clone();
                move || old.shutdown()
            });
        match spawned {
            Ok(handle) => retired.push(handle),
            Err(err) => {
                tracing::warn!(
                    target = "gantry.workspace",
                    view = old.id(),
                    error = %err,
                    "failed to spawn view shutdown thread; shutting down inline"
                );
                old.shutdown();
            }
        }
    }

    /// Shuts down every view.
    pub fn shutdown(&self) {
        let views = std::mem::take(&mut *self.views.lock());
        for view in views {
            view.shutdown();
        }
        let retired = std::mem::take(&mut *self.retired.lock());
        for handle in retired {
            if handle.join().is_err() {
                tracing::error!(target = "gantry.workspace", "view shutdown panicked");
            }
        }
    }

    /// Watches the root of every current view and feeds changes back into the session until
    /// the returned handle is stopped or dropped.
    pub fn start_watching(self: &Arc<Self>) -> Result<WatchHandle, SessionError> {
        let (events_tx, events_rx) = channel::unbounded::<Vec<FileEvent>>();
        let watcher = FileWatcher::new(
            self.options.watch.watcher_options(),
            move |events: Vec<FileEvent>| {
                let _ = events_tx.send(events);
            },
            |err: &WatchError| {
                tracing::warn!(target = "gantry.workspace", error = %err, "file watcher error");
            },
        )?;

        let mut roots: Vec<FileUri> = self.views().iter().map(|view| view.definition().root.clone()).collect();
        roots.sort();
        roots.dedup();
        for root in &roots {
            watcher.watch_dir(root.path())?;
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let session: Weak<Session> = Arc::downgrade(self);
        let driver = thread::Builder::new()
            .name("gantry-watch-driver".to_owned())
            .spawn(move || loop {
                channel::select! {
                    recv(stop_rx) -> _ => break,
                    recv(events_rx) -> events => {
                        let Ok(events) = events else { break };
                        let Some(session) = session.upgrade() else { break };
                        let modifications: Vec<FileModification> =
                            events.into_iter().map(FileModification::from).collect();
                        if let Err(err) = session.did_modify_files(&modifications) {
                            tracing::warn!(
                                target = "gantry.workspace",
                                error = %err,
                                "failed to apply file system changes"
                            );
                        }
                    }
                }
            })
            .map_err(|err| SessionError::Spawn {
                name: "gantry-watch-driver",
                message: err.to_string(),
            });
        let driver = match driver {
            Ok(driver) => driver,
            Err(err) => {
                let _ = watcher.close();
                return Err(err);
            }
        };

        tracing::info!(target = "gantry.workspace", roots = roots.len(), "watching workspace");
        Ok(WatchHandle {
            watcher: Some(watcher),
            stop: stop_tx,
            driver: Some(driver),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("views", &self.views.lock().len())
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

fn is_relevant(view: &View, uri: &FileUri) -> bool {
    let def = view.definition();
    def.is_workspace_manifest(uri)
        || def.folder.encloses(uri)
        || def.root.encloses(uri)
        || def
            .mod_files
            .iter()
            .filter_map(FileUri::dir)
            .any(|dir| dir.encloses(uri))
}

/// Keeps a session's file watcher running.
pub struct WatchHandle {
    watcher: Option<FileWatcher>,
    stop: channel::Sender<()>,
    driver: Option<thread::JoinHandle<()>>,
}

impl WatchHandle {
    /// Closes the watcher (delivering pending events) and stops the driver thread.
    pub fn stop(mut self) -> Result<(), WatchError> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<(), WatchError> {
        let closed = match self.watcher.take() {
            Some(watcher) => watcher.close(),
            None => Ok(()),
        };
        let _ = self.stop.send(());
        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                tracing::error!(target = "gantry.workspace", "watch driver panicked");
            }
        }
        closed
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_inner() {
            tracing::debug!(target = "gantry.workspace", error = %err, "file watcher closed with error");
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("running", &self.driver.is_some())
            .finish()
    }
}

/// Tallies modifications by action, for logging.
pub(crate) fn summarize(modifications: &[FileModification]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for modification in modifications {
        let name = match modification.action {
            FileAction::Open => "open",
            FileAction::Change => "change",
            FileAction::Save => "save",
            FileAction::Close => "close",
            FileAction::Created => "created",
            FileAction::Changed => "changed",
            FileAction::Deleted => "deleted",
        };
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}
