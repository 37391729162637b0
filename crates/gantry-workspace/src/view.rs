//! A view owns the current snapshot of one build configuration and is the only place new
//! snapshots are made.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gantry_core::FileUri;
use gantry_scheduler::{CancellationToken, Latch, Semaphore};
use gantry_vfs::OverlayFs;
use parking_lot::Mutex;

use crate::collab::Collaborators;
use crate::definition::WorkspaceDefinition;
use crate::file_map::FileMap;
use crate::options::{DirectoryFilter, Options};
use crate::parse::ParseCache;
use crate::snapshot::{Snapshot, SnapshotError, SnapshotRelease, SnapshotState, StateChange};

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("view has been shut down")]
    Shutdown,
    #[error("failed to spawn {name} thread: {message}")]
    Spawn { name: &'static str, message: String },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Configuration shared by every snapshot of a view. Immutable once the view exists.
pub(crate) struct ViewCore {
    pub(crate) id: String,
    pub(crate) definition: WorkspaceDefinition,
    pub(crate) filter: DirectoryFilter,
    pub(crate) fs: Arc<OverlayFs>,
    pub(crate) collaborators: Collaborators,
    pub(crate) parse_cache: ParseCache,
    pub(crate) load_timeout: Duration,
    /// Opened once the initial workspace load has finished (successfully or not).
    pub(crate) initial_load: Latch,
    /// Serializes snapshot initialization.
    pub(crate) init_permit: Semaphore,
}

struct Current {
    snapshot: Arc<Snapshot>,
    /// The view's own reference to `snapshot`.
    release: SnapshotRelease,
}

pub struct View {
    core: Arc<ViewCore>,
    token: CancellationToken,
    /// `None` once the view has been shut down.
    current: Mutex<Option<Current>>,
    initial_load: Mutex<Option<thread::JoinHandle<()>>>,
    destroys: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Opens the initial-load latch when dropped, so waiters are released even if the load
/// panics.
struct OpenOnDrop(Arc<ViewCore>);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.initial_load.open();
    }
}

impl View {
    /// Creates a view and starts loading its workspace in the background.
    pub fn new(
        id: impl Into<String>,
        definition: WorkspaceDefinition,
        fs: Arc<OverlayFs>,
        collaborators: Collaborators,
        options: &Options,
    ) -> Result<View, ViewError> {
        let core = Arc::new(ViewCore {
            id: id.into(),
            filter: options.directory_filter(),
            fs,
            parse_cache: ParseCache::new(collaborators.parser.clone()),
            collaborators,
            load_timeout: options.load_timeout(),
            initial_load: Latch::new(),
            init_permit: Semaphore::new(1),
            definition,
        });
        let token = CancellationToken::new();

        let snapshot = Arc::new(Snapshot::new(
            core.clone(),
            0,
            token.child_token(),
            SnapshotState::default(),
            FileMap::new(),
        ));
        let view_release = snapshot.acquire()?;
        let load_release = snapshot.acquire()?;

        tracing::info!(
            target = "gantry.workspace",
            view = %core.id,
            root = %core.definition.root,
            view_type = ?core.definition.view_type,
            "created view"
        );

        let initial_load = {
            let core = core.clone();
            let snapshot = snapshot.clone();
            let token = token.child_token();
            thread::Builder::new()
                .name("gantry-initial-load".to_owned())
                .spawn(move || {
                    let _open = OpenOnDrop(core);
                    let _release = load_release;
                    if let Err(err) = snapshot.initialize(&token) {
                        tracing::debug!(
                            target = "gantry.workspace",
                            error = %err,
                            "initial workspace load did not complete"
                        );
                    }
                })
                .map_err(|err| ViewError::Spawn {
                    name: "gantry-initial-load",
                    message: err.to_string(),
                })?
        };

        Ok(View {
            core,
            token,
            current: Mutex::new(Some(Current {
                snapshot,
                release: view_release,
            })),
            initial_load: Mutex::new(Some(initial_load)),
            destroys: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn definition(&self) -> &WorkspaceDefinition {
        &self.core.definition
    }

    pub fn folder(&self) -> &FileUri {
        &self.core.definition.folder
    }

    /// The current snapshot, with a reference the caller must release.
    pub fn snapshot(&self) -> Result<(Arc<Snapshot>, SnapshotRelease), ViewError> {
        let current = self.current.lock();
        let current = current.as_ref().ok_or(ViewError::Shutdown)?;
        let release = current.snapshot.acquire()?;
        Ok((current.snapshot.clone(), release))
    }

    /// Applies `change`, making the result the view's current snapshot.
    ///
    /// The previous snapshot is cancelled and destroyed in the background once every
    /// outstanding reference to it has been released.
    pub fn invalidate(&self, change: StateChange) -> Result<(Arc<Snapshot>, SnapshotRelease), ViewError> {
        // Not tied to any request: the caller giving up must not leave the view half-updated.
        let token = CancellationToken::new();

        let mut current = self.current.lock();
        let previous = current.take().ok_or(ViewError::Shutdown)?;
        previous.snapshot.background_token().cancel();
        if let Err(err) = previous.snapshot.await_initialized(&token) {
            tracing::debug!(
                target = "gantry.workspace",
                view = %self.core.id,
                error = %err,
                "previous snapshot did not initialize"
            );
        }

        let next = Arc::new(previous.snapshot.clone_with(&change, self.token.child_token()));
        let acquired = next.acquire().and_then(|view_release| {
            let caller_release = next.acquire()?;
            Ok((view_release, caller_release))
        });
        let (view_release, caller_release) = match acquired {
            Ok(releases) => releases,
            Err(err) => {
                *current = Some(previous);
                return Err(err.into());
            }
        };
        *current = Some(Current {
            snapshot: next.clone(),
            release: view_release,
        });
        drop(current);

        self.destroy_in_background(previous);
        Ok((next, caller_release))
    }

    fn destroy_in_background(&self, previous: Current) {
        let Current {
            snapshot,
            mut release,
        } = previous;
        let mut destroys = self.destroys.lock();
        destroys.retain(|handle| !handle.is_finished());
        let spawned = thread::Builder::new()
            .name("gantry-snapshot-destroy".to_owned())
            .spawn({
                let snapshot = snapshot.clone();
                move || {
                    release.release();
                    snapshot.destroy("View::invalidate");
                }
            });
        match spawned {
            Ok(handle) => destroys.push(handle),
            Err(err) => tracing::error!(
                target = "gantry.workspace",
                view = %self.core.id,
                snapshot = snapshot.global_id(),
                error = %err,
                "failed to spawn snapshot destroy thread"
            ),
        }
    }

    /// Cancels all work, destroys the current snapshot and waits for background destruction to
    /// finish. Every reference obtained from the view must have been released. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
        let current = self.current.lock().take();
        if let Some(handle) = self.initial_load.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target = "gantry.workspace", view = %self.core.id, "initial load panicked");
            }
        }
        if let Some(Current {
            snapshot,
            mut release,
        }) = current
        {
            release.release();
            snapshot.destroy("View::shutdown");
            tracing::info!(target = "gantry.workspace", view = %self.core.id, "view shut down");
        }
        let destroys: Vec<_> = self.destroys.lock().drain(..).collect();
        for handle in destroys {
            if handle.join().is_err() {
                tracing::error!(target = "gantry.workspace", view = %self.core.id, "snapshot destroy panicked");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.current.lock().is_none()
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.core.id)
            .field("root", &self.core.definition.root)
            .field("view_type", &self.core.definition.view_type)
            .finish_non_exhaustive()
    }
}
