//! Immutable, versioned workspace state.
//!
//! A [`Snapshot`] is the sole entry point for read queries. Everything it derives (metadata,
//! parsed manifests, type-checked packages) is computed lazily and memoized in persistent maps,
//! which the invalidation engine clones into the successor snapshot with stale entries removed.

mod invalidate;
mod packages;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gantry_core::{FileKind, FileUri, PersistentMap, Range};
use gantry_scheduler::{run_with_timeout, Cancelled, CancellationToken, Promise, Semaphore, TaskError};
use gantry_vfs::{FileError, FileHandle, FileSource};
use parking_lot::{Condvar, Mutex};

use crate::collab::TidyResult;
use crate::definition::{ViewType, WorkspaceDefinition};
use crate::diagnostics::{CriticalError, Diagnostic, DiagnosticSource};
use crate::file_map::FileMap;
use crate::graph::MetadataGraph;
use crate::load::{is_test_main, LoadError, LoadRequest, LoadScope};
use crate::metadata::{Metadata, PackageId, PackagePath};
use crate::modfile::{self, ModFile, ModFileError, WorkFile};
use crate::parse::{ParseError, ParseMode, ParsedFile, Symbol};
use crate::view::ViewCore;

pub use invalidate::{ModuleUpgrades, StateChange, Vulnerabilities, Vulnerability};
pub(crate) use packages::PackageHandle;

/// Process-wide snapshot counter. The first snapshot gets ID 1.
static NEXT_GLOBAL_ID: AtomicU64 = AtomicU64::new(1);

const CACHE_KIND_DIAGNOSTICS: &str = "diagnostics";
const CACHE_KIND_XREFS: &str = "xrefs";
const CACHE_KIND_METHOD_SETS: &str = "methodsets";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error(transparent)]
    Unreadable(#[from] FileError),
    #[error("{uri}: {error}")]
    Invalid { uri: FileUri, error: ModFileError },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("snapshot {global_id} was destroyed by {by}")]
    Destroyed { global_id: u64, by: &'static str },
    #[error("no metadata for package {0}")]
    NoMetadata(PackageId),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("no module tool is configured")]
    NoModuleTool,
    #[error("module tool failed: {0}")]
    ModuleTool(String),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl From<Cancelled> for SnapshotError {
    fn from(_: Cancelled) -> Self {
        SnapshotError::Cancelled
    }
}

/// Runs `produce` through `promise`, memoizing every outcome except cancellation.
fn memoize<T: Clone>(
    promise: &Promise<Result<T, SnapshotError>>,
    token: &CancellationToken,
    produce: impl FnOnce(&CancellationToken) -> Result<T, SnapshotError>,
) -> Result<T, SnapshotError> {
    promise.get(token, |token| match produce(token) {
        Err(SnapshotError::Cancelled) => Err(Cancelled),
        outcome => Ok(outcome),
    })?
}

/// The promise for `key`, installing a new one if there is none.
fn promise_for<K: Ord + Clone, T: Clone>(
    map: &mut PersistentMap<K, Promise<T>>,
    key: &K,
    label: impl FnOnce() -> String,
) -> Promise<T> {
    if let Some(promise) = map.get(key) {
        return promise.clone();
    }
    let promise = Promise::new(label());
    map.set(key.clone(), promise.clone());
    promise
}

/// Package paths that must be reloaded before the metadata of a package can be trusted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingLoad {
    pub(crate) pkg_paths: Vec<PackagePath>,
    /// Files of the invalidated metadata, so that queries on them find the entry.
    pub(crate) files: Vec<FileUri>,
}

type Memo<T> = Promise<Result<Arc<T>, SnapshotError>>;

#[derive(Clone, Default)]
pub(crate) struct SnapshotState {
    pub(crate) initialized: bool,
    pub(crate) initial_error: Option<CriticalError>,
    pub(crate) meta: Arc<MetadataGraph>,
    pub(crate) workspace_packages: Arc<BTreeSet<PackageId>>,
    pub(crate) should_load: PersistentMap<PackageId, PendingLoad>,
    pub(crate) unloadable: PersistentMap<FileUri, ()>,
    pub(crate) package_handles: PersistentMap<PackageId, Arc<PackageHandle>>,
    pub(crate) active_packages: PersistentMap<PackageId, Arc<crate::check::Package>>,
    pub(crate) parse_mod: PersistentMap<FileUri, Memo<ModFile>>,
    pub(crate) parse_work: PersistentMap<FileUri, Memo<WorkFile>>,
    pub(crate) mod_tidy: PersistentMap<FileUri, Memo<TidyResult>>,
    pub(crate) mod_why: PersistentMap<FileUri, Memo<BTreeMap<String, String>>>,
    pub(crate) symbolize: PersistentMap<FileUri, Memo<Vec<Symbol>>>,
    pub(crate) builtin: Option<FileUri>,
    pub(crate) module_upgrades: ModuleUpgrades,
    pub(crate) vulnerabilities: Vulnerabilities,
}

#[derive(Debug, Default)]
struct RefState {
    count: usize,
    /// Set when destruction starts. References can still be taken until the count drains.
    destroying: Option<&'static str>,
    destroyed_by: Option<&'static str>,
}

/// An immutable view of the workspace at one instant.
pub struct Snapshot {
    sequence_id: u64,
    global_id: u64,
    core: Arc<ViewCore>,
    background: CancellationToken,
    refs: Mutex<RefState>,
    released: Condvar,
    destroyed: AtomicBool,
    /// Serializes reloads of pending packages.
    reload_permit: Semaphore,
    state: Mutex<SnapshotState>,
    files: Mutex<FileMap>,
}

impl Snapshot {
    pub(crate) fn new(
        core: Arc<ViewCore>,
        sequence_id: u64,
        background: CancellationToken,
        state: SnapshotState,
        files: FileMap,
    ) -> Self {
        Self {
            sequence_id,
            global_id: NEXT_GLOBAL_ID.fetch_add(1, Ordering::Relaxed),
            core,
            background,
            refs: Mutex::new(RefState::default()),
            released: Condvar::new(),
            destroyed: AtomicBool::new(false),
            reload_permit: Semaphore::new(1),
            state: Mutex::new(state),
            files: Mutex::new(files),
        }
    }

    /// Monotonic within a view.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Unique within the process.
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    pub fn view_id(&self) -> &str {
        &self.core.id
    }

    pub fn definition(&self) -> &WorkspaceDefinition {
        &self.core.definition
    }

    /// Cancelled once this snapshot is superseded. Request tokens are normally children of it.
    pub fn background_token(&self) -> &CancellationToken {
        &self.background
    }

    fn check(&self, token: &CancellationToken) -> Result<(), SnapshotError> {
        Cancelled::check(&self.background)?;
        Cancelled::check(token)?;
        Ok(())
    }

    /// Like [`Snapshot::check`], but a superseded snapshot may still finish loading so that its
    /// successor inherits the result. Only destruction refuses.
    fn check_alive(&self, token: &CancellationToken) -> Result<(), SnapshotError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SnapshotError::Cancelled);
        }
        Cancelled::check(token)?;
        Ok(())
    }

    /// Takes a reference that keeps this snapshot from being destroyed until it is released.
    pub fn acquire(self: &Arc<Self>) -> Result<SnapshotRelease, SnapshotError> {
        let mut refs = self.refs.lock();
        if let Some(by) = refs.destroyed_by {
            return Err(SnapshotError::Destroyed {
                global_id: self.global_id,
                by,
            });
        }
        refs.count += 1;
        Ok(SnapshotRelease {
            snapshot: Some(Arc::clone(self)),
        })
    }

    fn decref(&self) {
        let mut refs = self.refs.lock();
        match refs.count.checked_sub(1) {
            Some(count) => refs.count = count,
            None => {
                tracing::error!(
                    target = "gantry.workspace",
                    snapshot = self.global_id,
                    "snapshot released more often than acquired"
                );
                debug_assert!(false, "unbalanced snapshot release");
            }
        }
        if refs.count == 0 {
            self.released.notify_all();
        }
    }

    pub fn destroyed_by(&self) -> Option<&'static str> {
        self.refs.lock().destroyed_by
    }

    /// Waits for outstanding references to be released, then refuses new ones and drops every
    /// memoized result. Queries arriving afterwards see cancellation.
    pub(crate) fn destroy(&self, by: &'static str) {
        {
            let mut refs = self.refs.lock();
            if let Some(previous) = refs.destroying {
                tracing::error!(
                    target = "gantry.workspace",
                    snapshot = self.global_id,
                    previous,
                    by,
                    "snapshot destroyed twice"
                );
                return;
            }
            refs.destroying = Some(by);
            while refs.count > 0 {
                self.released.wait(&mut refs);
            }
            refs.destroyed_by = Some(by);
            self.destroyed.store(true, Ordering::Release);
        }

        self.background.cancel();
        std::mem::take(&mut *self.files.lock()).destroy();
        let state = std::mem::take(&mut *self.state.lock());
        drop(state);
        tracing::trace!(
            target = "gantry.workspace",
            snapshot = self.global_id,
            by,
            "snapshot destroyed"
        );
    }

    pub fn initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// The error that prevented the workspace from loading, if any.
    pub fn critical_error(&self) -> Option<CriticalError> {
        self.state.lock().initial_error.clone()
    }

    pub fn module_upgrades(&self, mod_file: &FileUri) -> BTreeMap<String, String> {
        self.state
            .lock()
            .module_upgrades
            .get(mod_file)
            .cloned()
            .unwrap_or_default()
    }

    pub fn vulnerabilities(&self, mod_file: &FileUri) -> Vec<Vulnerability> {
        self.state
            .lock()
            .vulnerabilities
            .get(mod_file)
            .cloned()
            .unwrap_or_default()
    }

    /// The file of the synthetic `builtin` package, once loaded.
    pub fn builtin_file(&self) -> Option<FileUri> {
        self.state.lock().builtin.clone()
    }

    pub fn is_unloadable(&self, uri: &FileUri) -> bool {
        self.state.lock().unloadable.contains_key(uri)
    }

    /// Whether `id` is waiting for a reload.
    pub fn should_load(&self, id: &PackageId) -> bool {
        self.state.lock().should_load.contains_key(id)
    }

    /// Reads `uri`, recording the handle so that later reads of this snapshot agree.
    pub fn read_file(
        &self,
        uri: &FileUri,
        token: &CancellationToken,
    ) -> Result<FileHandle, SnapshotError> {
        Cancelled::check(token)?;
        if let Some(fh) = self.files.lock().get(uri) {
            return Ok(fh.clone());
        }
        let fh = self.core.fs.read_file(uri);
        let mut files = self.files.lock();
        if let Some(existing) = files.get(uri) {
            return Ok(existing.clone());
        }
        files.set(uri.clone(), fh.clone());
        Ok(fh)
    }

    /// The handle recorded for `uri`, without reading anything.
    pub fn find_file(&self, uri: &FileUri) -> Option<FileHandle> {
        self.files.lock().get(uri).cloned()
    }

    /// Overlay-declared kind, falling back to the extension.
    pub fn file_kind(&self, fh: &FileHandle) -> FileKind {
        match fh.kind() {
            FileKind::Unknown => FileKind::for_path(fh.uri().path()),
            kind => kind,
        }
    }

    /// Every directory containing a file this snapshot has observed.
    pub fn dirs(&self) -> Arc<BTreeSet<FileUri>> {
        self.files.lock().dirs()
    }

    pub fn overlays(&self) -> Vec<Arc<gantry_vfs::Overlay>> {
        self.files.lock().overlays()
    }

    /// Metadata already in the graph, without loading.
    pub fn metadata(&self, id: &PackageId) -> Option<Arc<Metadata>> {
        self.state.lock().meta.metadata(id).cloned()
    }

    pub(crate) fn graph(&self) -> Arc<MetadataGraph> {
        self.state.lock().meta.clone()
    }

    /// Packages containing `uri`, loading them if needed. Sorted by number of compiled files,
    /// then with intermediate test variants last.
    pub fn metadata_for_file(
        &self,
        uri: &FileUri,
        token: &CancellationToken,
    ) -> Result<Vec<Arc<Metadata>>, SnapshotError> {
        self.await_initialized(token)?;
        self.check(token)?;

        if self.pending_for_file(uri).is_some() {
            // Callers that find the same entries pending wait here, then find them loaded.
            let _permit = self.reload_permit.acquire(token)?;
            self.reload_file(uri, token)?;
        }

        let state = self.state.lock();
        let mut metas: Vec<Arc<Metadata>> = state
            .meta
            .ids_for_file(uri)
            .iter()
            .filter_map(|id| state.meta.metadata(id).cloned())
            .collect();
        metas.sort_by_key(|meta| (meta.compiled_files.len(), meta.is_intermediate_test_variant()));
        Ok(metas)
    }

    /// The packages of `uri` and the pending entries to reload with it, or `None` if nothing
    /// needs loading.
    fn pending_for_file(&self, uri: &FileUri) -> Option<(Vec<PackageId>, Vec<(PackageId, PendingLoad)>)> {
        let state = self.state.lock();
        let ids = state.meta.ids_for_file(uri).to_vec();
        let pending: Vec<(PackageId, PendingLoad)> = state
            .should_load
            .iter()
            .filter(|(id, load)| ids.contains(id) || load.files.contains(uri))
            .map(|(id, load)| (id.clone(), load.clone()))
            .collect();
        let unknown = ids.is_empty() && !state.unloadable.contains_key(uri);
        (!pending.is_empty() || unknown).then_some((ids, pending))
    }

    /// Loads `uri` together with its pending packages. Must hold the reload permit.
    fn reload_file(&self, uri: &FileUri, token: &CancellationToken) -> Result<(), SnapshotError> {
        // Another caller may have finished the same reload while this one waited.
        let Some((ids, pending)) = self.pending_for_file(uri) else {
            return Ok(());
        };
        self.check(token)?;

        let mut scopes = vec![LoadScope::File(uri.clone())];
        let paths: BTreeSet<&PackagePath> =
            pending.iter().flat_map(|(_, load)| &load.pkg_paths).collect();
        scopes.extend(paths.into_iter().cloned().map(LoadScope::Package));

        let result = self.load(&scopes, token);
        if matches!(result, Err(LoadError::Cancelled)) || token.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }

        let mut state = self.state.lock();
        let reloaded = state.meta.ids_for_file(uri).to_vec();
        for id in pending.iter().map(|(id, _)| id).chain(&ids).chain(&reloaded) {
            state.should_load.delete(id);
        }
        match result {
            Ok(()) | Err(LoadError::NoPackages { .. }) => {}
            Err(err) => tracing::warn!(
                target = "gantry.workspace",
                uri = %uri,
                error = %err,
                "failed to load packages for file"
            ),
        }
        if reloaded.is_empty() {
            state.unloadable.set(uri.clone(), ());
        }
        Ok(())
    }

    /// Every package in the graph, after reloading anything pending.
    pub fn all_metadata(&self, token: &CancellationToken) -> Result<Vec<Arc<Metadata>>, SnapshotError> {
        self.await_initialized(token)?;
        self.check(token)?;
        self.reload_workspace(token)?;
        Ok(self.graph().packages().cloned().collect())
    }

    /// The packages that make up the workspace proper (no dependencies, no intermediate test
    /// variants), after reloading anything pending.
    pub fn workspace_metadata(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<Arc<Metadata>>, SnapshotError> {
        self.await_initialized(token)?;
        self.check(token)?;
        self.reload_workspace(token)?;
        let state = self.state.lock();
        Ok(state
            .workspace_packages
            .iter()
            .filter_map(|id| state.meta.metadata(id).cloned())
            .collect())
    }

    /// Packages importing `id`, directly or (if `transitive`) indirectly.
    pub fn reverse_dependencies(
        &self,
        id: &PackageId,
        transitive: bool,
        token: &CancellationToken,
    ) -> Result<BTreeMap<PackageId, Arc<Metadata>>, SnapshotError> {
        self.await_initialized(token)?;
        self.check(token)?;
        let graph = self.graph();
        let ids: Vec<PackageId> = if transitive {
            graph
                .reverse_transitive_ids(std::slice::from_ref(id), false)
                .into_iter()
                .collect()
        } else {
            graph.imported_by(id).to_vec()
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let meta = graph.metadata(&id)?.clone();
                Some((id, meta))
            })
            .collect())
    }

    /// Blocks until the view's initial load has finished, then initializes this snapshot if it
    /// has not been initialized yet.
    pub fn await_initialized(&self, token: &CancellationToken) -> Result<(), SnapshotError> {
        self.check_alive(token)?;
        self.core.initial_load.wait(token)?;
        self.initialize(token)
    }

    /// Loads the workspace. Runs at most once per snapshot (unless cancelled); a failure is kept
    /// as the critical error until a manifest change reinitializes the view.
    pub(crate) fn initialize(&self, token: &CancellationToken) -> Result<(), SnapshotError> {
        self.check_alive(token)?;
        let _permit = self.core.init_permit.acquire(token)?;
        self.check_alive(token)?;
        if self.state.lock().initialized {
            return Ok(());
        }

        let started = Instant::now();
        let def = &self.core.definition;
        let mut scopes = Vec::new();
        let mut manifest_diagnostics = Vec::new();

        let mut manifest_error = |uri: &FileUri, err: SnapshotError| match err {
            SnapshotError::Cancelled => Err(SnapshotError::Cancelled),
            err => {
                manifest_diagnostics.push(Diagnostic::error(
                    uri.clone(),
                    Range::default(),
                    DiagnosticSource::Module,
                    err.to_string(),
                ));
                Ok(())
            }
        };
        if let Some(work_file) = &def.work_file {
            if let Err(err) = self.parse_work(work_file, token) {
                manifest_error(work_file, err)?;
            }
        }
        for mod_file in &def.mod_files {
            if let Err(err) = self.parse_mod(mod_file, token) {
                manifest_error(mod_file, err)?;
            }
            let module_dir = if def.view_type == ViewType::SingleModule {
                Some(def.root.clone())
            } else {
                mod_file.dir()
            };
            if let Some(dir) = module_dir {
                if !scopes.contains(&LoadScope::Module(dir.clone())) {
                    scopes.push(LoadScope::Module(dir));
                }
            }
        }
        if scopes.is_empty() {
            scopes.push(match def.view_type {
                ViewType::AdHoc => LoadScope::AdHoc,
                _ => LoadScope::View,
            });
        }
        scopes.push(LoadScope::Package(PackagePath::new("builtin")));

        let result = self.load(&scopes, token);
        let initial_error = match result {
            Err(LoadError::Cancelled) => return Err(SnapshotError::Cancelled),
            Err(err) => CriticalError::from_load_error(&err).map(|mut critical| {
                critical.diagnostics.extend(manifest_diagnostics);
                critical
            }),
            Ok(()) => manifest_diagnostics.first().map(|first| CriticalError {
                message: first.message.clone(),
                diagnostics: manifest_diagnostics.clone(),
            }),
        };

        let mut state = self.state.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SnapshotError::Cancelled);
        }
        match &initial_error {
            Some(err) => tracing::warn!(
                target = "gantry.workspace",
                view = %self.core.id,
                error = %err.message,
                "initial workspace load failed"
            ),
            None => tracing::info!(
                target = "gantry.workspace",
                view = %self.core.id,
                packages = state.meta.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "initial workspace load finished"
            ),
        }
        state.initialized = true;
        state.initial_error = initial_error;
        Ok(())
    }

    /// Reloads every package marked for reload. Load failures are logged; the pending entries
    /// are cleared either way.
    fn reload_workspace(&self, token: &CancellationToken) -> Result<(), SnapshotError> {
        if self.state.lock().should_load.is_empty() {
            return Ok(());
        }
        let _permit = self.reload_permit.acquire(token)?;
        let pending: Vec<(PackageId, PendingLoad)> = {
            let state = self.state.lock();
            state
                .should_load
                .iter()
                .map(|(id, load)| (id.clone(), load.clone()))
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let paths: BTreeSet<&PackagePath> =
            pending.iter().flat_map(|(_, load)| &load.pkg_paths).collect();
        let scopes: Vec<LoadScope> = paths.into_iter().cloned().map(LoadScope::Package).collect();
        let result = self.load(&scopes, token);
        if matches!(result, Err(LoadError::Cancelled)) || token.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }

        let mut state = self.state.lock();
        for (id, _) in &pending {
            state.should_load.delete(id);
        }
        match result {
            Ok(()) | Err(LoadError::NoPackages { .. }) => {}
            Err(err) => tracing::warn!(
                target = "gantry.workspace",
                view = %self.core.id,
                error = %err,
                "failed to reload workspace packages"
            ),
        }
        Ok(())
    }

    /// Runs the loader for `scopes` and adds every package it reports that the graph does not
    /// already contain.
    pub(crate) fn load(&self, scopes: &[LoadScope], token: &CancellationToken) -> Result<(), LoadError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LoadError::Cancelled);
        }
        Cancelled::check(token)?;
        let def = &self.core.definition;
        let queries: Vec<String> = scopes.iter().map(LoadScope::query).collect();
        let request = LoadRequest {
            dir: def.root.path().to_path_buf(),
            env: def.env.clone(),
            build_flags: def.build_flags.clone(),
            queries: queries.clone(),
            overlays: self.core.fs.unsaved_overlays(),
        };

        let started = Instant::now();
        let loader = Arc::clone(&self.core.collaborators.loader);
        let result = run_with_timeout(
            "gantry-load",
            self.core.load_timeout,
            token.clone(),
            move |token| loader.load(&request, &token),
        );
        let packages = match result {
            Ok(packages) => packages?,
            Err(TaskError::Cancelled) => return Err(LoadError::Cancelled),
            Err(TaskError::DeadlineExceeded(limit)) => return Err(LoadError::Timeout(limit)),
            Err(err) => return Err(LoadError::Failed(anyhow::anyhow!("package loader failed: {err}"))),
        };
        if packages.is_empty() {
            return Err(LoadError::NoPackages { queries });
        }

        let mut state = self.state.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LoadError::Cancelled);
        }
        let mut updates = BTreeMap::new();
        for mut meta in packages {
            if is_test_main(meta.id.as_str()) {
                continue;
            }
            if meta.pkg_path.as_str() == "builtin" {
                if let Some(file) = meta.compiled_files.first().or(meta.files.first()) {
                    state.builtin = Some(file.clone());
                }
            }
            if state.meta.contains(&meta.id) || updates.contains_key(&meta.id) {
                continue;
            }
            if !self.filter_files(&mut meta) {
                continue;
            }
            state.should_load.delete(&meta.id);
            updates.insert(meta.id.clone(), Some(Arc::new(meta)));
        }

        let added = updates.len();
        let graph = state.meta.update(updates);
        if !Arc::ptr_eq(&graph, &state.meta) {
            state.meta = graph;
            state.workspace_packages = compute_workspace_packages(&self.core, &state.meta);
            retain_consistent_handles(&mut state);
        }
        tracing::info!(
            target = "gantry.workspace",
            view = %self.core.id,
            queries = ?queries,
            added,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded packages"
        );
        Ok(())
    }

    /// Drops files excluded by the directory filters. Returns false if that leaves a package
    /// that had files with none.
    fn filter_files(&self, meta: &mut Metadata) -> bool {
        let root = self.core.definition.root.path();
        let filter = &self.core.filter;
        let had_files = !meta.compiled_files.is_empty() || !meta.files.is_empty();
        let keep = |uri: &FileUri| {
            !uri.dir()
                .is_some_and(|dir| filter.excludes_under(root, dir.path()))
        };
        meta.compiled_files.retain(|uri| keep(uri));
        meta.files.retain(|uri| keep(uri));
        !had_files || !meta.compiled_files.is_empty() || !meta.files.is_empty()
    }

    pub fn parse_mod(&self, uri: &FileUri, token: &CancellationToken) -> Result<Arc<ModFile>, SnapshotError> {
        let promise = promise_for(&mut self.state.lock().parse_mod, uri, || format!("parse_mod {uri}"));
        memoize(&promise, token, |token| {
            let text = self.manifest_text(uri, token)?;
            let parsed = modfile::parse_mod(&text).map_err(|error| ManifestError::Invalid {
                uri: uri.clone(),
                error,
            })?;
            Ok(Arc::new(parsed))
        })
    }

    pub fn parse_work(&self, uri: &FileUri, token: &CancellationToken) -> Result<Arc<WorkFile>, SnapshotError> {
        let promise = promise_for(&mut self.state.lock().parse_work, uri, || format!("parse_work {uri}"));
        memoize(&promise, token, |token| {
            let text = self.manifest_text(uri, token)?;
            let parsed = modfile::parse_work(&text).map_err(|error| ManifestError::Invalid {
                uri: uri.clone(),
                error,
            })?;
            Ok(Arc::new(parsed))
        })
    }

    fn manifest_text(&self, uri: &FileUri, token: &CancellationToken) -> Result<String, SnapshotError> {
        let fh = self.read_file(uri, token)?;
        let content = fh.content().map_err(ManifestError::from)?;
        Ok(String::from_utf8_lossy(content).into_owned())
    }

    /// The result of tidying the module declared by `uri`.
    pub fn mod_tidy(&self, uri: &FileUri, token: &CancellationToken) -> Result<Arc<TidyResult>, SnapshotError> {
        let promise = promise_for(&mut self.state.lock().mod_tidy, uri, || format!("mod_tidy {uri}"));
        memoize(&promise, token, |token| {
            let tool = self
                .core
                .collaborators
                .module_tool
                .clone()
                .ok_or(SnapshotError::NoModuleTool)?;
            // Tidying a manifest that does not parse only repeats the parse error.
            self.parse_mod(uri, token)?;
            self.check(token)?;
            let tidied = tool
                .tidy(uri, &self.core.definition.env, token)
                .map_err(|err| self.module_tool_error(token, err))?;
            Ok(Arc::new(tidied))
        })
    }

    /// For each module required by `uri`, why it is needed.
    pub fn mod_why(
        &self,
        uri: &FileUri,
        token: &CancellationToken,
    ) -> Result<Arc<BTreeMap<String, String>>, SnapshotError> {
        let promise = promise_for(&mut self.state.lock().mod_why, uri, || format!("mod_why {uri}"));
        memoize(&promise, token, |token| {
            let tool = self
                .core
                .collaborators
                .module_tool
                .clone()
                .ok_or(SnapshotError::NoModuleTool)?;
            let parsed = self.parse_mod(uri, token)?;
            let modules: Vec<String> = parsed.requires.iter().map(|req| req.path.clone()).collect();
            self.check(token)?;
            let why = tool
                .why(uri, &modules, token)
                .map_err(|err| self.module_tool_error(token, err))?;
            Ok(Arc::new(why))
        })
    }

    fn module_tool_error(&self, token: &CancellationToken, err: anyhow::Error) -> SnapshotError {
        if token.is_cancelled() || self.background.is_cancelled() {
            SnapshotError::Cancelled
        } else {
            SnapshotError::ModuleTool(format!("{err:#}"))
        }
    }

    /// Top-level declarations of a source file.
    pub fn symbolize(&self, uri: &FileUri, token: &CancellationToken) -> Result<Arc<Vec<Symbol>>, SnapshotError> {
        let promise = promise_for(&mut self.state.lock().symbolize, uri, || format!("symbolize {uri}"));
        memoize(&promise, token, |token| {
            let parsed = self.parse_full(uri, token)?;
            Ok(Arc::new(parsed.symbols.clone()))
        })
    }

    /// A full parse of `uri`, shared with every other snapshot of the view through the parse
    /// cache.
    pub fn parse_full(&self, uri: &FileUri, token: &CancellationToken) -> Result<Arc<ParsedFile>, SnapshotError> {
        let fh = self.read_file(uri, token)?;
        Ok(self.core.parse_cache.parse(&fh, ParseMode::Full)?)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("view", &self.core.id)
            .field("sequence_id", &self.sequence_id)
            .field("global_id", &self.global_id)
            .finish_non_exhaustive()
    }
}

/// Releases a reference taken by [`Snapshot::acquire`]. Releasing twice is harmless; dropping
/// releases.
#[must_use = "dropping a SnapshotRelease releases the snapshot immediately"]
pub struct SnapshotRelease {
    snapshot: Option<Arc<Snapshot>>,
}

impl SnapshotRelease {
    pub fn release(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.decref();
        }
    }
}

impl Drop for SnapshotRelease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SnapshotRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRelease")
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.global_id))
            .finish()
    }
}

/// Packages that belong to the workspace: loaded from a workspace module (or, outside modules,
/// from under the view root), not filtered out, and not intermediate test variants.
pub(crate) fn compute_workspace_packages(
    core: &ViewCore,
    graph: &MetadataGraph,
) -> Arc<BTreeSet<PackageId>> {
    let def = &core.definition;
    let ids = graph
        .packages()
        .filter(|meta| {
            if meta.is_intermediate_test_variant()
                || meta.standalone
                || meta.pkg_path.as_str() == "builtin"
            {
                return false;
            }
            let Some(first) = meta.compiled_files.first().or(meta.files.first()) else {
                return false;
            };
            let in_workspace = match def.view_type {
                ViewType::SingleModule | ViewType::MultiModule => meta
                    .module
                    .as_ref()
                    .and_then(|module| module.mod_file.as_ref())
                    .is_some_and(|mod_file| def.is_workspace_manifest(mod_file)),
                ViewType::ExternalDriver | ViewType::LegacyPath | ViewType::AdHoc => {
                    def.root.encloses(first)
                }
            };
            in_workspace
                && !first
                    .dir()
                    .is_some_and(|dir| core.filter.excludes_under(def.root.path(), dir.path()))
        })
        .map(|meta| meta.id.clone())
        .collect();
    Arc::new(ids)
}

/// Removes package handles whose metadata is no longer the graph's.
pub(crate) fn retain_consistent_handles(state: &mut SnapshotState) {
    let stale: Vec<PackageId> = state
        .package_handles
        .iter()
        .filter(|(id, handle)| {
            !state
                .meta
                .metadata(id)
                .is_some_and(|meta| Arc::ptr_eq(meta, &handle.metadata))
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in stale {
        state.package_handles.delete(&id);
        state.active_packages.delete(&id);
    }
}
