use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gantry_core::{FileKind, FileUri, PersistentMap};
use gantry_scheduler::{CancellationToken, Promise};
use gantry_vfs::FileHandle;

use super::{compute_workspace_packages, retain_consistent_handles, PendingLoad, Snapshot};
use crate::load::is_command_line_arguments;
use crate::metadata::PackageId;
use crate::parse::{ParseMode, ParsedFile};

pub type ModuleUpgrades = BTreeMap<FileUri, BTreeMap<String, String>>;
pub type Vulnerabilities = BTreeMap<FileUri, Vec<Vulnerability>>;

/// A known vulnerability affecting a module required by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vulnerability {
    pub id: String,
    pub module: String,
    pub fixed_version: Option<String>,
}

/// A batch of changes applied to a view by one invalidation.
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    /// The new handle of every changed file. Deleted files map to a handle that does not exist.
    pub files: BTreeMap<FileUri, FileHandle>,
    /// Available upgrades per module file, replacing earlier reports for the same file.
    pub module_upgrades: ModuleUpgrades,
    pub vulnerabilities: Vulnerabilities,
}

impl StateChange {
    pub fn files(files: impl IntoIterator<Item = FileHandle>) -> Self {
        Self {
            files: files.into_iter().map(|fh| (fh.uri().clone(), fh)).collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.module_upgrades.is_empty() && self.vulnerabilities.is_empty()
    }
}

/// How a change to one source file affects package metadata.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MetadataChange {
    invalidate: bool,
    /// The file may now belong to a different package.
    package_file_changed: bool,
    import_deleted: bool,
}

impl MetadataChange {
    const NONE: MetadataChange = MetadataChange {
        invalidate: false,
        package_file_changed: false,
        import_deleted: false,
    };
}

impl Snapshot {
    /// Derives the successor of this snapshot with `change` applied.
    ///
    /// Never fails: anything that cannot be decided here is recomputed lazily by the successor.
    /// The caller must have waited for this snapshot to initialize.
    pub(crate) fn clone_with(&self, change: &StateChange, background: CancellationToken) -> Snapshot {
        let def = &self.core.definition;
        let old_files = self.files.lock().clone();
        let mut state = self.state.lock().clone();
        let old_meta = state.meta.clone();

        let mut reinit = false;
        for (uri, new) in &change.files {
            let old = old_files.get(uri);
            let on_disk = changed_on_disk(old, new);
            if state.initial_error.is_some() && in_vendor(uri) {
                reinit = true;
            }
            if is_vendor_manifest(uri) {
                reinit = true;
            }
            if on_disk && (def.is_workspace_manifest(uri) || self.is_workspace_sum_file(uri)) {
                reinit = true;
            }
        }

        let mut direct: BTreeMap<PackageId, bool> = BTreeMap::new();
        let mut any_opened_or_closed = false;
        let mut any_file_added = false;
        let mut any_import_deleted = false;
        let mut go_mod_changed = false;
        let mut stats = StatCache::default();

        for (uri, new) in &change.files {
            let old = old_files.get(uri);
            any_opened_or_closed |= old.is_some_and(FileHandle::is_overlay) != new.is_overlay();
            any_file_added |= !old.is_some_and(FileHandle::exists) && new.exists();
            go_mod_changed |= uri.base_name() == "go.mod";

            let mut file_change = MetadataChange::NONE;
            // By extension: the loader ignores the editor's language id.
            if FileKind::for_path(uri.path()) == FileKind::Go {
                file_change = self.metadata_changes(old, new);
            }
            if file_change.invalidate {
                // A reload may now find a package for it.
                state.unloadable.delete(uri);
            }
            let invalidate_metadata = file_change.invalidate || reinit;
            any_import_deleted |= file_change.import_deleted;

            for id in invalidated_package_ids(uri, &old_meta, file_change.package_file_changed, &mut stats) {
                let entry = direct.entry(id).or_insert(false);
                *entry |= invalidate_metadata;
            }

            if invalidate_metadata || file_was_saved(old, new) {
                delete_most_relevant_mod_file(&mut state.mod_tidy, uri);
                delete_most_relevant_mod_file(&mut state.mod_why, uri);
            }
            state.parse_mod.delete(uri);
            state.parse_work.delete(uri);
            state.mod_tidy.delete(uri);
            state.mod_why.delete(uri);
            state.symbolize.delete(uri);
        }
        if go_mod_changed {
            state.mod_why = PersistentMap::new();
        }

        if reinit {
            for id in old_meta.package_ids() {
                direct.insert(id.clone(), true);
            }
        }
        if any_import_deleted {
            // The deletion may have broken an import cycle.
            for meta in old_meta.packages().filter(|meta| !meta.errors.is_empty()) {
                direct.insert(meta.id.clone(), true);
            }
        }
        if any_file_added {
            for meta in old_meta.packages().filter(|meta| meta.has_missing_import()) {
                direct.insert(meta.id.clone(), true);
            }
        }

        let mut to_invalidate: BTreeMap<PackageId, bool> = BTreeMap::new();
        for (id, invalidate_metadata) in &direct {
            add_rev_deps(&old_meta, &mut to_invalidate, id, *invalidate_metadata);
        }

        for (id, invalidate_metadata) in &to_invalidate {
            // Kept handles are re-keyed on next use, and reuse their result if no input changed.
            if *invalidate_metadata {
                state.package_handles.delete(id);
            } else if let Some(handle) = state.package_handles.get(id).cloned() {
                state.package_handles.set(id.clone(), Arc::new(handle.invalidated()));
            }
            state.active_packages.delete(id);
        }

        let mut updates = BTreeMap::new();
        for (id, _) in to_invalidate.iter().filter(|(_, invalidate)| **invalidate) {
            let Some(meta) = old_meta.metadata(id) else {
                continue;
            };
            if !is_command_line_arguments(id.as_str()) {
                let mut pkg_paths = vec![meta.pkg_path.clone()];
                if let Some(for_test) = meta.for_test.as_ref().filter(|p| **p != meta.pkg_path) {
                    pkg_paths.push(for_test.clone());
                }
                state.should_load.set(
                    id.clone(),
                    PendingLoad {
                        pkg_paths,
                        files: meta.all_files().cloned().collect(),
                    },
                );
            }
            updates.insert(id.clone(), None);
        }

        state.meta = old_meta.update(updates);
        let graph_changed = !Arc::ptr_eq(&state.meta, &old_meta);
        if graph_changed || any_opened_or_closed {
            state.workspace_packages = compute_workspace_packages(&self.core, &state.meta);
            state.active_packages = PersistentMap::new();
        }
        if graph_changed {
            retain_consistent_handles(&mut state);
        }

        state.initialized = state.initialized && !reinit;
        for (uri, upgrades) in &change.module_upgrades {
            state.module_upgrades.insert(uri.clone(), upgrades.clone());
        }
        for (uri, vulns) in &change.vulnerabilities {
            state.vulnerabilities.insert(uri.clone(), vulns.clone());
        }

        tracing::debug!(
            target = "gantry.workspace",
            view = %self.core.id,
            from = self.sequence_id,
            files = change.files.len(),
            reinit,
            invalidated = to_invalidate.len(),
            metadata_invalidated = to_invalidate.values().filter(|v| **v).count(),
            "invalidated snapshot"
        );

        let files = old_files.clone_with(&change.files);
        Snapshot::new(self.core.clone(), self.sequence_id + 1, background, state, files)
    }

    fn is_workspace_sum_file(&self, uri: &FileUri) -> bool {
        let def = &self.core.definition;
        let dir = uri.dir();
        match uri.base_name() {
            "go.sum" => def
                .mod_files
                .iter()
                .chain(&def.mod_file)
                .any(|mod_file| mod_file.dir() == dir),
            "go.work.sum" => def.work_file.as_ref().is_some_and(|work| work.dir() == dir),
            _ => false,
        }
    }

    /// Compares the old and new content of a source file. A file this snapshot never read is
    /// assumed to have changed.
    fn metadata_changes(&self, old: Option<&FileHandle>, new: &FileHandle) -> MetadataChange {
        let Some(old) = old else {
            return MetadataChange {
                invalidate: true,
                package_file_changed: true,
                import_deleted: !new.exists(),
            };
        };
        match (old.exists(), new.exists()) {
            (false, false) => return MetadataChange::NONE,
            (false, true) => {
                return MetadataChange {
                    invalidate: true,
                    package_file_changed: true,
                    import_deleted: false,
                }
            }
            (true, false) => {
                return MetadataChange {
                    invalidate: true,
                    package_file_changed: true,
                    import_deleted: true,
                }
            }
            (true, true) => {}
        }
        if old.identity() == new.identity() {
            return MetadataChange::NONE;
        }

        let cache = &self.core.parse_cache;
        let (old_head, new_head) = match (cache.parse(old, ParseMode::Header), cache.parse(new, ParseMode::Header)) {
            (Ok(old_head), Ok(new_head)) => (old_head, new_head),
            (old_head, new_head) => {
                let err_changed = old_head.is_ok() != new_head.is_ok();
                return MetadataChange {
                    invalidate: err_changed,
                    package_file_changed: err_changed,
                    import_deleted: new_head.is_err(),
                };
            }
        };

        let mut change = MetadataChange::NONE;
        if old_head.parse_error.is_some() && new_head.parse_error.is_none() {
            // The loader may have failed on the old header.
            change.invalidate = true;
            change.package_file_changed = true;
        }
        if old_head.package_name != new_head.package_name {
            return MetadataChange {
                invalidate: true,
                package_file_changed: false,
                import_deleted: true,
            };
        }

        let mut old_imports = valid_imports(&old_head);
        for path in valid_imports(&new_head) {
            if !old_imports.remove(path) {
                change.invalidate = true;
            }
        }
        if !old_imports.is_empty() {
            change.invalidate = true;
            change.import_deleted = true;
        }

        if !change.invalidate {
            match (cache.parse(old, ParseMode::Full), cache.parse(new, ParseMode::Full)) {
                (Ok(old_full), Ok(new_full)) => {
                    change.invalidate = magic_comments_changed(&old_full, &new_full);
                }
                (old_full, new_full) => {
                    tracing::error!(
                        target = "gantry.workspace",
                        uri = %new.uri(),
                        old_ok = old_full.is_ok(),
                        new_ok = new_full.is_ok(),
                        "full parse failed after header parse succeeded"
                    );
                    debug_assert!(false, "full parse failed after header parse succeeded");
                }
            }
        }
        change
    }
}

/// Whether `new` is on-disk content that differs from what `old` showed.
fn changed_on_disk(old: Option<&FileHandle>, new: &FileHandle) -> bool {
    if !new.same_contents_on_disk() {
        return false;
    }
    match old {
        None => true,
        Some(old) => {
            !old.same_contents_on_disk()
                || old.exists() != new.exists()
                || old.identity() != new.identity()
        }
    }
}

/// Whether the change from `old` to `new` includes a save.
fn file_was_saved(old: Option<&FileHandle>, new: &FileHandle) -> bool {
    let Some(current) = new.as_overlay() else {
        return true;
    };
    match old.and_then(FileHandle::as_overlay) {
        None => current.saved(),
        Some(previous) => !previous.saved() && current.saved(),
    }
}

/// Files inside a vendored module, as opposed to files directly in `vendor/`.
fn in_vendor(uri: &FileUri) -> bool {
    uri.as_str()
        .split_once("/vendor/")
        .is_some_and(|(_, rest)| rest.contains('/'))
}

fn is_vendor_manifest(uri: &FileUri) -> bool {
    uri.base_name() == "modules.txt" && uri.dir().is_some_and(|dir| dir.base_name() == "vendor")
}

fn valid_imports(parsed: &ParsedFile) -> BTreeSet<&str> {
    parsed
        .imports
        .iter()
        .map(String::as_str)
        .filter(|path| valid_import_path(path))
        .collect()
}

fn valid_import_path(path: &str) -> bool {
    !path.is_empty()
        && !path.ends_with('/')
        && !path
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '`' || c == '\\')
}

fn magic_comments_changed(old: &ParsedFile, new: &ParsedFile) -> bool {
    !old.magic_comments().eq(new.magic_comments())
}

/// The packages a change to `uri` may affect: those containing it and, if the file is new or
/// may have moved to another package, those with files in the same directory.
fn invalidated_package_ids(
    uri: &FileUri,
    graph: &crate::graph::MetadataGraph,
    package_file_changed: bool,
    stats: &mut StatCache,
) -> BTreeSet<PackageId> {
    let mut ids: BTreeSet<PackageId> = graph.ids_for_file(uri).iter().cloned().collect();
    if !package_file_changed && !ids.is_empty() {
        return ids;
    }
    let Some(dir) = uri.dir() else {
        return ids;
    };
    for known in graph.files() {
        let Some(known_dir) = known.dir() else {
            continue;
        };
        if stats.same_dir(dir.path(), known_dir.path()) {
            ids.extend(graph.ids_for_file(known).iter().cloned());
        }
    }
    ids
}

/// Adds `id` and its transitive importers, propagating the metadata flag.
fn add_rev_deps(
    graph: &crate::graph::MetadataGraph,
    to_invalidate: &mut BTreeMap<PackageId, bool>,
    id: &PackageId,
    invalidate_metadata: bool,
) {
    let mut stack = vec![(id.clone(), invalidate_metadata)];
    while let Some((id, invalidate_metadata)) = stack.pop() {
        let current = to_invalidate.get(&id).copied();
        let next = current.unwrap_or(false) || invalidate_metadata;
        if current == Some(next) {
            continue;
        }
        to_invalidate.insert(id.clone(), next);
        for importer in graph.imported_by(&id) {
            stack.push((importer.clone(), invalidate_metadata));
        }
    }
}

/// Drops the entry of `map` for the module file nearest to `uri`.
fn delete_most_relevant_mod_file<T>(map: &mut PersistentMap<FileUri, Promise<T>>, uri: &FileUri) {
    let most_relevant = map
        .keys()
        .filter(|mod_file| mod_file.dir().is_some_and(|dir| dir.encloses(uri)))
        .max_by_key(|mod_file| mod_file.as_str().len())
        .cloned();
    if let Some(mod_file) = most_relevant {
        map.delete(&mod_file);
    }
}

/// Directory identities, so that directories reached through different spellings (case
/// differences, symlinks) compare equal.
#[derive(Default)]
struct StatCache {
    ids: HashMap<PathBuf, Option<(u64, u64)>>,
}

impl StatCache {
    fn same_dir(&mut self, a: &Path, b: &Path) -> bool {
        if a == b {
            return true;
        }
        match (self.file_id(a), self.file_id(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn file_id(&mut self, path: &Path) -> Option<(u64, u64)> {
        *self
            .ids
            .entry(path.to_path_buf())
            .or_insert_with(|| file_id(path))
    }
}

#[cfg(unix)]
fn file_id(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).ok()?;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_path: &Path) -> Option<(u64, u64)> {
    None
}
