use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_cache::{decode, encode};
use gantry_core::{ContentHash, Hasher, Range};
use gantry_scheduler::{CancellationToken, Promise};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{memoize, Snapshot, SnapshotError, CACHE_KIND_DIAGNOSTICS, CACHE_KIND_METHOD_SETS, CACHE_KIND_XREFS};
use crate::check::{DependencyResolver, MethodSet, Package, Reference};
use crate::diagnostics::{package_error_diagnostics, Diagnostic, DiagnosticSource};
use crate::metadata::{Metadata, PackageId};
use crate::parse::ParseMode;

/// The recipe for type-checking one package: its metadata, a key summarizing every input, and
/// the promise of the result.
#[derive(Debug)]
pub(crate) struct PackageHandle {
    pub(crate) metadata: Arc<Metadata>,
    pub(crate) key: ContentHash,
    pub(crate) promise: Promise<Result<Arc<Package>, SnapshotError>>,
    /// Cleared when an input may have changed; the key must then be recomputed before the
    /// promise can be trusted.
    pub(crate) valid: bool,
}

impl PackageHandle {
    pub(crate) fn invalidated(&self) -> PackageHandle {
        PackageHandle {
            metadata: self.metadata.clone(),
            key: self.key,
            promise: self.promise.clone(),
            valid: false,
        }
    }
}

impl Snapshot {
    /// The handle for `id`, computing it (and its dependencies' handles) if it is missing or no
    /// longer valid.
    pub(crate) fn package_handle(
        &self,
        id: &PackageId,
        token: &CancellationToken,
    ) -> Result<Arc<PackageHandle>, SnapshotError> {
        self.check(token)?;
        let (meta, previous) = {
            let state = self.state.lock();
            let meta = state
                .meta
                .metadata(id)
                .cloned()
                .ok_or_else(|| SnapshotError::NoMetadata(id.clone()))?;
            let previous = state.package_handles.get(id).cloned();
            if let Some(handle) = &previous {
                if handle.valid && Arc::ptr_eq(&handle.metadata, &meta) {
                    return Ok(handle.clone());
                }
            }
            (meta, previous)
        };

        let mut deps = BTreeMap::new();
        for dep in meta.dependencies() {
            if self.state.lock().meta.contains(dep) {
                deps.insert(dep.clone(), self.package_handle(dep, token)?.key);
            }
        }
        let key = self.package_key(&meta, &deps, token)?;

        let promise = match &previous {
            Some(previous) if previous.key == key && Arc::ptr_eq(&previous.metadata, &meta) => {
                previous.promise.clone()
            }
            _ => Promise::new(format!("check {id}")),
        };
        let handle = Arc::new(PackageHandle {
            metadata: meta.clone(),
            key,
            promise,
            valid: true,
        });

        let mut state = self.state.lock();
        if let Some(current) = state.package_handles.get(id) {
            if current.valid && current.key == key && Arc::ptr_eq(&current.metadata, &meta) {
                return Ok(current.clone());
            }
        }
        // The graph may have been reloaded meanwhile; only record handles for current metadata.
        if state
            .meta
            .metadata(id)
            .is_some_and(|current| Arc::ptr_eq(current, &meta))
        {
            state.package_handles.set(id.clone(), handle.clone());
        }
        Ok(handle)
    }

    fn package_key(
        &self,
        meta: &Metadata,
        dep_keys: &BTreeMap<PackageId, ContentHash>,
        token: &CancellationToken,
    ) -> Result<ContentHash, SnapshotError> {
        let mut hasher = Hasher::new();
        hasher
            .str(meta.id.as_str())
            .str(meta.pkg_path.as_str())
            .str(meta.name.as_str());

        hasher.u64(meta.compiled_files.len() as u64);
        for uri in &meta.compiled_files {
            let identity = self.read_file(uri, token)?.identity();
            hasher.str(identity.uri.as_str()).hash(&identity.hash);
        }

        hasher.u64(meta.imports.len() as u64);
        for (path, dep) in &meta.imports {
            hasher.str(path.as_str());
            match dep_keys.get(dep) {
                Some(key) => hasher.bool(true).hash(key),
                None => hasher.bool(false),
            };
        }

        hasher.u64(meta.errors.len() as u64);
        for err in &meta.errors {
            hasher.str(&err.message);
        }

        let def = self.definition();
        hasher.u64(def.build_flags.len() as u64);
        for flag in &def.build_flags {
            hasher.str(flag);
        }
        hasher.u64(def.env.len() as u64);
        for (key, value) in &def.env {
            hasher.str(key).str(value);
        }
        hasher
            .str(meta.for_test.as_ref().map_or("", |path| path.as_str()))
            .bool(meta.standalone);
        Ok(hasher.finish())
    }

    /// Type-checks the package behind `handle`, after its dependencies.
    fn check_package(
        &self,
        handle: &PackageHandle,
        token: &CancellationToken,
    ) -> Result<Arc<Package>, SnapshotError> {
        memoize(&handle.promise, token, |token| {
            let meta = &handle.metadata;
            let mut deps = BTreeMap::new();
            for (path, dep) in &meta.imports {
                if dep.is_empty() || !self.state.lock().meta.contains(dep) {
                    continue;
                }
                let dep_handle = self.package_handle(dep, token)?;
                deps.insert(path.clone(), self.check_package(&dep_handle, token)?);
            }

            let mut files = Vec::with_capacity(meta.compiled_files.len());
            let mut parse_diagnostics = Vec::new();
            for uri in &meta.compiled_files {
                self.check(token)?;
                let fh = self.read_file(uri, token)?;
                match self.core.parse_cache.parse(&fh, ParseMode::Full) {
                    Ok(parsed) => files.push(parsed),
                    Err(err) => parse_diagnostics.push(Diagnostic::error(
                        uri.clone(),
                        Range::default(),
                        DiagnosticSource::Parse,
                        err.to_string(),
                    )),
                }
            }

            let resolver = DependencyResolver::new(deps);
            let mut checked = self
                .core
                .collaborators
                .checker
                .check(meta, &files, &resolver, token)?;
            checked.diagnostics.extend(parse_diagnostics);
            tracing::debug!(
                target = "gantry.workspace",
                package = %meta.id,
                files = files.len(),
                diagnostics = checked.diagnostics.len(),
                "type-checked package"
            );
            Ok(Arc::new(Package {
                metadata: meta.clone(),
                key: handle.key,
                files,
                checked,
            }))
        })
    }

    /// Type-checks `ids` in parallel.
    pub fn type_check(
        &self,
        ids: &[PackageId],
        token: &CancellationToken,
    ) -> Result<Vec<Arc<Package>>, SnapshotError> {
        self.await_initialized(token)?;
        ids.par_iter()
            .map(|id| self.type_check_one(id, token))
            .collect()
    }

    fn type_check_one(&self, id: &PackageId, token: &CancellationToken) -> Result<Arc<Package>, SnapshotError> {
        if let Some(active) = self.state.lock().active_packages.get(id) {
            return Ok(active.clone());
        }
        let handle = self.package_handle(id, token)?;
        let package = self.check_package(&handle, token)?;

        // Packages being edited are asked for repeatedly; keep them on hand.
        let open = package
            .metadata
            .compiled_files
            .iter()
            .any(|uri| self.find_file(uri).is_some_and(|fh| fh.is_overlay()));
        if open {
            let mut state = self.state.lock();
            if state
                .meta
                .metadata(id)
                .is_some_and(|meta| Arc::ptr_eq(meta, &package.metadata))
            {
                state.active_packages.set(id.clone(), package.clone());
            }
        }
        Ok(package)
    }

    /// Per-package results of kind `kind`, served from the file cache when the package key is
    /// already known to it. Misses are type-checked in parallel and written back.
    fn cached_results<T, F>(
        &self,
        kind: &str,
        ids: &[PackageId],
        token: &CancellationToken,
        project: F,
    ) -> Result<BTreeMap<PackageId, Vec<T>>, SnapshotError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Package) -> Vec<T>,
    {
        self.await_initialized(token)?;
        let cache = &self.core.collaborators.cache;
        let cache_key = |key: &ContentHash| Hasher::new().str(kind).hash(key).finish();

        let mut results = BTreeMap::new();
        let mut misses = Vec::new();
        for id in ids {
            let handle = self.package_handle(id, token)?;
            let hit = cache
                .get(kind, &cache_key(&handle.key))
                .and_then(|bytes| decode::<Vec<T>>(&bytes));
            match hit {
                Ok(values) => {
                    results.insert(id.clone(), values);
                }
                Err(err) => {
                    if !err.is_not_found() {
                        tracing::debug!(
                            target = "gantry.workspace",
                            kind,
                            package = %id,
                            error = %err,
                            "discarding unreadable cache entry"
                        );
                    }
                    misses.push(id.clone());
                }
            }
        }

        for package in self.type_check(&misses, token)? {
            let values = project(&package);
            let written = encode(&values).and_then(|bytes| cache.set(kind, &cache_key(&package.key), &bytes));
            if let Err(err) = written {
                tracing::debug!(
                    target = "gantry.workspace",
                    kind,
                    package = %package.metadata.id,
                    error = %err,
                    "failed to write cache entry"
                );
            }
            results.insert(package.metadata.id.clone(), values);
        }
        Ok(results)
    }

    /// Loader errors and type-checker diagnostics of each package.
    pub fn package_diagnostics(
        &self,
        ids: &[PackageId],
        token: &CancellationToken,
    ) -> Result<BTreeMap<PackageId, Vec<Diagnostic>>, SnapshotError> {
        self.cached_results(CACHE_KIND_DIAGNOSTICS, ids, token, |package| {
            let mut diagnostics = package_error_diagnostics(&package.metadata);
            diagnostics.extend(package.checked.diagnostics.iter().cloned());
            diagnostics
        })
    }

    pub fn references(
        &self,
        ids: &[PackageId],
        token: &CancellationToken,
    ) -> Result<BTreeMap<PackageId, Vec<Reference>>, SnapshotError> {
        self.cached_results(CACHE_KIND_XREFS, ids, token, |package| {
            package.checked.references.clone()
        })
    }

    pub fn method_sets(
        &self,
        ids: &[PackageId],
        token: &CancellationToken,
    ) -> Result<BTreeMap<PackageId, Vec<MethodSet>>, SnapshotError> {
        self.cached_results(CACHE_KIND_METHOD_SETS, ids, token, |package| {
            package.checked.method_sets.clone()
        })
    }

    /// Whether a handle for `id` is recorded and valid.
    pub fn has_valid_package_handle(&self, id: &PackageId) -> bool {
        self.state
            .lock()
            .package_handles
            .get(id)
            .is_some_and(|handle| handle.valid)
    }
}

