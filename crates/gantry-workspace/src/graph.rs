use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use gantry_core::{FileUri, PersistentMap};

use crate::metadata::{ImportPath, Metadata, PackageError, PackageId};

/// The import graph of every loaded package.
///
/// Graphs are immutable; [`MetadataGraph::update`] derives a new graph that shares every
/// unchanged [`Metadata`] pointer, and the unchanged parts of its indexes, with its predecessor.
/// Import cycles are broken when packages are added, so walks over `imported_by` always
/// terminate.
#[derive(Debug, Default)]
pub struct MetadataGraph {
    packages: PersistentMap<PackageId, Arc<Metadata>>,
    ids: PersistentMap<FileUri, Vec<PackageId>>,
    imported_by: PersistentMap<PackageId, Vec<PackageId>>,
}

impl MetadataGraph {
    pub fn new(packages: impl IntoIterator<Item = Arc<Metadata>>) -> Self {
        let mut graph = Self::default();
        let mut added = Vec::new();
        for meta in packages {
            added.push(meta.id.clone());
            graph.packages.set(meta.id.clone(), meta);
        }
        graph.add(&added);
        graph
    }

    /// Breaks cycles through the packages `added`, which are already in `packages`, and indexes
    /// them.
    fn add(&mut self, added: &[PackageId]) {
        for (id, previous) in break_cycles(&mut self.packages, added) {
            if !added.contains(&id) {
                self.unindex(&previous);
                self.index_package(&id);
            }
        }
        for id in added {
            self.index_package(id);
        }
    }

    fn index_package(&mut self, id: &PackageId) {
        let Some(meta) = self.packages.get(id).cloned() else {
            return;
        };
        for uri in meta.all_files() {
            let mut owners = self.ids.get(uri).cloned().unwrap_or_default();
            if let Err(at) = owners.binary_search(id) {
                owners.insert(at, id.clone());
            }
            self.ids.set(uri.clone(), owners);
        }
        for dep in meta.dependencies() {
            let mut importers = self.imported_by.get(dep).cloned().unwrap_or_default();
            if let Err(at) = importers.binary_search(id) {
                importers.insert(at, id.clone());
            }
            self.imported_by.set(dep.clone(), importers);
        }
    }

    fn unindex(&mut self, meta: &Metadata) {
        let id = &meta.id;
        for uri in meta.all_files() {
            remove_from(&mut self.ids, uri, id);
        }
        for dep in meta.dependencies() {
            remove_from(&mut self.imported_by, dep, id);
        }
    }

    /// Applies `updates`: `Some` inserts or replaces a package, `None` deletes it together with
    /// every package that transitively imports it.
    ///
    /// Returns `self` unchanged when there is nothing to do.
    pub fn update(
        self: &Arc<Self>,
        updates: BTreeMap<PackageId, Option<Arc<Metadata>>>,
    ) -> Arc<Self> {
        if updates.is_empty() {
            return Arc::clone(self);
        }

        let mut graph = Self {
            packages: self.packages.clone(),
            ids: self.ids.clone(),
            imported_by: self.imported_by.clone(),
        };
        let deleted: Vec<PackageId> = updates
            .iter()
            .filter(|(_, meta)| meta.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        let replaced = updates.iter().filter(|(_, meta)| meta.is_some()).map(|(id, _)| id.clone());
        for id in self.reverse_transitive_ids(&deleted, true).into_iter().chain(replaced) {
            if let Some(old) = self.packages.get(&id) {
                graph.unindex(old);
                graph.packages.delete(&id);
            }
        }

        let mut added = Vec::new();
        for (id, meta) in updates {
            if let Some(meta) = meta {
                graph.packages.set(id.clone(), meta);
                added.push(id);
            }
        }
        graph.add(&added);
        Arc::new(graph)
    }

    pub fn metadata(&self, id: &PackageId) -> Option<&Arc<Metadata>> {
        self.packages.get(id)
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.packages.contains_key(id)
    }

    /// Packages in ID order.
    pub fn packages(&self) -> impl Iterator<Item = &Arc<Metadata>> + '_ {
        self.packages.iter().map(|(_, meta)| meta)
    }

    pub fn package_ids(&self) -> impl Iterator<Item = &PackageId> + '_ {
        self.packages.keys()
    }

    /// IDs of the packages that contain `uri`, in ID order.
    pub fn ids_for_file(&self, uri: &FileUri) -> &[PackageId] {
        self.ids.get(uri).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every file known to the graph, sorted.
    pub fn files(&self) -> impl Iterator<Item = &FileUri> + '_ {
        self.ids.keys()
    }

    /// Direct importers of `id`, in ID order.
    pub fn imported_by(&self, id: &PackageId) -> &[PackageId] {
        self.imported_by
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// IDs reachable from `roots` through reverse import edges. The roots are included when
    /// `reflexive` is set. IDs need not be present in the graph to be walked through.
    pub fn reverse_transitive_ids(&self, roots: &[PackageId], reflexive: bool) -> BTreeSet<PackageId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<PackageId> = roots.iter().cloned().collect();
        if reflexive {
            seen.extend(roots.iter().cloned());
        }
        while let Some(id) = queue.pop_front() {
            for importer in self.imported_by(&id) {
                if seen.insert(importer.clone()) {
                    queue.push_back(importer.clone());
                }
            }
        }
        seen
    }

    /// `ids` and everything that transitively imports them, restricted to packages in the graph.
    pub fn reverse_reflexive_transitive_closure(
        &self,
        ids: &[PackageId],
    ) -> BTreeMap<PackageId, Arc<Metadata>> {
        self.reverse_transitive_ids(ids, true)
            .into_iter()
            .filter_map(|id| {
                let meta = self.packages.get(&id)?.clone();
                Some((id, meta))
            })
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Removes `id` from the entry for `key`, dropping the entry once it is empty.
fn remove_from<K: Ord + Clone>(index: &mut PersistentMap<K, Vec<PackageId>>, key: &K, id: &PackageId) {
    let Some(mut ids) = index.get(key).cloned() else {
        return;
    };
    ids.retain(|other| other != id);
    if ids.is_empty() {
        index.delete(key);
    } else {
        index.set(key.clone(), ids);
    }
}

/// Drops every import edge reachable from `roots` that closes a cycle, replacing it with a
/// missing import and a list error on the importing package. Returns the previous metadata of
/// every package it changed; packages without such edges keep their pointer.
fn break_cycles(
    packages: &mut PersistentMap<PackageId, Arc<Metadata>>,
    roots: &[PackageId],
) -> Vec<(PackageId, Arc<Metadata>)> {
    fn edges(
        packages: &PersistentMap<PackageId, Arc<Metadata>>,
        id: &PackageId,
    ) -> Vec<(ImportPath, PackageId)> {
        let Some(meta) = packages.get(id) else {
            return Vec::new();
        };
        // Reversed so that popping visits imports in path order.
        meta.imports
            .iter()
            .rev()
            .filter(|(_, dep)| !dep.is_empty())
            .map(|(path, dep)| (path.clone(), dep.clone()))
            .collect()
    }

    let mut marks: HashMap<PackageId, Mark> = HashMap::new();
    let mut back_edges: Vec<(PackageId, ImportPath, PackageId)> = Vec::new();
    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root.clone(), Mark::Visiting);
        let mut stack = vec![(root.clone(), edges(packages, root))];
        loop {
            let Some((from, pending)) = stack.last_mut() else {
                break;
            };
            match pending.pop() {
                Some((path, dep)) => match marks.get(&dep) {
                    Some(Mark::Visiting) => back_edges.push((from.clone(), path, dep)),
                    Some(Mark::Done) => {}
                    None if packages.contains_key(&dep) => {
                        marks.insert(dep.clone(), Mark::Visiting);
                        let next = edges(packages, &dep);
                        stack.push((dep, next));
                    }
                    None => {}
                },
                None => {
                    if let Some((done, _)) = stack.pop() {
                        marks.insert(done, Mark::Done);
                    }
                }
            }
        }
    }

    let mut changed: Vec<(PackageId, Arc<Metadata>)> = Vec::new();
    for (from, path, dep) in back_edges {
        tracing::debug!(
            target = "gantry.workspace",
            package = %from,
            import = %path,
            "breaking import cycle"
        );
        let Some(previous) = packages.get(&from).cloned() else {
            continue;
        };
        let mut meta = Metadata::clone(&previous);
        meta.imports.insert(path, PackageId::new(""));
        meta.errors.push(PackageError::list(format!(
            "import cycle not allowed: {from} imports {dep}"
        )));
        packages.set(from.clone(), Arc::new(meta));
        if !changed.iter().any(|(id, _)| *id == from) {
            changed.push((from, previous));
        }
    }
    changed
}
