use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gantry_core::{FileUri, Position};
use gantry_scheduler::CancellationToken;
use gantry_vfs::skip_dir;
use gantry_workspace::{
    modfile, LoadError, LoadRequest, LoadedPackage, Metadata, ModuleError, ModuleInfo, PackageError,
    PackageErrorKind, PackageId, PackageLoader, ParseMode, Parser,
};
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::parser::FakeParser;

/// The path and file of the synthetic `builtin` package.
pub const BUILTIN_FILE: &str = "file:///builtin/builtin.go";

/// A package loader that derives packages from the directory layout under the request
/// directory, the way `go list` would for a tree without build tags or test files.
///
/// Every directory holding non-test `.go` files (on disk or in an overlay) is one package; its
/// path is the enclosing module's path joined with the directory's path relative to the
/// module. Imports of module packages are resolved, imports that look like standard library
/// packages are ignored, and anything else is reported as unresolved.
#[derive(Debug, Default)]
pub struct FakeLoader {
    requests: AtomicUsize,
    queries: Mutex<Vec<Vec<String>>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of load requests served so far (including failed ones).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// The queries of every request, in order.
    pub fn queries(&self) -> Vec<Vec<String>> {
        self.queries.lock().clone()
    }

    /// Makes every subsequent load fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// Makes every subsequent load take at least `delay`, unless cancelled first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    fn wait(&self, token: &CancellationToken) -> Result<(), LoadError> {
        let Some(delay) = *self.delay.lock() else {
            return Ok(());
        };
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl PackageLoader for FakeLoader {
    fn load(&self, request: &LoadRequest, token: &CancellationToken) -> Result<Vec<LoadedPackage>, LoadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(request.queries.clone());
        self.wait(token)?;
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if let Some(message) = self.failure.lock().clone() {
            return Err(LoadError::Failed(anyhow::anyhow!(message)));
        }

        let universe = Universe::scan(request)?;
        let mut selected = BTreeSet::new();
        let mut builtin = false;
        for query in &request.queries {
            if query == "builtin" {
                builtin = true;
                continue;
            }
            selected.extend(universe.matching(query, &request.dir));
        }

        let mut result = BTreeMap::new();
        let mut stack: Vec<PackageId> = selected.into_iter().collect();
        while let Some(id) = stack.pop() {
            if result.contains_key(&id) {
                continue;
            }
            let Some(meta) = universe.packages.get(&id) else {
                continue;
            };
            stack.extend(meta.dependencies().cloned());
            result.insert(id, meta.clone());
        }

        let mut packages: Vec<LoadedPackage> = result.into_values().collect();
        if builtin {
            packages.push(builtin_package());
        }
        tracing::debug!(
            target = "gantry.test",
            queries = ?request.queries,
            packages = packages.len(),
            "fake load"
        );
        Ok(packages)
    }
}

fn builtin_package() -> Metadata {
    let mut meta = Metadata::new("builtin", "builtin", "builtin");
    if let Ok(file) = FileUri::parse(BUILTIN_FILE) {
        meta.compiled_files.push(file.clone());
        meta.files.push(file);
    }
    meta
}

struct Module {
    dir: PathBuf,
    path: String,
    mod_file: FileUri,
}

struct Universe {
    /// Package directory for each package.
    dirs: BTreeMap<PackageId, PathBuf>,
    packages: BTreeMap<PackageId, Metadata>,
}

impl Universe {
    fn scan(request: &LoadRequest) -> Result<Self, LoadError> {
        let (modules, sources) = walk(request);

        let mut module_errors = Vec::new();
        let mut parsed_modules = Vec::new();
        for mod_file in modules {
            let Some(dir) = mod_file.path().parent().map(Path::to_path_buf) else {
                continue;
            };
            let text = read(request, &mod_file).unwrap_or_default();
            match modfile::parse_mod(&text) {
                Ok(parsed) => match parsed.module {
                    Some(path) => parsed_modules.push(Module { dir, path, mod_file }),
                    None => module_errors.push(ModuleError {
                        mod_file,
                        message: "no module declaration in go.mod".to_owned(),
                    }),
                },
                Err(err) => module_errors.push(ModuleError {
                    mod_file,
                    message: err.to_string(),
                }),
            }
        }
        if !module_errors.is_empty() {
            return Err(LoadError::Modules(module_errors));
        }
        // Innermost module first.
        parsed_modules.sort_by_key(|module| std::cmp::Reverse(module.dir.components().count()));

        let mut by_dir: BTreeMap<PathBuf, Vec<FileUri>> = BTreeMap::new();
        for file in sources {
            if let Some(dir) = file.path().parent() {
                by_dir.entry(dir.to_path_buf()).or_default().push(file);
            }
        }

        let mut dirs = BTreeMap::new();
        let mut packages = BTreeMap::new();
        let mut import_lists = BTreeMap::new();
        for (dir, files) in by_dir {
            let module = parsed_modules.iter().find(|module| dir.starts_with(&module.dir));
            let pkg_path = package_path(module, &dir);
            let id = PackageId::new(&pkg_path);

            let mut meta = Metadata::new(id.clone(), pkg_path.as_str(), "");
            meta.module = module.map(|module| ModuleInfo {
                path: module.path.clone(),
                version: None,
                mod_file: Some(module.mod_file.clone()),
            });

            let mut names: Vec<(String, FileUri)> = Vec::new();
            let mut imports = BTreeSet::new();
            for file in &files {
                let Some(text) = read(request, file) else {
                    continue;
                };
                let parsed = match FakeParser.parse(file, text.as_bytes(), ParseMode::Header) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        meta.errors.push(PackageError {
                            kind: PackageErrorKind::Parse,
                            message: err.to_string(),
                            position: Some((file.clone(), Position::default())),
                        });
                        continue;
                    }
                };
                if let Some(message) = parsed.parse_error {
                    meta.errors.push(PackageError {
                        kind: PackageErrorKind::Parse,
                        message,
                        position: Some((file.clone(), Position::default())),
                    });
                }
                if let Some(name) = parsed.package_name {
                    names.push((name, file.clone()));
                }
                imports.extend(parsed.imports);
            }

            if let Some((first, first_file)) = names.first() {
                meta.name = first.as_str().into();
                if let Some((other, other_file)) = names.iter().find(|(name, _)| name != first) {
                    meta.errors.push(PackageError::list(format!(
                        "found packages {first} ({}) and {other} ({}) in {}",
                        first_file.base_name(),
                        other_file.base_name(),
                        dir.display()
                    )));
                }
            }
            meta.compiled_files = files.clone();
            meta.files = files;

            import_lists.insert(id.clone(), imports);
            dirs.insert(id.clone(), dir);
            packages.insert(id, meta);
        }

        let known: BTreeSet<PackageId> = packages.keys().cloned().collect();
        for (id, imports) in import_lists {
            let Some(meta) = packages.get_mut(&id) else {
                continue;
            };
            for import in imports {
                if is_standard_library(&import) {
                    continue;
                }
                let dep = PackageId::new(&import);
                if known.contains(&dep) {
                    meta.imports.insert(import.as_str().into(), dep);
                } else {
                    meta.errors.push(PackageError::list(format!(
                        "could not import {import} (no required module provides package)"
                    )));
                    meta.imports.insert(import.as_str().into(), PackageId::new(""));
                }
            }
        }

        Ok(Self { dirs, packages })
    }

    fn matching<'a>(&'a self, query: &'a str, root: &'a Path) -> Box<dyn Iterator<Item = PackageId> + 'a> {
        if let Some(file) = query.strip_prefix("file=") {
            let dir = Path::new(file).parent().map(Path::to_path_buf);
            return Box::new(
                self.dirs
                    .iter()
                    .filter(move |(_, pkg_dir)| Some(*pkg_dir) == dir.as_ref())
                    .map(|(id, _)| id.clone()),
            );
        }
        if query == "./..." {
            return Box::new(self.under(root.to_path_buf()));
        }
        if query == "./" {
            return Box::new(
                self.dirs
                    .iter()
                    .filter(move |(_, dir)| dir.as_path() == root)
                    .map(|(id, _)| id.clone()),
            );
        }
        if let Some(dir) = query.strip_suffix("/...") {
            return Box::new(self.under(PathBuf::from(dir)));
        }
        let id = PackageId::new(query);
        Box::new(self.packages.contains_key(&id).then_some(id).into_iter())
    }

    fn under(&self, root: PathBuf) -> impl Iterator<Item = PackageId> + '_ {
        self.dirs
            .iter()
            .filter(move |(_, dir)| dir.starts_with(&root))
            .map(|(id, _)| id.clone())
    }
}

/// The `go.mod` files and non-test Go sources under the request directory, including files
/// that exist only as overlays.
fn walk(request: &LoadRequest) -> (Vec<FileUri>, BTreeSet<FileUri>) {
    let mut modules = Vec::new();
    let mut sources = BTreeSet::new();
    let walker = WalkDir::new(&request.dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !skip_dir(&entry.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(target = "gantry.test", error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(uri) = FileUri::from_path(entry.path()) else {
            continue;
        };
        classify(uri, &mut modules, &mut sources);
    }

    for overlay in &request.overlays {
        let uri = overlay.uri();
        if uri.path().starts_with(&request.dir) && !modules.contains(uri) && !sources.contains(uri) {
            classify(uri.clone(), &mut modules, &mut sources);
        }
    }
    (modules, sources)
}

fn classify(uri: FileUri, modules: &mut Vec<FileUri>, sources: &mut BTreeSet<FileUri>) {
    let name = uri.base_name();
    if name == "go.mod" {
        modules.push(uri);
    } else if name.ends_with(".go") && !name.ends_with("_test.go") {
        sources.insert(uri);
    }
}

/// Overlay content if present, else disk content.
fn read(request: &LoadRequest, uri: &FileUri) -> Option<String> {
    match request.overlay(uri) {
        Some(overlay) => Some(String::from_utf8_lossy(overlay.content()).into_owned()),
        None => std::fs::read_to_string(uri.path()).ok(),
    }
}

fn package_path(module: Option<&Module>, dir: &Path) -> String {
    match module {
        Some(module) => {
            let rel = dir.strip_prefix(&module.dir).unwrap_or(Path::new(""));
            let rel = rel
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if rel.is_empty() {
                module.path.clone()
            } else {
                format!("{}/{rel}", module.path)
            }
        }
        None => format!("_{}", dir.display()),
    }
}

/// Paths whose first element has no dot, such as `fmt` or `net/http`.
fn is_standard_library(import: &str) -> bool {
    import
        .split('/')
        .next()
        .is_some_and(|first| !first.contains('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use gantry_core::FileKind;
    use gantry_vfs::Overlay;
    use pretty_assertions::assert_eq;

    use crate::fixture::{uri, write_fixture};

    fn ids(packages: &[LoadedPackage]) -> Vec<&str> {
        packages.iter().map(|meta| meta.id.as_str()).collect()
    }

    #[test]
    fn module_queries_include_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(
            dir.path(),
            &[
                ("go.mod", "module example.com/m\n\ngo 1.21\n"),
                ("a/a.go", "package a\n\nimport \"example.com/m/b\"\n"),
                ("a/a_test.go", "package a\n"),
                ("b/b.go", "package b\n\nimport \"fmt\"\n"),
                ("c/c.go", "package c\n"),
                (".hidden/h.go", "package h\n"),
            ],
        )
        .unwrap();
        let loader = FakeLoader::new();
        let token = CancellationToken::new();

        let all = loader
            .load(&LoadRequest::new(dir.path(), vec!["./...".into()]), &token)
            .unwrap();
        assert_eq!(ids(&all), vec!["example.com/m/a", "example.com/m/b", "example.com/m/c"]);
        assert_eq!(all[0].compiled_files, vec![uri(dir.path(), "a/a.go")]);
        assert_eq!(
            all[0].module.as_ref().map(|module| module.path.as_str()),
            Some("example.com/m")
        );

        let a = loader
            .load(&LoadRequest::new(dir.path(), vec!["example.com/m/a".into()]), &token)
            .unwrap();
        assert_eq!(ids(&a), vec!["example.com/m/a", "example.com/m/b"]);
        assert_eq!(loader.requests(), 2);
    }

    #[test]
    fn overlays_and_unresolved_imports() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), &[("go.mod", "module example.com/m\n"), ("a/a.go", "package a\n")]).unwrap();
        let mut request = LoadRequest::new(
            dir.path(),
            vec![format!("file={}", dir.path().join("a/a.go").display()), "builtin".into()],
        );
        request.overlays.push(Arc::new(Overlay::new(
            uri(dir.path(), "a/a.go"),
            b"package a\n\nimport \"example.com/m/missing\"\n".to_vec(),
            1,
            FileKind::Go,
            false,
        )));

        let loaded = FakeLoader::new().load(&request, &CancellationToken::new()).unwrap();
        assert_eq!(ids(&loaded), vec!["example.com/m/a", "builtin"]);
        assert!(loaded[0].has_missing_import());
        assert_eq!(loaded[0].errors.len(), 1);
    }

    #[test]
    fn broken_modules_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), &[("go.mod", "go 1.21\n"), ("a.go", "package a\n")]).unwrap();
        let loader = FakeLoader::new();
        let token = CancellationToken::new();
        let request = LoadRequest::new(dir.path(), vec!["./...".into()]);
        assert!(matches!(loader.load(&request, &token), Err(LoadError::Modules(errors)) if errors.len() == 1));

        loader.fail_with("go: command not found");
        assert!(matches!(loader.load(&request, &token), Err(LoadError::Failed(_))));

        loader.succeed();
        token.cancel();
        assert!(matches!(loader.load(&request, &token), Err(LoadError::Cancelled)));
    }
}
