use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_core::FileUri;
use gantry_scheduler::CancellationToken;
use gantry_vfs::Overlay;

use crate::metadata::{Metadata, PackagePath};

/// A package as reported by the loader.
pub type LoadedPackage = Metadata;

/// One unit of loading.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadScope {
    /// The package(s) containing a file.
    File(FileUri),
    /// A package by import path.
    Package(PackagePath),
    /// Every package under a module root directory.
    Module(FileUri),
    /// Every package under the view root.
    View,
    /// The packages in the view root directory alone (views outside any module).
    AdHoc,
}

impl LoadScope {
    pub fn query(&self) -> String {
        match self {
            LoadScope::File(uri) => format!("file={}", uri.path().display()),
            LoadScope::Package(path) => path.to_string(),
            LoadScope::Module(dir) => format!("{}/...", dir.path().display()),
            LoadScope::View => "./...".to_owned(),
            LoadScope::AdHoc => "./".to_owned(),
        }
    }
}

impl fmt::Display for LoadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query())
    }
}

/// Everything a loader needs to answer a set of queries.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Working directory; relative queries are resolved against it.
    pub dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub build_flags: Vec<String>,
    pub queries: Vec<String>,
    /// Unsaved editor content that should be loaded in place of the disk content.
    pub overlays: Vec<Arc<Overlay>>,
}

impl LoadRequest {
    pub fn new(dir: impl AsRef<Path>, queries: Vec<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            env: BTreeMap::new(),
            build_flags: Vec::new(),
            queries,
            overlays: Vec::new(),
        }
    }

    pub fn overlay(&self, uri: &FileUri) -> Option<&Arc<Overlay>> {
        self.overlays.iter().find(|overlay| overlay.uri() == uri)
    }
}

/// A loader failure attributed to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub mod_file: FileUri,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("load cancelled")]
    Cancelled,
    #[error("no packages returned for {}", queries.join(" "))]
    NoPackages { queries: Vec<String> },
    #[error("module errors: {}", display_module_errors(.0))]
    Modules(Vec<ModuleError>),
    #[error("load exceeded its deadline of {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

fn display_module_errors(errors: &[ModuleError]) -> String {
    errors
        .iter()
        .map(|err| format!("{}: {}", err.mod_file, err.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<gantry_scheduler::Cancelled> for LoadError {
    fn from(_: gantry_scheduler::Cancelled) -> Self {
        LoadError::Cancelled
    }
}

/// Resolves package queries to metadata (for example by running the build tool).
pub trait PackageLoader: Send + Sync {
    fn load(
        &self,
        request: &LoadRequest,
        token: &CancellationToken,
    ) -> Result<Vec<LoadedPackage>, LoadError>;
}

/// Whether `id` names a synthesized test-main package, which is never part of the graph.
pub(crate) fn is_test_main(id: &str) -> bool {
    id.ends_with(".test")
}

/// Whether `id` is a package synthesized from a file query outside any package. Such packages
/// cannot be reloaded by path.
pub(crate) fn is_command_line_arguments(id: &str) -> bool {
    id.contains("command-line-arguments")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_render_loader_queries() {
        let file = FileUri::parse("file:///w/a/a.go").unwrap();
        let dir = FileUri::parse("file:///w/mod").unwrap();
        assert_eq!(LoadScope::File(file).query(), "file=/w/a/a.go");
        assert_eq!(LoadScope::Package("example.com/a".into()).query(), "example.com/a");
        assert_eq!(LoadScope::Module(dir).query(), "/w/mod/...");
        assert_eq!(LoadScope::View.query(), "./...");
        assert_eq!(LoadScope::AdHoc.to_string(), "./");
    }

    #[test]
    fn module_errors_are_listed() {
        let err = LoadError::Modules(vec![ModuleError {
            mod_file: FileUri::parse("file:///w/go.mod").unwrap(),
            message: "unknown directive".into(),
        }]);
        assert_eq!(err.to_string(), "module errors: file:///w/go.mod: unknown directive");
        assert!(is_test_main("example.com/a.test"));
        assert!(!is_test_main("example.com/a [example.com/a.test]"));
    }
}
