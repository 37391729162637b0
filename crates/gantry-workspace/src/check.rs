use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{ContentHash, FileUri, Range};
use gantry_scheduler::{Cancelled, CancellationToken};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostic;
use crate::metadata::{ImportPath, Metadata, PackagePath};
use crate::parse::ParsedFile;

/// A use of a package-level object, as recorded by the type checker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub uri: FileUri,
    pub range: Range,
    /// Package declaring the referenced object.
    pub package: PackagePath,
    pub name: String,
}

/// The methods of one named type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodSet {
    pub type_name: String,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedPackage {
    pub diagnostics: Vec<Diagnostic>,
    pub references: Vec<Reference>,
    pub method_sets: Vec<MethodSet>,
    /// Exported names, visible to importers.
    pub exports: Vec<String>,
}

/// A type-checked package.
#[derive(Debug)]
pub struct Package {
    pub metadata: Arc<Metadata>,
    /// Fingerprint of the package's inputs (its files, configuration and dependencies).
    pub key: ContentHash,
    pub files: Vec<Arc<ParsedFile>>,
    pub checked: CheckedPackage,
}

/// Resolves an import of the package being checked to its checked dependency.
pub trait ImportResolver {
    fn resolve(&self, path: &ImportPath) -> Option<Arc<Package>>;
}

/// Resolver over the already-checked dependencies of a package.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    deps: BTreeMap<ImportPath, Arc<Package>>,
}

impl DependencyResolver {
    pub fn new(deps: BTreeMap<ImportPath, Arc<Package>>) -> Self {
        Self { deps }
    }
}

impl ImportResolver for DependencyResolver {
    fn resolve(&self, path: &ImportPath) -> Option<Arc<Package>> {
        self.deps.get(path).cloned()
    }
}

/// Type-checks one package given its parsed files and resolved imports.
pub trait TypeChecker: Send + Sync {
    fn check(
        &self,
        metadata: &Metadata,
        files: &[Arc<ParsedFile>],
        resolver: &dyn ImportResolver,
        token: &CancellationToken,
    ) -> Result<CheckedPackage, Cancelled>;
}
