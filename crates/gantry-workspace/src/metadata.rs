use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gantry_core::{FileUri, Position};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(Arc::from(value.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&*self.0, f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Load identity of a package. Test variants share a path but not an ID.
    PackageId
);
string_id!(PackagePath);
string_id!(PackageName);
string_id!(
    /// An import path as written in source.
    ImportPath
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub path: String,
    pub version: Option<String>,
    pub mod_file: Option<FileUri>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageErrorKind {
    /// Reported by the loader (bad imports, conflicting package names, ...).
    List,
    Parse,
    Type,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageError {
    pub kind: PackageErrorKind,
    pub message: String,
    pub position: Option<(FileUri, Position)>,
}

impl PackageError {
    pub fn list(message: impl Into<String>) -> Self {
        Self {
            kind: PackageErrorKind::List,
            message: message.into(),
            position: None,
        }
    }
}

/// Immutable description of one loaded package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: PackageId,
    pub pkg_path: PackagePath,
    pub name: PackageName,
    pub compiled_files: Vec<FileUri>,
    pub files: Vec<FileUri>,
    pub ignored_files: Vec<FileUri>,
    /// Resolved imports. An empty [`PackageId`] marks an import the loader could not resolve.
    pub imports: BTreeMap<ImportPath, PackageId>,
    pub for_test: Option<PackagePath>,
    pub module: Option<ModuleInfo>,
    pub errors: Vec<PackageError>,
    pub standalone: bool,
}

impl Metadata {
    /// A package with no files, imports or errors. Mostly useful as a base for loaders.
    pub fn new(id: impl Into<PackageId>, pkg_path: impl Into<PackagePath>, name: impl Into<PackageName>) -> Self {
        Self {
            id: id.into(),
            pkg_path: pkg_path.into(),
            name: name.into(),
            compiled_files: Vec::new(),
            files: Vec::new(),
            ignored_files: Vec::new(),
            imports: BTreeMap::new(),
            for_test: None,
            module: None,
            errors: Vec::new(),
            standalone: false,
        }
    }

    /// Test variants of a package other than the package under test and its external test
    /// package: copies of dependencies recompiled against the test variant.
    pub fn is_intermediate_test_variant(&self) -> bool {
        match &self.for_test {
            Some(for_test) => {
                for_test != &self.pkg_path
                    && format!("{for_test}_test") != self.pkg_path.as_str()
            }
            None => false,
        }
    }

    pub fn has_missing_import(&self) -> bool {
        self.imports.values().any(PackageId::is_empty)
    }

    /// Every file the loader associated with this package, without duplicates.
    pub fn all_files(&self) -> impl Iterator<Item = &FileUri> + '_ {
        let mut seen = std::collections::BTreeSet::new();
        self.compiled_files
            .iter()
            .chain(&self.files)
            .filter(move |uri| seen.insert(*uri))
    }

    /// Resolved dependency IDs, skipping missing imports.
    pub fn dependencies(&self) -> impl Iterator<Item = &PackageId> + '_ {
        self.imports.values().filter(|id| !id.is_empty())
    }
}
