//! Workspace state engine for Gantry.
//!
//! A [`Session`] routes editor and file system changes to [`View`]s, one per build
//! configuration. Each view publishes immutable, reference-counted [`Snapshot`]s; every query
//! runs against a snapshot, and every change produces a new one through [`View::invalidate`].
//!
//! Package loading, parsing and type checking are delegated to the [`PackageLoader`],
//! [`Parser`] and [`TypeChecker`] collaborators.

mod check;
mod collab;
mod definition;
mod diagnostics;
mod file_map;
mod graph;
mod load;
pub mod logging;
mod metadata;
pub mod modfile;
mod options;
mod parse;
mod session;
mod snapshot;
mod view;

pub use check::{CheckedPackage, DependencyResolver, ImportResolver, MethodSet, Package, Reference, TypeChecker};
pub use collab::{Collaborators, ModuleTool, TidyResult};
pub use definition::{define_view, ViewType, WorkspaceDefinition};
pub use diagnostics::{package_error_diagnostics, CriticalError, Diagnostic, DiagnosticSource, Severity};
pub use file_map::FileMap;
pub use graph::MetadataGraph;
pub use load::{LoadError, LoadRequest, LoadScope, LoadedPackage, ModuleError, PackageLoader};
pub use metadata::{
    ImportPath, Metadata, ModuleInfo, PackageError, PackageErrorKind, PackageId, PackageName, PackagePath,
};
pub use options::{DirectoryFilter, Options, WatchOptions};
pub use parse::{ParseCache, ParseError, ParseMode, ParsedFile, Parser, Symbol, SymbolKind};
pub use session::{FileAction, FileModification, Session, SessionError, WatchHandle};
pub use snapshot::{
    ManifestError, ModuleUpgrades, Snapshot, SnapshotError, SnapshotRelease, StateChange, Vulnerabilities,
    Vulnerability,
};
pub use view::{View, ViewError};
