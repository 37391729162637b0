use gantry_core::{FileUri, Range};
use serde::{Deserialize, Serialize};

use crate::load::LoadError;
use crate::metadata::{Metadata, PackageError, PackageErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticSource {
    List,
    Parse,
    Type,
    Module,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub uri: FileUri,
    pub range: Range,
    pub severity: Severity,
    pub source: DiagnosticSource,
    pub message: String,
}

impl Diagnostic {
    pub fn error(uri: FileUri, range: Range, source: DiagnosticSource, message: impl Into<String>) -> Self {
        Self {
            uri,
            range,
            severity: Severity::Error,
            source,
            message: message.into(),
        }
    }
}

/// Converts the errors the loader attached to `meta` into diagnostics. Errors without a position
/// are reported at the top of the package's first file, or dropped if the package has no files.
pub fn package_error_diagnostics(meta: &Metadata) -> Vec<Diagnostic> {
    meta.errors
        .iter()
        .filter_map(|err| package_error_diagnostic(meta, err))
        .collect()
}

fn package_error_diagnostic(meta: &Metadata, err: &PackageError) -> Option<Diagnostic> {
    let source = match err.kind {
        PackageErrorKind::List | PackageErrorKind::Unknown => DiagnosticSource::List,
        PackageErrorKind::Parse => DiagnosticSource::Parse,
        PackageErrorKind::Type => DiagnosticSource::Type,
    };
    let (uri, range) = match &err.position {
        Some((uri, pos)) => (uri.clone(), Range::point(*pos)),
        None => (meta.all_files().next()?.clone(), Range::default()),
    };
    Some(Diagnostic::error(uri, range, source, err.message.clone()))
}

/// A failure that prevents the workspace from loading at all, shown once at workspace scope
/// until a change plausibly resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalError {
    pub message: String,
    /// Diagnostics on specific manifest files, when the failure could be attributed.
    pub diagnostics: Vec<Diagnostic>,
}

impl CriticalError {
    /// Returns `None` for cancellation, which is never a user-visible error.
    pub fn from_load_error(err: &LoadError) -> Option<Self> {
        match err {
            LoadError::Cancelled => None,
            LoadError::Modules(errors) => Some(Self {
                message: err.to_string(),
                diagnostics: errors
                    .iter()
                    .map(|module| {
                        Diagnostic::error(
                            module.mod_file.clone(),
                            Range::default(),
                            DiagnosticSource::Module,
                            module.message.clone(),
                        )
                    })
                    .collect(),
            }),
            _ => Some(Self {
                message: err.to_string(),
                diagnostics: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gantry_core::Position;

    use crate::load::ModuleError;

    #[test]
    fn list_errors_become_diagnostics() {
        let file = FileUri::parse("file:///w/a/a.go").unwrap();
        let mut meta = Metadata::new("a", "example.com/a", "a");
        meta.compiled_files.push(file.clone());
        meta.errors.push(PackageError::list("could not import example.com/b"));
        meta.errors.push(PackageError {
            kind: PackageErrorKind::Parse,
            message: "expected ';'".into(),
            position: Some((file.clone(), Position::new(3, 4))),
        });

        let diagnostics = package_error_diagnostics(&meta);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].source, DiagnosticSource::List);
        assert_eq!(diagnostics[0].range, Range::default());
        assert_eq!(diagnostics[1].range.start, Position::new(3, 4));

        let empty = Metadata {
            compiled_files: Vec::new(),
            ..meta
        };
        let remaining = package_error_diagnostics(&empty);
        assert_eq!(remaining.len(), 1, "only the positioned error can be placed");
        assert_eq!(remaining[0].source, DiagnosticSource::Parse);
    }

    #[test]
    fn critical_errors_keep_module_attribution() {
        let mod_file = FileUri::parse("file:///w/go.mod").unwrap();
        let err = LoadError::Modules(vec![ModuleError {
            mod_file: mod_file.clone(),
            message: "bad go version".into(),
        }]);
        let critical = CriticalError::from_load_error(&err).unwrap();
        assert_eq!(critical.diagnostics[0].uri, mod_file);
        assert!(CriticalError::from_load_error(&LoadError::Cancelled).is_none());
    }
}
