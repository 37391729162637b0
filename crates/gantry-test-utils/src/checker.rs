use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gantry_core::Range;
use gantry_scheduler::{Cancelled, CancellationToken};
use gantry_workspace::{
    CheckedPackage, Diagnostic, DiagnosticSource, ImportPath, ImportResolver, Metadata, MethodSet, PackageId, ParsedFile,
    Reference, SymbolKind, TypeChecker,
};
use parking_lot::Mutex;

/// A type checker that reports unresolved imports, records a reference per resolved import and
/// exports every upper-case top-level name.
#[derive(Debug, Default)]
pub struct FakeTypeChecker {
    checks: AtomicUsize,
    checked: Mutex<Vec<PackageId>>,
}

impl FakeTypeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packages checked so far.
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// IDs of the checked packages, in the order they were checked.
    pub fn checked(&self) -> Vec<PackageId> {
        self.checked.lock().clone()
    }

    /// How many times `id` was checked.
    pub fn checks_of(&self, id: &str) -> usize {
        self.checked.lock().iter().filter(|checked| checked.as_str() == id).count()
    }
}

impl TypeChecker for FakeTypeChecker {
    fn check(
        &self,
        metadata: &Metadata,
        files: &[Arc<ParsedFile>],
        resolver: &dyn ImportResolver,
        token: &CancellationToken,
    ) -> Result<CheckedPackage, Cancelled> {
        Cancelled::check(token)?;
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.checked.lock().push(metadata.id.clone());

        let mut checked = CheckedPackage::default();
        let mut methods: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for file in files {
            for import in &file.imports {
                let path = ImportPath::new(import);
                match metadata.imports.get(&path) {
                    Some(id) if id.is_empty() => checked.diagnostics.push(Diagnostic::error(
                        file.uri.clone(),
                        Range::default(),
                        DiagnosticSource::Type,
                        format!("could not import {import}"),
                    )),
                    Some(_) => match resolver.resolve(&path) {
                        Some(dep) => checked.references.push(Reference {
                            uri: file.uri.clone(),
                            range: Range::default(),
                            package: dep.metadata.pkg_path.clone(),
                            name: dep.checked.exports.first().cloned().unwrap_or_default(),
                        }),
                        None => checked.diagnostics.push(Diagnostic::error(
                            file.uri.clone(),
                            Range::default(),
                            DiagnosticSource::Type,
                            format!("dependency {import} was not checked"),
                        )),
                    },
                    None => {}
                }
            }

            for symbol in &file.symbols {
                if symbol.kind == SymbolKind::Method {
                    if let Some((recv, method)) = symbol.name.split_once('.') {
                        methods.entry(recv.to_owned()).or_default().push(method.to_owned());
                    }
                } else if symbol.name.starts_with(char::is_uppercase) {
                    checked.exports.push(symbol.name.clone());
                }
            }
        }
        checked.method_sets = methods
            .into_iter()
            .map(|(type_name, methods)| MethodSet { type_name, methods })
            .collect();
        checked.exports.sort();
        Ok(checked)
    }
}
