use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gantry_cache::FileCache;
use gantry_core::FileUri;
use gantry_scheduler::CancellationToken;

use crate::check::TypeChecker;
use crate::diagnostics::Diagnostic;
use crate::load::PackageLoader;
use crate::parse::Parser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TidyResult {
    /// The tidied manifest text.
    pub tidied: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Module maintenance commands (the equivalent of `go mod tidy` and `go mod why`).
pub trait ModuleTool: Send + Sync {
    fn tidy(
        &self,
        mod_file: &FileUri,
        env: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> anyhow::Result<TidyResult>;

    /// For each module path, the import chain explaining why it is needed.
    fn why(
        &self,
        mod_file: &FileUri,
        modules: &[String],
        token: &CancellationToken,
    ) -> anyhow::Result<BTreeMap<String, String>>;
}

/// The external services a session depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn PackageLoader>,
    pub parser: Arc<dyn Parser>,
    pub checker: Arc<dyn TypeChecker>,
    pub module_tool: Option<Arc<dyn ModuleTool>>,
    pub cache: Arc<dyn FileCache>,
}

impl Collaborators {
    pub fn new(
        loader: Arc<dyn PackageLoader>,
        parser: Arc<dyn Parser>,
        checker: Arc<dyn TypeChecker>,
        cache: Arc<dyn FileCache>,
    ) -> Self {
        Self {
            loader,
            parser,
            checker,
            module_tool: None,
            cache,
        }
    }

    pub fn with_module_tool(mut self, tool: Arc<dyn ModuleTool>) -> Self {
        self.module_tool = Some(tool);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("module_tool", &self.module_tool.is_some())
            .finish_non_exhaustive()
    }
}
