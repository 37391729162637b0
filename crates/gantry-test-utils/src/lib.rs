//! Utilities shared by Gantry tests.
//!
//! Deterministic stand-ins for the external collaborators of the workspace engine (a line-based
//! parser, a loader that derives packages from the directory layout, and a type checker that
//! reports what it was given), plus helpers for writing fixture trees.

mod checker;
mod fixture;
mod loader;
mod module_tool;
mod parser;

use std::sync::Arc;

use gantry_cache::MemoryCache;
use gantry_workspace::Collaborators;

pub use checker::FakeTypeChecker;
pub use fixture::{init_tracing, uri, write_fixture};
pub use loader::{FakeLoader, BUILTIN_FILE};
pub use module_tool::FakeModuleTool;
pub use parser::FakeParser;

/// A full set of fakes, with handles to each so tests can inspect them.
#[derive(Clone)]
pub struct Fakes {
    pub loader: Arc<FakeLoader>,
    pub parser: Arc<FakeParser>,
    pub checker: Arc<FakeTypeChecker>,
    pub module_tool: Arc<FakeModuleTool>,
    pub cache: Arc<MemoryCache>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            loader: Arc::new(FakeLoader::new()),
            parser: Arc::new(FakeParser),
            checker: Arc::new(FakeTypeChecker::new()),
            module_tool: Arc::new(FakeModuleTool::new()),
            cache: Arc::new(MemoryCache::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.loader.clone(),
            self.parser.clone(),
            self.checker.clone(),
            self.cache.clone(),
        )
        .with_module_tool(self.module_tool.clone())
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}
