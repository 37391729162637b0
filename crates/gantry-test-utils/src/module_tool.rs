use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use gantry_core::FileUri;
use gantry_scheduler::CancellationToken;
use gantry_workspace::{modfile, ModuleTool, TidyResult};

/// A module tool that "tidies" by sorting requirements and explains every module as required
/// by the main module.
#[derive(Debug, Default)]
pub struct FakeModuleTool {
    tidies: AtomicUsize,
    whys: AtomicUsize,
}

impl FakeModuleTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tidies(&self) -> usize {
        self.tidies.load(Ordering::SeqCst)
    }

    pub fn whys(&self) -> usize {
        self.whys.load(Ordering::SeqCst)
    }
}

impl ModuleTool for FakeModuleTool {
    fn tidy(
        &self,
        mod_file: &FileUri,
        _env: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> anyhow::Result<TidyResult> {
        anyhow::ensure!(!token.is_cancelled(), "tidy cancelled");
        self.tidies.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(mod_file.path())
            .with_context(|| format!("failed to read {mod_file}"))?;
        let parsed = modfile::parse_mod(&text)?;

        let mut tidied = String::new();
        if let Some(module) = &parsed.module {
            tidied.push_str(&format!("module {module}\n"));
        }
        if let Some(go) = &parsed.go {
            tidied.push_str(&format!("\ngo {go}\n"));
        }
        let mut requires = parsed.requires;
        requires.sort_by(|a, b| a.path.cmp(&b.path));
        for require in requires {
            tidied.push_str(&format!("\nrequire {} {}\n", require.path, require.version));
        }
        Ok(TidyResult {
            tidied,
            diagnostics: Vec::new(),
        })
    }

    fn why(
        &self,
        mod_file: &FileUri,
        modules: &[String],
        token: &CancellationToken,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        anyhow::ensure!(!token.is_cancelled(), "why cancelled");
        self.whys.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(mod_file.path())
            .with_context(|| format!("failed to read {mod_file}"))?;
        let main = modfile::parse_mod(&text)?.module.unwrap_or_default();
        Ok(modules
            .iter()
            .map(|module| (module.clone(), format!("# {module}\n{main}\n{module}")))
            .collect())
    }
}
