use std::path::Path;
use std::sync::Once;

use anyhow::Context;
use gantry_core::FileUri;

/// Writes `files` (paths relative to `root`) to disk, creating parent directories as needed.
pub fn write_fixture(root: &Path, files: &[(&str, &str)]) -> anyhow::Result<()> {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// The URI of `rel` under `root`.
///
/// Panics if the path cannot be expressed as a file URI, which only happens for relative roots.
#[track_caller]
pub fn uri(root: &Path, rel: &str) -> FileUri {
    let path = if rel.is_empty() { root.to_path_buf() } else { root.join(rel) };
    match FileUri::from_path(&path) {
        Ok(uri) => uri,
        Err(err) => panic!("invalid fixture path {}: {err}", path.display()),
    }
}

/// Routes `tracing` output through the test harness's captured writer. Honors `GANTRY_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env(gantry_workspace::logging::LOG_ENV)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
