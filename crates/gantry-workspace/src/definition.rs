use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use gantry_core::{FileUri, UriError};
use gantry_vfs::FileSource;

use crate::modfile;

pub const GOPACKAGESDRIVER: &str = "GOPACKAGESDRIVER";
pub const GOWORK: &str = "GOWORK";
pub const GO111MODULE: &str = "GO111MODULE";
pub const GOPATH: &str = "GOPATH";
pub const GOFLAGS: &str = "GOFLAGS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewType {
    /// Packages are described by an external driver program.
    ExternalDriver,
    /// GOPATH mode: import paths are directories under `$GOPATH/src`.
    LegacyPath,
    /// A single module, declared by a `go.mod` file.
    SingleModule,
    /// Several modules tied together by a `go.work` file.
    MultiModule,
    /// A directory outside any module or GOPATH.
    AdHoc,
}

/// The build configuration of a view. Two definitions are equal only if every field is; any
/// difference requires a new view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDefinition {
    /// The workspace folder the view was created for.
    pub folder: FileUri,
    /// The directory loads run in.
    pub root: FileUri,
    pub env: BTreeMap<String, String>,
    pub build_flags: Vec<String>,
    pub work_file: Option<FileUri>,
    /// The module file governing `root`, if any (including a `-modfile` override).
    pub mod_file: Option<FileUri>,
    /// Every workspace module's `go.mod`.
    pub mod_files: BTreeSet<FileUri>,
    pub view_type: ViewType,
}

impl WorkspaceDefinition {
    /// Whether `uri` is a manifest that defines this workspace.
    pub fn is_workspace_manifest(&self, uri: &FileUri) -> bool {
        self.work_file.as_ref() == Some(uri)
            || self.mod_file.as_ref() == Some(uri)
            || self.mod_files.contains(uri)
    }

    /// The directory holding each workspace manifest.
    pub fn manifest_dirs(&self) -> BTreeSet<FileUri> {
        self.work_file
            .iter()
            .chain(&self.mod_file)
            .chain(&self.mod_files)
            .filter_map(FileUri::dir)
            .collect()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_value(&self.env, key)
    }
}

fn env_value<'a>(env: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
}

/// Classifies the workspace rooted at `folder`.
///
/// Manifests are read through `fs`, so unsaved editor content is honored. A manifest that fails
/// to parse still defines the view; the error surfaces when the view initializes.
pub fn define_view(
    folder: &FileUri,
    env: &BTreeMap<String, String>,
    build_flags: &[String],
    fs: &dyn FileSource,
) -> Result<WorkspaceDefinition, UriError> {
    let mut def = WorkspaceDefinition {
        folder: folder.clone(),
        root: folder.clone(),
        env: env.clone(),
        build_flags: build_flags.to_vec(),
        work_file: None,
        mod_file: None,
        mod_files: BTreeSet::new(),
        view_type: ViewType::AdHoc,
    };

    if env_value(env, GOPACKAGESDRIVER).is_some_and(|driver| driver != "off") {
        def.view_type = ViewType::ExternalDriver;
        return Ok(def);
    }

    if env_value(env, GO111MODULE) == Some("off") {
        def.view_type = ViewType::LegacyPath;
        return Ok(def);
    }

    let work_file = match env_value(env, GOWORK) {
        Some("off") => None,
        Some(path) => Some(FileUri::from_path(path)?),
        None => find_upward(folder, "go.work", fs),
    };
    if let Some(work_file) = work_file {
        if let Some(dir) = work_file.dir() {
            def.root = dir.clone();
            def.mod_files = work_modules(&work_file, &dir, fs);
        }
        def.mod_file = modfile_override(env)?.or_else(|| find_upward(folder, "go.mod", fs));
        def.work_file = Some(work_file);
        def.view_type = ViewType::MultiModule;
        return Ok(def);
    }

    let mod_file = match modfile_override(env)? {
        Some(overridden) => Some(overridden),
        None => find_upward(folder, "go.mod", fs),
    };
    if let Some(mod_file) = mod_file {
        let manifest_dir = find_upward(folder, "go.mod", fs)
            .and_then(|found| found.dir())
            .or_else(|| mod_file.dir());
        if let Some(dir) = manifest_dir {
            def.root = dir;
        }
        def.mod_files.insert(mod_file.clone());
        def.mod_file = Some(mod_file);
        def.view_type = ViewType::SingleModule;
        return Ok(def);
    }

    if in_gopath(folder, env) {
        def.view_type = ViewType::LegacyPath;
    }
    Ok(def)
}

/// The nearest `name` in `start` or one of its ancestors.
fn find_upward(start: &FileUri, name: &str, fs: &dyn FileSource) -> Option<FileUri> {
    std::iter::successors(Some(start.clone()), FileUri::dir).find_map(|dir| {
        let candidate = dir.join(name).ok()?;
        fs.read_file(&candidate).exists().then_some(candidate)
    })
}

fn work_modules(work_file: &FileUri, dir: &FileUri, fs: &dyn FileSource) -> BTreeSet<FileUri> {
    let fh = fs.read_file(work_file);
    let Ok(content) = fh.content() else {
        return BTreeSet::new();
    };
    let parsed = match modfile::parse_work(&String::from_utf8_lossy(content)) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(
                target = "gantry.workspace",
                uri = %work_file,
                error = %err,
                "failed to parse workspace file"
            );
            return BTreeSet::new();
        }
    };
    parsed
        .uses
        .iter()
        .filter_map(|used| {
            let path = Path::new(used);
            let module_dir = if path.is_absolute() {
                PathBuf::from(path)
            } else {
                dir.path().join(path)
            };
            FileUri::from_path(module_dir.join("go.mod")).ok()
        })
        .collect()
}

/// A `-modfile=...` flag in GOFLAGS.
fn modfile_override(env: &BTreeMap<String, String>) -> Result<Option<FileUri>, UriError> {
    let Some(flags) = env_value(env, GOFLAGS) else {
        return Ok(None);
    };
    flags
        .split_whitespace()
        .find_map(|flag| {
            flag.strip_prefix("-modfile=")
                .or_else(|| flag.strip_prefix("--modfile="))
        })
        .map(FileUri::from_path)
        .transpose()
}

fn in_gopath(folder: &FileUri, env: &BTreeMap<String, String>) -> bool {
    let Some(gopath) = env_value(env, GOPATH) else {
        return false;
    };
    std::env::split_paths(gopath).any(|entry| folder.path().starts_with(entry.join("src")))
}
