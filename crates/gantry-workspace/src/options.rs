use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gantry_cache::{CacheConfig, DiskCache, FileCache, MemoryCache, CACHE_DIR_ENV};
use gantry_vfs::WatcherOptions;
use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;

/// Per-session configuration, usually deserialized from the editor's settings object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// `+dir` / `-dir` filters relative to each view root. The last matching filter wins; `**`
    /// matches any number of directories.
    pub directory_filters: Vec<String>,
    pub build_flags: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub watch: WatchOptions,
    pub cache_dir: Option<PathBuf>,
    pub load_timeout_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            directory_filters: vec!["-**/node_modules".to_owned()],
            build_flags: Vec::new(),
            env: BTreeMap::new(),
            watch: WatchOptions::default(),
            cache_dir: None,
            load_timeout_secs: 600,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchOptions {
    pub debounce_ms: u64,
    pub extensions: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            extensions: gantry_vfs::DEFAULT_WATCH_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_owned())
                .collect(),
        }
    }
}

impl WatchOptions {
    pub fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            extensions: self.extensions.iter().cloned().collect(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "directoryFilters",
    "buildFlags",
    "env",
    "watch",
    "cacheDir",
    "loadTimeoutSecs",
    "logging",
];

impl Options {
    /// Deserializes a settings object. Unknown top-level keys are logged and ignored.
    pub fn from_json(value: serde_json::Value) -> anyhow::Result<Self> {
        if let Some(object) = value.as_object() {
            for key in object.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(target = "gantry.workspace", key = %key, "ignoring unknown setting");
                }
            }
        }
        serde_json::from_value(value).context("invalid settings")
    }

    /// Applies overrides from the process environment (`GANTRY_CACHE_DIR`).
    pub fn from_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|dir| !dir.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn directory_filter(&self) -> DirectoryFilter {
        DirectoryFilter::new(&self.directory_filters)
    }

    /// The derived-data cache: on disk under `cache_dir` (or the default cache root), falling
    /// back to memory if no directory can be determined or created.
    pub fn file_cache(&self) -> Arc<dyn FileCache> {
        let config = CacheConfig {
            cache_root_override: self.cache_dir.clone(),
        };
        let disk = config
            .file_cache_dir()
            .and_then(DiskCache::new);
        match disk {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                tracing::warn!(
                    target = "gantry.workspace",
                    error = %err,
                    "falling back to an in-memory file cache"
                );
                Arc::new(MemoryCache::new())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterRule {
    include: bool,
    segments: Vec<String>,
}

/// Decides which directories under a view root are part of the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryFilter {
    rules: Vec<FilterRule>,
}

impl DirectoryFilter {
    pub fn new(filters: &[String]) -> Self {
        let rules = filters
            .iter()
            .filter_map(|filter| {
                let filter = filter.trim();
                let (include, pattern) = match filter.split_at_checked(1)? {
                    ("+", rest) => (true, rest),
                    ("-", rest) => (false, rest),
                    _ => {
                        tracing::warn!(
                            target = "gantry.workspace",
                            filter,
                            "directory filter must start with + or -"
                        );
                        return None;
                    }
                };
                let segments = pattern
                    .trim_matches('/')
                    .split('/')
                    .filter(|segment| !segment.is_empty() && *segment != ".")
                    .map(str::to_owned)
                    .collect();
                Some(FilterRule { include, segments })
            })
            .collect();
        Self { rules }
    }

    /// Whether `path` (relative to the view root) is excluded. A rule matching a directory also
    /// matches everything below it.
    pub fn excludes(&self, relative: &Path) -> bool {
        let segments: Vec<&str> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        let mut excluded = false;
        for rule in &self.rules {
            if prefix_matches(&rule.segments, &segments) {
                excluded = !rule.include;
            }
        }
        excluded
    }

    /// Like [`DirectoryFilter::excludes`], for an absolute path under `root`. Paths outside
    /// `root` are never excluded.
    pub fn excludes_under(&self, root: &Path, path: &Path) -> bool {
        path.strip_prefix(root)
            .map(|relative| self.excludes(relative))
            .unwrap_or(false)
    }
}

/// Whether `pattern` matches some leading run of `path` segments.
fn prefix_matches(pattern: &[String], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => true,
        Some((first, rest)) if first == "**" => {
            (0..=path.len()).any(|skip| prefix_matches(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((segment, tail)) => first.as_str() == *segment && prefix_matches(rest, tail),
            None => false,
        },
    }
}
