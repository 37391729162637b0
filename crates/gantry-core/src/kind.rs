use std::path::Path;

use serde::{Deserialize, Serialize};

/// The kind of a workspace file, by extension or editor language id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Go,
    Mod,
    Sum,
    Work,
    Asm,
    Tmpl,
    Unknown,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "go" => FileKind::Go,
            "mod" => FileKind::Mod,
            "sum" => FileKind::Sum,
            "work" => FileKind::Work,
            "s" => FileKind::Asm,
            "tmpl" | "gotmpl" => FileKind::Tmpl,
            _ => FileKind::Unknown,
        }
    }

    /// Maps an editor language id. Unknown ids return `None` so callers can fall back to the
    /// extension.
    pub fn from_language_id(id: &str) -> Option<Self> {
        match id {
            "go" => Some(FileKind::Go),
            "go.mod" => Some(FileKind::Mod),
            "go.sum" => Some(FileKind::Sum),
            "go.work" => Some(FileKind::Work),
            "tmpl" | "gotmpl" => Some(FileKind::Tmpl),
            _ => None,
        }
    }

    pub fn for_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(FileKind::from_extension)
            .unwrap_or(FileKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifests_are_classified_by_extension() {
        assert_eq!(FileKind::for_path(Path::new("/w/go.mod")), FileKind::Mod);
        assert_eq!(FileKind::for_path(Path::new("/w/go.work.sum")), FileKind::Sum);
        assert_eq!(FileKind::for_path(Path::new("/w/a.go")), FileKind::Go);
        assert_eq!(FileKind::for_path(Path::new("/w/README")), FileKind::Unknown);
    }

    #[test]
    fn language_ids_override_nothing_when_unknown() {
        assert_eq!(FileKind::from_language_id("go.work"), Some(FileKind::Work));
        assert_eq!(FileKind::from_language_id("rust"), None);
    }
}
