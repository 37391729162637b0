use std::cmp::Ordering;
use std::ffi::OsString;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("path is not absolute: {}", .0.display())]
    RelativePath(PathBuf),
    #[error("unsupported URI scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid URI `{uri}`: {message}")]
    Invalid { uri: String, message: String },
}

/// Canonical `file://` identifier for a file or directory.
///
/// The string form is absolute, percent-encoded by the `url` crate, has an uppercase drive letter
/// on Windows and never ends with a slash. Equality, ordering and hashing use that string.
#[derive(Clone)]
pub struct FileUri(Arc<Inner>);

struct Inner {
    uri: Box<str>,
    path: PathBuf,
}

impl FileUri {
    /// Builds a URI from an absolute OS path. The path is lexically normalized first.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, UriError> {
        let raw = path.as_ref();
        let path = normalize_local_path(raw);
        if !path.is_absolute() {
            return Err(UriError::RelativePath(raw.to_path_buf()));
        }
        let url =
            Url::from_file_path(&path).map_err(|()| UriError::RelativePath(raw.to_path_buf()))?;
        let mut uri: String = url.into();
        while uri.len() > "file:///".len() && uri.ends_with('/') {
            uri.pop();
        }
        uppercase_drive_letter(&mut uri);
        Ok(Self(Arc::new(Inner {
            uri: uri.into_boxed_str(),
            path,
        })))
    }

    /// Parses a `file:` URI string and canonicalizes it.
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let url = Url::parse(uri).map_err(|err| UriError::Invalid {
            uri: uri.to_string(),
            message: err.to_string(),
        })?;
        if url.scheme() != "file" {
            return Err(UriError::UnsupportedScheme(url.scheme().to_string()));
        }
        let path = url.to_file_path().map_err(|()| UriError::Invalid {
            uri: uri.to_string(),
            message: "not a local file path".to_string(),
        })?;
        Self::from_path(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0.uri
    }

    /// The OS path this URI denotes.
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// The enclosing directory, or `None` for a filesystem root.
    pub fn dir(&self) -> Option<FileUri> {
        let parent = self.0.path.parent()?;
        FileUri::from_path(parent).ok()
    }

    pub fn base_name(&self) -> &str {
        self.0
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.path.extension().and_then(|ext| ext.to_str())
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> Result<FileUri, UriError> {
        FileUri::from_path(self.0.path.join(rel))
    }

    /// Reports whether `other` is this location or lies beneath it.
    pub fn encloses(&self, other: &FileUri) -> bool {
        other.0.path.starts_with(&self.0.path)
    }
}

impl PartialEq for FileUri {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.uri == other.0.uri
    }
}

impl Eq for FileUri {}

impl PartialOrd for FileUri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileUri {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.uri.cmp(&other.0.uri)
    }
}

impl Hash for FileUri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.uri.hash(state);
    }
}

impl fmt::Display for FileUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.uri)
    }
}

impl fmt::Debug for FileUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileUri").field(&self.as_str()).finish()
    }
}

impl Serialize for FileUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FileUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FileUri::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn uppercase_drive_letter(uri: &mut String) {
    // file:///c:/...
    let bytes = uri.as_bytes();
    if bytes.len() >= 10 && bytes[9] == b':' && bytes[8].is_ascii_lowercase() {
        let upper = (bytes[8] as char).to_ascii_uppercase();
        uri.replace_range(8..9, &upper.to_string());
    }
}

/// Lexically normalizes a local path: removes `.` segments and resolves `..` against preceding
/// segments without touching the file system.
pub fn normalize_local_path(path: &Path) -> PathBuf {
    let mut prefix: Option<OsString> = None;
    let mut has_root = false;
    let mut stack: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix_component) => {
                prefix = Some(normalize_prefix(prefix_component));
            }
            Component::RootDir => has_root = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = stack.last() {
                    if last != ".." {
                        stack.pop();
                        continue;
                    }
                }
                if !has_root {
                    stack.push(OsString::from(".."));
                }
            }
            Component::Normal(segment) => stack.push(segment.to_owned()),
        }
    }

    let mut out = PathBuf::new();
    match (prefix, has_root) {
        (Some(mut prefix), true) => {
            prefix.push(std::path::MAIN_SEPARATOR.to_string());
            out.push(prefix);
        }
        (Some(prefix), false) => out.push(prefix),
        (None, true) => out.push(std::path::MAIN_SEPARATOR.to_string()),
        (None, false) => {}
    }
    out.extend(stack);
    out
}

fn normalize_prefix(prefix_component: std::path::PrefixComponent<'_>) -> OsString {
    #[cfg(windows)]
    {
        let prefix = prefix_component.as_os_str().to_string_lossy().into_owned();
        match prefix.rfind(':') {
            Some(colon) if colon > 0 => {
                let mut chars: Vec<char> = prefix.chars().collect();
                if let Some(drive) = chars.get_mut(colon - 1) {
                    *drive = drive.to_ascii_uppercase();
                }
                OsString::from(chars.into_iter().collect::<String>())
            }
            _ => OsString::from(prefix),
        }
    }

    #[cfg(not(windows))]
    {
        prefix_component.as_os_str().to_owned()
    }
}
