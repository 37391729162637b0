//! Virtual file system layer for Gantry.
//!
//! The VFS is responsible for:
//! - Reading files from the OS file system (memoized by modification time).
//! - Providing in-memory overlays (editor buffers) that take precedence over disk.
//! - Representing files as immutable handles with a content identity.
//! - Watching directory trees and turning raw notifications into debounced file events.

mod change;
mod file;
mod fs;
mod lock;
mod overlay_fs;
mod watch;

pub use change::{FileChangeKind, FileEvent};
pub use file::{DiskFile, FileError, FileHandle, FileIdentity, Overlay};
pub use fs::{DiskFs, FileSource};
pub use overlay_fs::{OverlayError, OverlayFs};
pub use watch::{skip_dir, FileWatcher, WatchError, WatcherOptions, DEFAULT_WATCH_EXTENSIONS};
