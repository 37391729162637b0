mod initial_load;
mod invalidation;
mod lifecycle;
mod packages;
mod scenarios;
mod session;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_core::FileUri;
use gantry_scheduler::CancellationToken;
use gantry_test_utils::{init_tracing, uri, write_fixture, Fakes};
use gantry_vfs::{DiskFs, FileSource, OverlayFs};
use gantry_workspace::{define_view, Options, PackageId, Snapshot, SnapshotRelease, StateChange, View};
use tempfile::TempDir;

/// A module with a small import graph: `a` imports `b`; `c` stands alone.
pub const MODULE: &[(&str, &str)] = &[
    ("go.mod", "module example.com/m\n\ngo 1.21\n"),
    ("a/a.go", "package a\n\nimport \"example.com/m/b\"\n\nfunc A() { b.B() }\n"),
    (
        "b/b.go",
        "package b\n\nfunc B() {}\n\ntype T struct{}\n\nfunc (t T) M() {}\n",
    ),
    ("c/c.go", "package c\n\nconst C = 1\n"),
];

/// One view over a temporary directory, driven directly (without a session).
///
/// Field order matters: the view must shut down before the directory is removed.
pub struct Fixture {
    pub view: View,
    pub fs: Arc<OverlayFs>,
    pub fakes: Fakes,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self::with_fakes(files, Fakes::new())
    }

    pub fn with_fakes(files: &[(&str, &str)], fakes: Fakes) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), files).unwrap();
        Self::in_dir(dir, fakes)
    }

    pub fn in_dir(dir: TempDir, fakes: Fakes) -> Self {
        init_tracing();
        let fs = Arc::new(OverlayFs::new(Arc::new(DiskFs::new())));
        let options = Options::default();
        let folder = uri(dir.path(), "");
        let definition = define_view(&folder, &options.env, &options.build_flags, &*fs).unwrap();
        let view = View::new("test", definition, fs.clone(), fakes.collaborators(), &options).unwrap();
        Self { view, fs, fakes, dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn uri(&self, rel: &str) -> FileUri {
        uri(self.dir.path(), rel)
    }

    pub fn snapshot(&self) -> (Arc<Snapshot>, SnapshotRelease) {
        self.view.snapshot().unwrap()
    }

    /// The current snapshot, once its workspace load has finished.
    pub fn initialized(&self) -> (Arc<Snapshot>, SnapshotRelease) {
        let (snapshot, release) = self.snapshot();
        snapshot.await_initialized(&CancellationToken::new()).unwrap();
        (snapshot, release)
    }

    pub fn write(&self, rel: &str, content: &str) {
        write_fixture(self.dir.path(), &[(rel, content)]).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        let path = self.dir.path().join(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
    }

    /// Opens (or replaces) an unsaved editor buffer for `rel`.
    pub fn open(&self, rel: &str, version: i32, content: &str) {
        self.fs.open(
            self.uri(rel),
            version,
            content.as_bytes().to_vec(),
            gantry_core::FileKind::for_path(Path::new(rel)),
        );
    }

    pub fn close(&self, rel: &str) {
        self.fs.close(&self.uri(rel)).unwrap();
    }

    /// Invalidates the view with the current content of every path in `rels`.
    pub fn changed(&self, rels: &[&str]) -> (Arc<Snapshot>, SnapshotRelease) {
        let change = StateChange::files(rels.iter().map(|rel| self.fs.read_file(&self.uri(rel))));
        self.view.invalidate(change).unwrap()
    }
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

pub fn id(value: &str) -> PackageId {
    PackageId::new(value)
}

pub fn ids<'a>(metas: impl IntoIterator<Item = &'a Arc<gantry_workspace::Metadata>>) -> Vec<String> {
    metas.into_iter().map(|meta| meta.id.to_string()).collect()
}

/// Polls `condition` until it holds, panicking after a generous deadline.
#[track_caller]
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
