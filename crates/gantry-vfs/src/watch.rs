//! Debounced, directory-recursive file watching.
//!
//! [`FileWatcher`] registers one non-recursive OS watch per directory and classifies raw `notify`
//! events into [`FileEvent`]s. Three kinds of threads cooperate:
//!
//! - the `notify` callback, which only appends to a mutex-guarded inbox and never blocks;
//! - the run thread, which drains the inbox, classifies, coalesces and debounces;
//! - the processor thread, which calls the user's handlers one batch at a time.
//!
//! Watches for newly created directories are added on short-lived registration threads so the
//! run thread never blocks on the backend.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use gantry_core::FileUri;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::change::{FileChangeKind, FileEvent};
use crate::lock::lock;

/// Extensions reported by default: sources, assembly and the module/workspace manifests.
pub const DEFAULT_WATCH_EXTENSIONS: &[&str] = &["go", "mod", "sum", "work", "s"];

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("file watcher is closed")]
    Closed,
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Quiet period after the last relevant event before a batch is delivered.
    pub debounce: Duration,
    /// File extensions (without the dot) worth reporting.
    pub extensions: Vec<String>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            extensions: DEFAULT_WATCH_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// Whether a directory with this base name is never watched nor reported.
pub fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_') || name == "testdata"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Write,
    Remove,
    Rename,
}

fn raw_op(kind: &EventKind, path: &Path) -> Option<Op> {
    match kind {
        EventKind::Create(_) => Some(Op::Create),
        EventKind::Remove(_) => Some(Op::Remove),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => Some(Op::Rename),
            RenameMode::To => Some(Op::Create),
            // Backends that report `Both` also report the `From` and `To` halves.
            RenameMode::Both => None,
            RenameMode::Any | RenameMode::Other => Some(if path.exists() {
                Op::Create
            } else {
                Op::Rename
            }),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(Op::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Emit(FileEvent),
    /// A directory appeared: emit, then register watches below it.
    EmitAndRegister(FileEvent, PathBuf),
}

/// Turns one raw `(op, path)` pair into at most one logical event.
struct Classifier {
    extensions: Vec<String>,
    known_dirs: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Classifier {
    fn is_interesting_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| allowed == ext))
    }

    fn classify(&self, op: Op, path: &Path) -> Option<Action> {
        let is_dir = match std::fs::metadata(path) {
            Ok(meta) => meta.is_dir(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                lock(&self.known_dirs).contains(path)
            }
            Err(err) => {
                tracing::debug!(
                    target = "gantry.watch",
                    path = %path.display(),
                    error = %err,
                    "dropping event for path that cannot be stat'ed"
                );
                return None;
            }
        };

        if is_dir {
            let name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
            if skip_dir(name) {
                return None;
            }
            let uri = file_uri(path)?;
            return match op {
                Op::Rename | Op::Remove => {
                    lock(&self.known_dirs).retain(|dir| !dir.starts_with(path));
                    Some(Action::Emit(FileEvent::new(uri, FileChangeKind::Deleted)))
                }
                Op::Create => {
                    lock(&self.known_dirs).insert(path.to_path_buf());
                    Some(Action::EmitAndRegister(
                        FileEvent::new(uri, FileChangeKind::Created),
                        path.to_path_buf(),
                    ))
                }
                Op::Write => None,
            };
        }

        if !self.is_interesting_file(path) {
            return None;
        }
        let kind = match op {
            Op::Rename | Op::Remove => FileChangeKind::Deleted,
            Op::Create => FileChangeKind::Created,
            Op::Write => FileChangeKind::Changed,
        };
        Some(Action::Emit(FileEvent::new(file_uri(path)?, kind)))
    }
}

fn file_uri(path: &Path) -> Option<FileUri> {
    match FileUri::from_path(path) {
        Ok(uri) => Some(uri),
        Err(err) => {
            tracing::debug!(
                target = "gantry.watch",
                path = %path.display(),
                error = %err,
                "dropping event for path without a file URI"
            );
            None
        }
    }
}

/// Pending events in order of first observation; adjacent duplicates are coalesced.
#[derive(Debug, Default)]
struct Batch {
    events: Vec<FileEvent>,
}

impl Batch {
    fn push(&mut self, event: FileEvent) {
        if self.events.last() != Some(&event) {
            self.events.push(event);
        }
    }

    fn take(&mut self) -> Vec<FileEvent> {
        std::mem::take(&mut self.events)
    }
}

enum Incoming {
    Raw(notify::Result<notify::Event>),
    Synthesized(Vec<FileEvent>),
    Error(WatchError),
}

enum Outgoing {
    Events(Vec<FileEvent>),
    /// Errors reported by the backend itself; the last one is returned from `close`.
    BackendError(WatchError),
    Error(WatchError),
}

struct Inbox {
    queue: Mutex<Vec<Incoming>>,
    wake_tx: channel::Sender<()>,
}

impl Inbox {
    fn push(&self, item: Incoming) {
        lock(&self.queue).push(item);
        // A full channel already holds a wakeup that will drain this item.
        let _ = self.wake_tx.try_send(());
    }

    fn drain(&self) -> Vec<Incoming> {
        std::mem::take(&mut *lock(&self.queue))
    }
}

#[derive(Default)]
struct WaitState {
    count: usize,
    closed: bool,
}

/// Counts in-flight registrations. Once closed, no new registration may start.
#[derive(Default)]
struct WaitGroup {
    state: Mutex<WaitState>,
    zero: Condvar,
}

struct WaitGuard(Arc<WaitGroup>);

impl WaitGroup {
    fn enter(self: &Arc<Self>) -> Option<WaitGuard> {
        let mut state = lock(&self.state);
        if state.closed {
            return None;
        }
        state.count += 1;
        Some(WaitGuard(Arc::clone(self)))
    }

    fn close_and_wait(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        while state.count > 0 {
            state = match self.zero.wait(state) {
                Ok(state) => state,
                Err(err) => err.into_inner(),
            };
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.count -= 1;
        if state.count == 0 {
            self.0.zero.notify_all();
        }
    }
}

struct Inner {
    classifier: Classifier,
    watcher: Mutex<Option<RecommendedWatcher>>,
    inbox: Arc<Inbox>,
    stop_rx: channel::Receiver<()>,
    registrations: Arc<WaitGroup>,
}

impl Inner {
    fn report(&self, err: WatchError) {
        self.inbox.push(Incoming::Error(err));
    }

    /// Watches `root` and every non-skipped directory below it, in pre-order. When `synthesize`
    /// is set, returns `Created` events for every directory and interesting file found below
    /// `root`. Transient failures below the root are retried with backoff; other failures there
    /// are reported and skip that subtree. A failure on the root itself is returned.
    fn register_tree(&self, root: &Path, synthesize: bool) -> Result<Vec<FileEvent>, WatchError> {
        let mut events = Vec::new();
        let mut walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !skip_dir(&entry.file_name().to_string_lossy())
            });

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(err.into()),
                Err(err) => {
                    match err.path().filter(|_| is_transient_walk(&err)).map(Path::to_path_buf) {
                        Some(path) => match self.rewalk_with_retry(&path, synthesize, err) {
                            Ok(found) => events.extend(found),
                            Err(WatchError::Closed) => return Err(WatchError::Closed),
                            Err(err) => self.report(err),
                        },
                        None => self.report(err.into()),
                    }
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                lock(&self.classifier.known_dirs).insert(path.to_path_buf());
                match self.add_watch_with_retry(path) {
                    Ok(()) => {}
                    Err(WatchError::Closed) => return Err(WatchError::Closed),
                    Err(err) if entry.depth() == 0 => return Err(err),
                    Err(err) => {
                        tracing::debug!(
                            target = "gantry.watch",
                            dir = %path.display(),
                            error = %err,
                            "failed to watch directory; skipping its subtree"
                        );
                        self.report(err);
                        walker.skip_current_dir();
                        continue;
                    }
                }
                if synthesize && entry.depth() > 0 {
                    if let Some(uri) = file_uri(path) {
                        events.push(FileEvent::new(uri, FileChangeKind::Created));
                    }
                }
            } else if synthesize && self.classifier.is_interesting_file(path) {
                if let Some(uri) = file_uri(path) {
                    events.push(FileEvent::new(uri, FileChangeKind::Created));
                }
            }
        }
        Ok(events)
    }

    fn add_watch_with_retry(&self, dir: &Path) -> Result<(), WatchError> {
        let mut backoff = Backoff::new();
        loop {
            let result = match lock(&self.watcher).as_mut() {
                Some(watcher) => watcher.watch(dir, RecursiveMode::NonRecursive),
                None => return Err(WatchError::Closed),
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !is_transient(&err) || !backoff.wait(&self.stop_rx, dir, &err)? {
                return Err(err.into());
            }
        }
    }

    /// Walks `path` again after `first` failed there, once it can be read.
    fn rewalk_with_retry(
        &self,
        path: &Path,
        synthesize: bool,
        first: walkdir::Error,
    ) -> Result<Vec<FileEvent>, WatchError> {
        let mut backoff = Backoff::new();
        let mut last = first;
        loop {
            if !backoff.wait(&self.stop_rx, path, &last)? {
                return Err(last.into());
            }
            match WalkDir::new(path).max_depth(1).into_iter().find_map(Result::err) {
                None => return self.register_tree(path, synthesize),
                Some(err) if is_transient_walk(&err) => last = err,
                Some(err) => return Err(err.into()),
            }
        }
    }
}

/// Exponential backoff between attempts at a transiently failing operation.
struct Backoff {
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self::starting_at(RETRY_INITIAL_DELAY)
    }

    fn starting_at(delay: Duration) -> Self {
        Self { delay, attempt: 1 }
    }

    /// Sleeps before the next attempt after `err`. Returns `Ok(false)` once every attempt has
    /// been used, and [`WatchError::Closed`] if the watcher stops while sleeping.
    fn wait(
        &mut self,
        stop_rx: &channel::Receiver<()>,
        path: &Path,
        err: &dyn std::fmt::Display,
    ) -> Result<bool, WatchError> {
        if self.attempt >= RETRY_ATTEMPTS {
            return Ok(false);
        }
        tracing::debug!(
            target = "gantry.watch",
            path = %path.display(),
            attempt = self.attempt,
            delay = ?self.delay,
            error = %err,
            "transient failure; retrying"
        );
        match stop_rx.recv_timeout(self.delay) {
            Err(channel::RecvTimeoutError::Timeout) => {}
            _ => return Err(WatchError::Closed),
        }
        self.delay *= 2;
        self.attempt += 1;
        Ok(true)
    }
}

fn is_transient(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::Generic(_) => true,
        notify::ErrorKind::Io(err) => is_transient_io(err),
        _ => false,
    }
}

fn is_transient_walk(err: &walkdir::Error) -> bool {
    err.io_error().is_some_and(is_transient_io)
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn spawn_registration(inner: &Arc<Inner>, dir: PathBuf) {
    let Some(guard) = inner.registrations.enter() else {
        return;
    };
    let worker = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name("gantry-watch-register".to_string())
        .spawn(move || {
            let _guard = guard;
            match worker.register_tree(&dir, true) {
                Ok(events) if !events.is_empty() => {
                    worker.inbox.push(Incoming::Synthesized(events));
                }
                Ok(_) | Err(WatchError::Closed) => {}
                Err(err) => worker.report(err),
            }
        });
    if let Err(err) = spawned {
        inner.report(err.into());
    }
}

fn run(
    inner: Arc<Inner>,
    wake_rx: channel::Receiver<()>,
    stop_rx: channel::Receiver<()>,
    out_tx: channel::Sender<Outgoing>,
    debounce: Duration,
) {
    let mut batch = Batch::default();
    let mut deadline: Option<Instant> = None;

    let drain = |batch: &mut Batch| -> bool {
        let mut appended = false;
        for item in inner.inbox.drain() {
            match item {
                Incoming::Raw(Ok(event)) => {
                    for path in &event.paths {
                        let Some(op) = raw_op(&event.kind, path) else {
                            continue;
                        };
                        match inner.classifier.classify(op, path) {
                            Some(Action::Emit(event)) => {
                                batch.push(event);
                                appended = true;
                            }
                            Some(Action::EmitAndRegister(event, dir)) => {
                                batch.push(event);
                                appended = true;
                                spawn_registration(&inner, dir);
                            }
                            None => {}
                        }
                    }
                }
                Incoming::Raw(Err(err)) => {
                    let _ = out_tx.send(Outgoing::BackendError(err.into()));
                }
                Incoming::Synthesized(events) => {
                    appended |= !events.is_empty();
                    for event in events {
                        batch.push(event);
                    }
                }
                Incoming::Error(err) => {
                    let _ = out_tx.send(Outgoing::Error(err));
                }
            }
        }
        appended
    };

    loop {
        let tick = match deadline {
            Some(deadline) => channel::at(deadline),
            None => channel::never(),
        };
        channel::select! {
            recv(stop_rx) -> _ => {
                drain(&mut batch);
                let events = batch.take();
                if !events.is_empty() {
                    let _ = out_tx.send(Outgoing::Events(events));
                }
                break;
            },
            recv(wake_rx) -> _ => {
                if drain(&mut batch) {
                    deadline = Some(Instant::now() + debounce);
                }
            },
            recv(tick) -> _ => {
                deadline = None;
                let events = batch.take();
                if !events.is_empty() && out_tx.send(Outgoing::Events(events)).is_err() {
                    break;
                }
            },
        }
    }
    tracing::debug!(target = "gantry.watch", "file watcher run loop stopped");
}

fn process<E, R>(
    out_rx: channel::Receiver<Outgoing>,
    on_events: E,
    on_error: R,
    last_error: Arc<Mutex<Option<WatchError>>>,
) where
    E: Fn(Vec<FileEvent>),
    R: Fn(&WatchError),
{
    for message in out_rx {
        match message {
            Outgoing::Events(events) => on_events(events),
            Outgoing::BackendError(err) => {
                on_error(&err);
                *lock(&last_error) = Some(err);
            }
            Outgoing::Error(err) => on_error(&err),
        }
    }
}

/// A debounced, recursive watcher over one or more directory trees.
pub struct FileWatcher {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<channel::Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<WatchError>>>,
}

impl FileWatcher {
    /// Starts the watcher threads. `event_handler` and `error_handler` are called sequentially
    /// from a single thread and should return quickly.
    pub fn new<E, R>(
        options: WatcherOptions,
        event_handler: E,
        error_handler: R,
    ) -> Result<Self, WatchError>
    where
        E: Fn(Vec<FileEvent>) + Send + 'static,
        R: Fn(&WatchError) + Send + 'static,
    {
        let (wake_tx, wake_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let (out_tx, out_rx) = channel::unbounded();

        let inbox = Arc::new(Inbox {
            queue: Mutex::new(Vec::new()),
            wake_tx,
        });
        let callback_inbox = Arc::clone(&inbox);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            callback_inbox.push(Incoming::Raw(res));
        })?;

        let inner = Arc::new(Inner {
            classifier: Classifier {
                extensions: options.extensions,
                known_dirs: Arc::new(Mutex::new(HashSet::new())),
            },
            watcher: Mutex::new(Some(watcher)),
            inbox,
            stop_rx: stop_rx.clone(),
            registrations: Arc::new(WaitGroup::default()),
        });
        let last_error = Arc::new(Mutex::new(None));

        let processor = thread::Builder::new()
            .name("gantry-watch-process".to_string())
            .spawn({
                let last_error = Arc::clone(&last_error);
                move || process(out_rx, event_handler, error_handler, last_error)
            })?;
        let runner = thread::Builder::new()
            .name("gantry-watch-run".to_string())
            .spawn({
                let inner = Arc::clone(&inner);
                let debounce = options.debounce;
                move || run(inner, wake_rx, stop_rx, out_tx, debounce)
            })?;

        Ok(Self {
            inner,
            stop_tx: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(vec![runner, processor]),
            last_error,
        })
    }

    /// Watches `path` and every directory below it that is not filtered by [`skip_dir`]. The
    /// root itself is always watched. Calling this again for a watched tree is harmless.
    pub fn watch_dir(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        let _guard = self
            .inner
            .registrations
            .enter()
            .ok_or(WatchError::Closed)?;
        self.inner.register_tree(path.as_ref(), false)?;
        Ok(())
    }

    /// Stops accepting watches, waits for in-flight registrations, closes the OS watcher and
    /// joins the worker threads. Pending events are delivered before this returns.
    pub fn close(&self) -> Result<(), WatchError> {
        let Some(stop_tx) = lock(&self.stop_tx).take() else {
            return Err(WatchError::Closed);
        };
        drop(stop_tx);

        self.inner.registrations.close_and_wait();
        lock(&self.inner.watcher).take();

        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(target = "gantry.watch", "file watcher thread panicked");
            }
        }

        match lock(&self.last_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("closed", &lock(&self.stop_tx).is_none())
            .finish_non_exhaustive()
    }
}
