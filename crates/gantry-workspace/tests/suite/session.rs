use std::sync::Arc;

use gantry_test_utils::{uri, write_fixture, Fakes};
use gantry_workspace::{FileAction, FileModification, Options, Session, ViewType};
use pretty_assertions::assert_eq;

use super::{eventually, token, MODULE};

fn session_over(files: &[(&str, &str)]) -> (tempfile::TempDir, Arc<Session>, Fakes) {
    gantry_test_utils::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), files).unwrap();
    let fakes = Fakes::new();
    let session = Arc::new(Session::new(Options::default(), fakes.collaborators()));
    (dir, session, fakes)
}

#[test]
fn adding_a_folder_twice_returns_the_same_view() {
    let (dir, session, _fakes) = session_over(MODULE);
    let folder = uri(dir.path(), "");

    let first = session.add_view(&folder).unwrap();
    let second = session.add_view(&folder).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(session.views().len(), 1);
    assert_eq!(first.definition().view_type, ViewType::SingleModule);

    let owner = session.view_of(&uri(dir.path(), "a/a.go")).unwrap();
    assert!(Arc::ptr_eq(&owner, &first));
    assert!(session.view_of(&uri(tempfile::tempdir().unwrap().path(), "x.go")).is_none());
}

#[test]
fn editor_changes_invalidate_the_enclosing_view() {
    let (dir, session, _fakes) = session_over(MODULE);
    let view = session.add_view(&uri(dir.path(), "")).unwrap();
    let c = uri(dir.path(), "c/c.go");

    let affected = session
        .did_modify_files(&[FileModification::open(c.clone(), 1, &b"package c\n\nconst C = 3\n"[..])])
        .unwrap();
    assert_eq!(affected.len(), 1);
    assert!(Arc::ptr_eq(&affected[0], &view));

    let (snapshot, _release) = view.snapshot().unwrap();
    assert_eq!(snapshot.sequence_id(), 1);
    let fh = snapshot.read_file(&c, &token()).unwrap();
    assert!(fh.is_overlay());
    assert_eq!(fh.content().unwrap(), b"package c\n\nconst C = 3\n");

    session
        .did_modify_files(&[FileModification::change(c.clone(), 2, &b"package c\n"[..])])
        .unwrap();
    let (snapshot, _release) = view.snapshot().unwrap();
    assert_eq!(snapshot.read_file(&c, &token()).unwrap().content().unwrap(), b"package c\n");

    session.did_modify_files(&[FileModification::new(c.clone(), FileAction::Close)]).unwrap();
    let (snapshot, _release) = view.snapshot().unwrap();
    assert!(!snapshot.read_file(&c, &token()).unwrap().is_overlay());
}

#[test]
fn changes_outside_every_view_are_ignored() {
    let (dir, session, _fakes) = session_over(MODULE);
    let view = session.add_view(&uri(dir.path(), "")).unwrap();
    let elsewhere = tempfile::tempdir().unwrap();

    let affected = session
        .did_modify_files(&[FileModification::new(uri(elsewhere.path(), "x.go"), FileAction::Created)])
        .unwrap();
    assert!(affected.is_empty());
    assert_eq!(view.snapshot().unwrap().0.sequence_id(), 0);
}

#[test]
fn closing_an_unopened_buffer_is_an_error() {
    let (dir, session, _fakes) = session_over(MODULE);
    session.add_view(&uri(dir.path(), "")).unwrap();
    let result = session.did_modify_files(&[FileModification::new(uri(dir.path(), "a/a.go"), FileAction::Close)]);
    assert!(result.is_err());
}

#[test]
fn new_workspace_file_replaces_the_view() {
    let (dir, session, _fakes) = session_over(MODULE);
    let folder = uri(dir.path(), "");
    let old = session.add_view(&folder).unwrap();

    write_fixture(dir.path(), &[("go.work", "go 1.21\n\nuse .\n")]).unwrap();
    let affected = session
        .did_modify_files(&[FileModification::new(uri(dir.path(), "go.work"), FileAction::Created)])
        .unwrap();
    assert_eq!(affected.len(), 1);
    let replacement = &affected[0];
    assert_ne!(replacement.id(), old.id());
    assert_eq!(replacement.definition().view_type, ViewType::MultiModule);
    assert!(Arc::ptr_eq(&session.views()[0], replacement));

    eventually("the replaced view shuts down", || old.is_shutdown());
    let (snapshot, _release) = replacement.snapshot().unwrap();
    snapshot.await_initialized(&token()).unwrap();
    assert_eq!(snapshot.workspace_metadata(&token()).unwrap().len(), 3);
}

#[test]
fn manifest_edits_that_keep_the_definition_invalidate_in_place() {
    let (dir, session, _fakes) = session_over(MODULE);
    let view = session.add_view(&uri(dir.path(), "")).unwrap();

    write_fixture(dir.path(), &[("go.mod", "module example.com/m\n\ngo 1.22\n")]).unwrap();
    let affected = session
        .did_modify_files(&[FileModification::new(uri(dir.path(), "go.mod"), FileAction::Changed)])
        .unwrap();
    assert!(Arc::ptr_eq(&affected[0], &view));
    assert_eq!(view.snapshot().unwrap().0.sequence_id(), 1);
}

#[test]
fn removing_a_view_shuts_it_down() {
    let (dir, session, _fakes) = session_over(MODULE);
    let folder = uri(dir.path(), "");
    let view = session.add_view(&folder).unwrap();

    assert!(session.remove_view(&folder));
    assert!(view.is_shutdown());
    assert!(session.views().is_empty());
    assert!(!session.remove_view(&folder));
}

#[test]
fn shutdown_stops_every_view() {
    let (dir, session, _fakes) = session_over(MODULE);
    let other = tempfile::tempdir().unwrap();
    write_fixture(other.path(), &[("main.go", "package main\n")]).unwrap();
    let first = session.add_view(&uri(dir.path(), "")).unwrap();
    let second = session.add_view(&uri(other.path(), "")).unwrap();

    session.shutdown();
    assert!(first.is_shutdown());
    assert!(second.is_shutdown());
    assert!(session.views().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn watched_disk_changes_reach_the_view() {
    let (dir, session, _fakes) = session_over(MODULE);
    let view = session.add_view(&uri(dir.path(), "")).unwrap();
    let watch = session.start_watching().unwrap();

    write_fixture(dir.path(), &[("c/extra.go", "package c\n\nconst D = 2\n")]).unwrap();
    eventually("the watcher reports the new file", || {
        view.snapshot().unwrap().0.sequence_id() > 0
    });
    let (snapshot, _release) = view.snapshot().unwrap();
    let metas = snapshot.metadata_for_file(&uri(dir.path(), "c/extra.go"), &token()).unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].id.as_str(), "example.com/m/c");

    watch.stop().unwrap();
}
