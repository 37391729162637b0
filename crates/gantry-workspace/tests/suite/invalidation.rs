use std::sync::Arc;

use gantry_workspace::StateChange;
use pretty_assertions::assert_eq;

use super::{id, ids, token, Fixture, MODULE};

#[test]
fn unchanged_files_keep_their_identity() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let a0 = s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();
    let c0 = s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    fx.write("c/c.go", "package c\n\nconst C = 2\n");
    fx.write("b/b.go", "package b\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);

    assert_eq!(s1.read_file(&fx.uri("a/a.go"), &token()).unwrap().identity(), a0.identity());
    assert_ne!(s1.read_file(&fx.uri("c/c.go"), &token()).unwrap().identity(), c0.identity());
    // Not part of the change, so read through to disk for the first time.
    let b1 = s1.read_file(&fx.uri("b/b.go"), &token()).unwrap();
    assert_eq!(b1.content().unwrap(), b"package b\n");
    assert_eq!(s0.read_file(&fx.uri("c/c.go"), &token()).unwrap().identity(), c0.identity());
}

#[test]
fn sequence_ids_increase() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let (s1, _r1) = fx.view.invalidate(StateChange::default()).unwrap();
    let (s2, _r2) = fx.changed(&["c/c.go"]);

    assert_eq!(s0.sequence_id(), 0);
    assert!(s0.sequence_id() < s1.sequence_id());
    assert!(s1.sequence_id() < s2.sequence_id());
    assert!(s0.global_id() < s1.global_id() && s1.global_id() < s2.global_id());
    assert_eq!(s2.view_id(), "test");
}

#[test]
fn empty_change_is_observably_a_no_op() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let before = s0.all_metadata(&token()).unwrap();
    let a0 = s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();
    let requests = fx.fakes.loader.requests();

    let (s1, _r1) = fx.view.invalidate(StateChange::default()).unwrap();
    assert!(s1.initialized());
    let after = s1.all_metadata(&token()).unwrap();
    assert_eq!(ids(&after), ids(&before));
    assert!(before.iter().zip(&after).all(|(old, new)| Arc::ptr_eq(old, new)));
    assert_eq!(s1.find_file(&fx.uri("a/a.go")).map(|fh| fh.identity()), Some(a0.identity()));
    assert_eq!(s1.workspace_metadata(&token()).unwrap().len(), 3);
    assert_eq!(fx.fakes.loader.requests(), requests, "nothing to reload");
}

#[test]
fn closing_a_buffer_restores_disk_content() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let disk = s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert!(!disk.is_overlay());

    fx.open("c/c.go", 1, "package c\n\nconst C = 42\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    let open = s1.read_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert!(open.is_overlay());
    assert_eq!(s1.overlays().len(), 1);

    fx.close("c/c.go");
    let (s2, _r2) = fx.changed(&["c/c.go"]);
    let closed = s2.read_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert!(!closed.is_overlay());
    assert_eq!(closed.identity(), disk.identity());
    assert!(s2.overlays().is_empty());
}

#[test]
fn pending_reload_runs_once() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    fx.write("c/c.go", "package c\n\nimport \"example.com/m/b\"\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    assert!(s1.should_load(&id("example.com/m/c")));
    assert!(s1.metadata(&id("example.com/m/c")).is_none());

    let requests = fx.fakes.loader.requests();
    let metas = s1.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert_eq!(ids(&metas), vec!["example.com/m/c"]);
    assert!(metas[0].imports.contains_key("example.com/m/b"));
    assert!(!s1.should_load(&id("example.com/m/c")));

    s1.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap();
    s1.workspace_metadata(&token()).unwrap();
    assert_eq!(fx.fakes.loader.requests(), requests + 1);
}

#[test]
fn failed_reload_still_clears_the_pending_entry() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    fx.write("c/c.go", "package c\n\nconst C = \"changed\"\n\nimport \"example.com/m/a\"\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    fx.fakes.loader.fail_with("transient failure");
    let requests = fx.fakes.loader.requests();

    let metas = s1.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert!(metas.is_empty());
    assert!(!s1.should_load(&id("example.com/m/c")));
    assert!(s1.is_unloadable(&fx.uri("c/c.go")));

    s1.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap();
    assert_eq!(fx.fakes.loader.requests(), requests + 1, "unloadable files are not retried");

    // An edit makes the file worth another attempt.
    fx.fakes.loader.succeed();
    fx.write("c/c.go", "package c\n");
    let (s2, _r2) = fx.changed(&["c/c.go"]);
    assert!(!s2.is_unloadable(&fx.uri("c/c.go")));
    assert_eq!(ids(&s2.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap()), vec!["example.com/m/c"]);
}

#[test]
fn package_handles_follow_the_metadata_graph() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let a = id("example.com/m/a");
    let b = id("example.com/m/b");
    s0.type_check(&[a.clone()], &token()).unwrap();
    for pkg in [&a, &b] {
        assert!(s0.has_valid_package_handle(pkg));
        assert!(s0.metadata(pkg).is_some());
    }

    fx.open("b/b.go", 1, "package b\n\nimport \"example.com/m/c\"\n\nfunc B() {}\n");
    let (s1, _r1) = fx.changed(&["b/b.go"]);
    for pkg in [&a, &b] {
        assert!(s1.metadata(pkg).is_none(), "{pkg} should be reloaded");
        assert!(!s1.has_valid_package_handle(pkg), "{pkg} has no metadata, so no handle");
    }
    assert!(s1.metadata(&id("example.com/m/c")).is_some());

    s1.workspace_metadata(&token()).unwrap();
    let checked = s1.type_check(&[a.clone()], &token()).unwrap();
    assert!(s1.has_valid_package_handle(&a));
    assert!(Arc::ptr_eq(&checked[0].metadata, &s1.metadata(&a).unwrap()));
}

#[test]
fn module_reports_are_merged_per_manifest() {
    let fx = Fixture::new(MODULE);
    let (_s0, _r0) = fx.initialized();
    let go_mod = fx.uri("go.mod");

    let mut change = StateChange::default();
    change
        .module_upgrades
        .insert(go_mod.clone(), [("golang.org/x/text".to_owned(), "v0.14.0".to_owned())].into());
    change.vulnerabilities.insert(
        go_mod.clone(),
        vec![gantry_workspace::Vulnerability {
            id: "GO-2023-0001".into(),
            module: "golang.org/x/text".into(),
            fixed_version: Some("v0.3.8".into()),
        }],
    );
    let (s1, _r1) = fx.view.invalidate(change).unwrap();
    assert_eq!(s1.module_upgrades(&go_mod).get("golang.org/x/text").map(String::as_str), Some("v0.14.0"));
    assert_eq!(s1.vulnerabilities(&go_mod).len(), 1);

    let (s2, _r2) = fx.changed(&["c/c.go"]);
    assert_eq!(s2.module_upgrades(&go_mod).len(), 1, "carried forward");
    assert_eq!(s2.vulnerabilities(&go_mod)[0].id, "GO-2023-0001");
}

#[test]
fn header_edits_are_detected_whatever_the_language_id() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    // The editor claims the buffer is a module file; the loader still sees Go source.
    fx.fs.open(
        fx.uri("c/c.go"),
        1,
        b"package c\n\nimport \"example.com/m/b\"\n".to_vec(),
        gantry_core::FileKind::Mod,
    );
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    assert!(s1.should_load(&id("example.com/m/c")));
    assert!(s1.metadata(&id("example.com/m/c")).is_none());
}
