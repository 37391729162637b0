use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::{id, ids, token, Fixture, MODULE};

#[test]
fn created_file_joins_its_directory_package() {
    let fx = Fixture::new(&[("go.mod", "module example.com/m\n"), ("foo/foo.go", "package foo\n")]);
    let (s0, _r0) = fx.initialized();
    let foo = id("example.com/m/foo");
    assert!(s0.metadata(&foo).is_some());

    fx.write("foo/bar.go", "package main\n");
    let (s1, _r1) = fx.changed(&["foo/bar.go"]);
    assert!(s1.metadata(&foo).is_none(), "same-directory package is reloaded");
    assert!(s1.should_load(&foo));

    let metas = s1.metadata_for_file(&fx.uri("foo/bar.go"), &token()).unwrap();
    assert_eq!(ids(&metas), vec!["example.com/m/foo"]);
    assert!(metas[0].compiled_files.contains(&fx.uri("foo/bar.go")));
    assert!(!metas[0].errors.is_empty(), "conflicting package clauses are a list error");
    assert!(!s1.is_unloadable(&fx.uri("foo/bar.go")));
}

#[test]
fn deleted_directory_removes_its_packages_and_importers() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let c0 = s0.metadata(&id("example.com/m/c")).unwrap();

    fx.remove("b");
    let (s1, _r1) = fx.changed(&["b/b.go", "b"]);
    assert!(s1.metadata(&id("example.com/m/b")).is_none());
    assert!(s1.metadata(&id("example.com/m/a")).is_none(), "importers are invalidated too");
    assert!(Arc::ptr_eq(&s1.metadata(&id("example.com/m/c")).unwrap(), &c0));

    let workspace = s1.workspace_metadata(&token()).unwrap();
    assert_eq!(ids(&workspace), vec!["example.com/m/a", "example.com/m/c"]);
    let a = s1.metadata(&id("example.com/m/a")).unwrap();
    assert!(a.has_missing_import());
}

#[test]
fn renamed_file_updates_the_package_file_set() {
    let fx = Fixture::new(MODULE);
    let (_s0, _r0) = fx.initialized();

    std::fs::rename(fx.root().join("c/c.go"), fx.root().join("c/renamed.go")).unwrap();
    let (s1, _r1) = fx.changed(&["c/c.go", "c/renamed.go"]);
    assert!(s1.metadata(&id("example.com/m/c")).is_none());

    let metas = s1.metadata_for_file(&fx.uri("c/renamed.go"), &token()).unwrap();
    assert_eq!(ids(&metas), vec!["example.com/m/c"]);
    assert_eq!(metas[0].compiled_files, vec![fx.uri("c/renamed.go")]);
    assert!(s1.metadata_for_file(&fx.uri("c/c.go"), &token()).unwrap().is_empty());
}

#[test]
fn added_import_reloads_only_the_edited_package() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();
    let b0 = s0.metadata(&id("example.com/m/b")).unwrap();
    let c0 = s0.metadata(&id("example.com/m/c")).unwrap();

    fx.open(
        "a/a.go",
        1,
        "package a\n\nimport (\n\t\"example.com/m/b\"\n\t\"example.com/m/c\"\n)\n",
    );
    let (s1, _r1) = fx.changed(&["a/a.go"]);
    assert!(s1.metadata(&id("example.com/m/a")).is_none());
    assert!(Arc::ptr_eq(&s1.metadata(&id("example.com/m/b")).unwrap(), &b0));
    assert!(Arc::ptr_eq(&s1.metadata(&id("example.com/m/c")).unwrap(), &c0));

    let metas = s1.metadata_for_file(&fx.uri("a/a.go"), &token()).unwrap();
    let imports: Vec<&str> = metas[0].imports.keys().map(|path| path.as_str()).collect();
    assert_eq!(imports, vec!["example.com/m/b", "example.com/m/c"]);
}

#[test]
fn unchanged_header_keeps_metadata() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();
    let a0 = s0.metadata(&id("example.com/m/a")).unwrap();

    fx.open(
        "a/a.go",
        1,
        "package a\n\nimport \"example.com/m/b\"\n\nfunc A() { b.B(); b.B() }\n",
    );
    let (s1, _r1) = fx.changed(&["a/a.go"]);
    assert!(Arc::ptr_eq(&s1.metadata(&id("example.com/m/a")).unwrap(), &a0));
    assert!(!s1.should_load(&id("example.com/m/a")));
}

#[test]
fn build_constraint_edit_reloads_the_package() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    fx.open("c/c.go", 1, "//go:build linux\n\npackage c\n\nconst C = 1\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    assert!(s1.metadata(&id("example.com/m/c")).is_none());
}

#[test]
fn deleted_import_retries_packages_with_errors() {
    let fx = Fixture::new(&[
        ("go.mod", "module example.com/m\n"),
        ("a/a.go", "package a\n\nimport \"example.com/m/b\"\n"),
        ("b/b.go", "package b\n"),
        ("c/c.go", "package c\n\nimport \"example.com/m/missing\"\n"),
    ]);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();
    assert!(!s0.metadata(&id("example.com/m/c")).unwrap().errors.is_empty());
    let b0 = s0.metadata(&id("example.com/m/b")).unwrap();

    fx.open("a/a.go", 1, "package a\n");
    let (s1, _r1) = fx.changed(&["a/a.go"]);
    assert!(s1.metadata(&id("example.com/m/a")).is_none());
    assert!(s1.metadata(&id("example.com/m/c")).is_none(), "packages with errors are retried");
    assert!(s1.should_load(&id("example.com/m/c")));
    assert!(Arc::ptr_eq(&s1.metadata(&id("example.com/m/b")).unwrap(), &b0));

    let workspace = s1.workspace_metadata(&token()).unwrap();
    assert_eq!(workspace.len(), 3);
    assert!(s1.metadata(&id("example.com/m/a")).unwrap().imports.is_empty());
}

#[test]
fn new_file_retries_missing_imports() {
    let fx = Fixture::new(&[
        ("go.mod", "module example.com/m\n"),
        ("a/a.go", "package a\n\nimport \"example.com/m/d\"\n"),
    ]);
    let (s0, _r0) = fx.initialized();
    assert!(s0.metadata(&id("example.com/m/a")).unwrap().has_missing_import());

    fx.write("d/d.go", "package d\n");
    let (s1, _r1) = fx.changed(&["d/d.go"]);
    assert!(s1.metadata(&id("example.com/m/a")).is_none());

    s1.workspace_metadata(&token()).unwrap();
    let a = s1.metadata(&id("example.com/m/a")).unwrap();
    assert!(!a.has_missing_import());
    assert_eq!(a.imports.get("example.com/m/d"), Some(&id("example.com/m/d")));
}

#[test]
fn manifest_change_reinitializes() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    assert_eq!(fx.fakes.loader.requests(), 1);

    fx.write("go.mod", "module example.com/m\n\ngo 1.22\n");
    let (s1, _r1) = fx.changed(&["go.mod"]);
    assert!(s0.initialized());
    assert!(!s1.initialized());
    assert!(s1.metadata(&id("example.com/m/a")).is_none(), "every package is invalidated");

    s1.await_initialized(&token()).unwrap();
    assert!(s1.initialized());
    assert_eq!(fx.fakes.loader.requests(), 2, "the workspace load ran again");
    assert_eq!(s1.workspace_metadata(&token()).unwrap().len(), 3);
}

#[test]
fn manifest_fix_clears_the_critical_error() {
    let fx = Fixture::new(&[("go.mod", "go 1.21\n"), ("a/a.go", "package a\n")]);
    let (s0, _r0) = fx.initialized();
    assert!(s0.critical_error().is_some());

    fx.write("go.mod", "module example.com/m\n\ngo 1.21\n");
    let (s1, _r1) = fx.changed(&["go.mod"]);
    s1.await_initialized(&token()).unwrap();
    assert_eq!(s1.critical_error(), None);
    assert_eq!(ids(&s1.workspace_metadata(&token()).unwrap()), vec!["example.com/m/a"]);
}

#[test]
fn unsaved_manifest_edits_do_not_reinitialize() {
    let fx = Fixture::new(MODULE);
    let (_s0, _r0) = fx.initialized();

    fx.open("go.mod", 1, "module example.com/m\n\ngo 1.23\n");
    let (s1, _r1) = fx.changed(&["go.mod"]);
    assert!(s1.initialized());
    let parsed = s1.parse_mod(&fx.uri("go.mod"), &token()).unwrap();
    assert_eq!(parsed.go.as_deref(), Some("1.23"));
}
