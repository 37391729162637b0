use gantry_workspace::{LoadScope, ViewType};
use pretty_assertions::assert_eq;

use super::{id, ids, token, Fixture, MODULE};

#[test]
fn initial_load_finds_workspace_packages() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();

    assert!(snapshot.initialized());
    assert_eq!(snapshot.critical_error(), None);
    assert_eq!(snapshot.definition().view_type, ViewType::SingleModule);

    let workspace = snapshot.workspace_metadata(&token()).unwrap();
    assert_eq!(ids(&workspace), vec!["example.com/m/a", "example.com/m/b", "example.com/m/c"]);

    let all = snapshot.all_metadata(&token()).unwrap();
    assert!(all.iter().any(|meta| meta.id.as_str() == "builtin"), "builtin is loaded but not a workspace package");
    assert_eq!(
        snapshot.builtin_file().map(|uri| uri.to_string()),
        Some(gantry_test_utils::BUILTIN_FILE.to_owned())
    );

    let a = snapshot.metadata(&id("example.com/m/a")).unwrap();
    assert_eq!(a.compiled_files, vec![fx.uri("a/a.go")]);
    assert_eq!(a.imports.get("example.com/m/b"), Some(&id("example.com/m/b")));

    let queries = fx.fakes.loader.queries();
    assert_eq!(queries.len(), 1, "one load for the whole workspace");
    assert_eq!(
        queries[0],
        vec![LoadScope::Module(fx.uri("")).query(), "builtin".to_owned()]
    );
}

#[test]
fn initialization_runs_once_per_snapshot() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();
    snapshot.await_initialized(&token()).unwrap();
    snapshot.workspace_metadata(&token()).unwrap();
    assert_eq!(fx.fakes.loader.requests(), 1);
}

#[test]
fn load_failure_is_a_critical_error() {
    let fakes = gantry_test_utils::Fakes::new();
    fakes.loader.fail_with("go: cannot find main module");
    let fx = Fixture::with_fakes(MODULE, fakes);

    let (snapshot, _release) = fx.initialized();
    assert!(snapshot.initialized(), "a failed load still completes initialization");
    let critical = snapshot.critical_error().expect("critical error");
    assert!(critical.message.contains("cannot find main module"), "{}", critical.message);
    assert!(snapshot.workspace_metadata(&token()).unwrap().is_empty());
}

#[test]
fn broken_module_file_is_attributed_to_the_manifest() {
    let fx = Fixture::new(&[("go.mod", "go 1.21\n"), ("a.go", "package a\n")]);
    let (snapshot, _release) = fx.initialized();

    let critical = snapshot.critical_error().expect("critical error");
    assert_eq!(critical.diagnostics.len(), 1);
    assert_eq!(critical.diagnostics[0].uri, fx.uri("go.mod"));
}

#[test]
fn ad_hoc_views_load_the_root_directory() {
    let fx = Fixture::new(&[("main.go", "package main\n\nfunc main() {}\n")]);
    let (snapshot, _release) = fx.initialized();

    assert_eq!(snapshot.definition().view_type, ViewType::AdHoc);
    assert_eq!(fx.fakes.loader.queries()[0], vec!["./".to_owned(), "builtin".to_owned()]);
    let workspace = snapshot.workspace_metadata(&token()).unwrap();
    assert_eq!(workspace.len(), 1);
    assert_eq!(workspace[0].name.as_str(), "main");
}

#[test]
fn filtered_directories_are_not_workspace_packages() {
    let fx = Fixture::new(&[
        ("go.mod", "module example.com/m\n"),
        ("a/a.go", "package a\n"),
        ("node_modules/x/x.go", "package x\n"),
    ]);
    let (snapshot, _release) = fx.initialized();
    let workspace = snapshot.workspace_metadata(&token()).unwrap();
    assert_eq!(ids(&workspace), vec!["example.com/m/a"]);
}
