use std::sync::Arc;

use gantry_workspace::{define_view, DiagnosticSource, MethodSet, Options, View};
use pretty_assertions::assert_eq;

use super::{id, ids, token, Fixture, MODULE};

#[test]
fn type_check_is_memoized_across_unrelated_changes() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let a = id("example.com/m/a");

    let first = s0.type_check(&[a.clone()], &token()).unwrap();
    assert_eq!(fx.fakes.checker.checks_of("example.com/m/a"), 1);
    assert_eq!(fx.fakes.checker.checks_of("example.com/m/b"), 1, "dependencies are checked first");
    let again = s0.type_check(&[a.clone()], &token()).unwrap();
    assert!(Arc::ptr_eq(&first[0], &again[0]));

    fx.write("c/c.go", "package c\n\nconst C = 2\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    let after = s1.type_check(&[a.clone()], &token()).unwrap();
    assert!(Arc::ptr_eq(&first[0], &after[0]));
    assert_eq!(fx.fakes.checker.checks(), 2);
}

#[test]
fn same_content_buffer_reuses_the_checked_package() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let b = id("example.com/m/b");
    let first = s0.type_check(&[b.clone()], &token()).unwrap();

    let (_, disk) = MODULE.iter().find(|(rel, _)| *rel == "b/b.go").unwrap();
    fx.open("b/b.go", 1, disk);
    let (s1, _r1) = fx.changed(&["b/b.go"]);
    assert!(!s1.has_valid_package_handle(&b));
    let after = s1.type_check(&[b.clone()], &token()).unwrap();
    assert!(Arc::ptr_eq(&first[0], &after[0]));
    assert_eq!(fx.fakes.checker.checks_of("example.com/m/b"), 1);
}

#[test]
fn missing_imports_are_reported_by_loader_and_checker() {
    let fx = Fixture::new(&[
        ("go.mod", "module example.com/m\n"),
        ("a/a.go", "package a\n\nimport \"example.com/m/missing\"\n"),
    ]);
    let (snapshot, _release) = fx.initialized();
    let a = id("example.com/m/a");

    let diagnostics = snapshot.package_diagnostics(&[a.clone()], &token()).unwrap();
    let sources: Vec<DiagnosticSource> = diagnostics[&a].iter().map(|diag| diag.source).collect();
    assert_eq!(sources, vec![DiagnosticSource::List, DiagnosticSource::Type]);
    assert!(diagnostics[&a].iter().all(|diag| diag.uri == fx.uri("a/a.go")));
    assert!(diagnostics[&a][1].message.contains("example.com/m/missing"));
}

#[test]
fn references_and_method_sets() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();
    let a = id("example.com/m/a");
    let b = id("example.com/m/b");

    let refs = snapshot.references(&[a.clone()], &token()).unwrap();
    assert_eq!(refs[&a].len(), 1);
    assert_eq!(refs[&a][0].package.as_str(), "example.com/m/b");
    assert_eq!(refs[&a][0].name, "B");
    assert_eq!(refs[&a][0].uri, fx.uri("a/a.go"));

    let method_sets = snapshot.method_sets(&[b.clone()], &token()).unwrap();
    assert_eq!(
        method_sets[&b],
        vec![MethodSet {
            type_name: "T".into(),
            methods: vec!["M".into()],
        }]
    );
    assert!(snapshot.method_sets(&[a.clone()], &token()).unwrap()[&a].is_empty());
}

#[test]
fn results_are_shared_through_the_file_cache() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let b = id("example.com/m/b");
    s0.references(&[b.clone()], &token()).unwrap();
    let checks = fx.fakes.checker.checks();

    // A second view over the same folder shares the collaborators, and so the cache.
    let options = Options::default();
    let definition = define_view(&fx.uri(""), &options.env, &options.build_flags, &*fx.fs).unwrap();
    let second = View::new("second", definition, fx.fs.clone(), fx.fakes.collaborators(), &options).unwrap();
    let (s1, r1) = second.snapshot().unwrap();
    s1.await_initialized(&token()).unwrap();

    let refs = s1.references(&[b.clone()], &token()).unwrap();
    assert!(refs[&b].is_empty());
    assert_eq!(fx.fakes.checker.checks(), checks, "served from the cache");

    s1.method_sets(&[b.clone()], &token()).unwrap();
    assert_eq!(fx.fakes.checker.checks(), checks + 1, "a different result kind misses");

    drop(r1);
    second.shutdown();
}

#[test]
fn unknown_packages_have_no_metadata() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();
    let err = snapshot.type_check(&[id("example.com/m/nope")], &token()).unwrap_err();
    assert!(err.to_string().contains("example.com/m/nope"), "{err}");
}

#[test]
fn reverse_dependencies_follow_imports() {
    let fx = Fixture::new(&[
        ("go.mod", "module example.com/m\n"),
        ("a/a.go", "package a\n\nimport \"example.com/m/b\"\n"),
        ("b/b.go", "package b\n\nimport \"example.com/m/c\"\n"),
        ("c/c.go", "package c\n"),
    ]);
    let (snapshot, _release) = fx.initialized();
    let c = id("example.com/m/c");

    let direct = snapshot.reverse_dependencies(&c, false, &token()).unwrap();
    assert_eq!(ids(direct.values()), vec!["example.com/m/b"]);
    let transitive = snapshot.reverse_dependencies(&c, true, &token()).unwrap();
    assert_eq!(ids(transitive.values()), vec!["example.com/m/a", "example.com/m/b"]);
    assert!(snapshot
        .reverse_dependencies(&id("example.com/m/a"), true, &token())
        .unwrap()
        .is_empty());
}

#[test]
fn symbols_of_a_file() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();
    let symbols = snapshot.symbolize(&fx.uri("b/b.go"), &token()).unwrap();
    let names: Vec<&str> = symbols.iter().map(|symbol| symbol.name.as_str()).collect();
    assert_eq!(names, vec!["B", "T", "T.M"]);
}

#[test]
fn module_tool_results_are_memoized_until_the_module_changes() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    let go_mod = fx.uri("go.mod");
    s0.read_file(&fx.uri("a/a.go"), &token()).unwrap();

    let tidied = s0.mod_tidy(&go_mod, &token()).unwrap();
    assert_eq!(tidied.tidied, "module example.com/m\n\ngo 1.21\n");
    s0.mod_tidy(&go_mod, &token()).unwrap();
    s0.mod_why(&go_mod, &token()).unwrap();
    assert_eq!(fx.fakes.module_tool.tidies(), 1);

    // A body edit does not change what the module needs.
    fx.open("a/a.go", 1, "package a\n\nimport \"example.com/m/b\"\n\nfunc A() {}\n");
    let (s1, _r1) = fx.changed(&["a/a.go"]);
    s1.mod_tidy(&go_mod, &token()).unwrap();
    assert_eq!(fx.fakes.module_tool.tidies(), 1);

    fx.open("a/a.go", 2, "package a\n\nimport \"example.com/m/c\"\n");
    let (s2, _r2) = fx.changed(&["a/a.go"]);
    s2.mod_tidy(&go_mod, &token()).unwrap();
    s2.mod_why(&go_mod, &token()).unwrap();
    assert_eq!(fx.fakes.module_tool.tidies(), 2);
    assert_eq!(fx.fakes.module_tool.whys(), 2);
}
