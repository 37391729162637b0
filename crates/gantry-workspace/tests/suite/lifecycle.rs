use std::time::Duration;

use gantry_workspace::{SnapshotError, StateChange, ViewError};

use super::{eventually, id, ids, token, Fixture, MODULE};

#[test]
fn superseded_snapshots_are_cancelled_then_destroyed() {
    let fx = Fixture::new(MODULE);
    let (s0, r0) = fx.initialized();
    let (s1, _r1) = fx.view.invalidate(StateChange::default()).unwrap();

    assert!(s0.background_token().is_cancelled());
    assert!(!s1.background_token().is_cancelled());
    assert!(matches!(
        s0.type_check(&[id("example.com/m/a")], &token()),
        Err(SnapshotError::Cancelled)
    ));

    // Still referenced, so not destroyed yet.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(s0.destroyed_by(), None);

    drop(r0);
    eventually("the previous snapshot is destroyed", || s0.destroyed_by().is_some());
    assert_eq!(s0.destroyed_by(), Some("View::invalidate"));
    assert!(matches!(s0.acquire(), Err(SnapshotError::Destroyed { .. })));
    assert_eq!(s1.destroyed_by(), None);
}

#[test]
fn shutdown_destroys_the_current_snapshot() {
    let fx = Fixture::new(MODULE);
    let (snapshot, release) = fx.initialized();
    drop(release);

    fx.view.shutdown();
    assert!(fx.view.is_shutdown());
    assert_eq!(snapshot.destroyed_by(), Some("View::shutdown"));
    match snapshot.acquire() {
        Err(SnapshotError::Destroyed { global_id, by }) => {
            assert_eq!(global_id, snapshot.global_id());
            assert_eq!(by, "View::shutdown");
        }
        other => panic!("expected a destroyed snapshot, got {other:?}"),
    }
    assert!(matches!(fx.view.snapshot(), Err(ViewError::Shutdown)));
    assert!(matches!(fx.view.invalidate(StateChange::default()), Err(ViewError::Shutdown)));

    fx.view.shutdown();
}

#[test]
fn releasing_twice_is_harmless() {
    let fx = Fixture::new(MODULE);
    let (_snapshot, mut release) = fx.initialized();
    release.release();
    release.release();
    drop(release);
    fx.view.shutdown();
}

#[test]
fn shutdown_cancels_a_slow_initial_load() {
    let fakes = gantry_test_utils::Fakes::new();
    fakes.loader.set_delay(Some(Duration::from_secs(30)));
    let fx = Fixture::with_fakes(MODULE, fakes);
    eventually("the initial load starts", || fx.fakes.loader.requests() == 1);

    // Shutting down cancels the slow initial load instead of waiting for it.
    let (snapshot, release) = fx.snapshot();
    drop(release);
    fx.view.shutdown();
    assert!(!snapshot.initialized(), "a cancelled load does not count as initialization");
}

#[test]
fn request_cancellation_is_not_memoized() {
    let fx = Fixture::new(MODULE);
    let (snapshot, _release) = fx.initialized();
    let go_mod = fx.uri("go.mod");

    let cancelled = token();
    cancelled.cancel();
    assert!(matches!(snapshot.mod_why(&go_mod, &cancelled), Err(SnapshotError::Cancelled)));
    assert!(matches!(
        snapshot.symbolize(&fx.uri("b/b.go"), &cancelled),
        Err(SnapshotError::Cancelled)
    ));
    assert_eq!(fx.fakes.module_tool.whys(), 0);

    assert!(snapshot.mod_why(&go_mod, &token()).unwrap().is_empty());
    assert_eq!(fx.fakes.module_tool.whys(), 1);
    assert_eq!(snapshot.symbolize(&fx.uri("b/b.go"), &token()).unwrap().len(), 3);
}

#[test]
fn destroyed_snapshots_refuse_to_load_again() {
    let fx = Fixture::new(MODULE);
    let (s0, r0) = fx.initialized();
    let (_s1, _r1) = fx.view.invalidate(StateChange::default()).unwrap();
    drop(r0);
    eventually("the previous snapshot is destroyed", || s0.destroyed_by().is_some());

    let requests = fx.fakes.loader.requests();
    assert!(matches!(s0.all_metadata(&token()), Err(SnapshotError::Cancelled)));
    assert!(matches!(s0.workspace_metadata(&token()), Err(SnapshotError::Cancelled)));
    assert!(matches!(s0.await_initialized(&token()), Err(SnapshotError::Cancelled)));
    assert!(matches!(
        s0.metadata_for_file(&fx.uri("a/a.go"), &token()),
        Err(SnapshotError::Cancelled)
    ));
    assert_eq!(fx.fakes.loader.requests(), requests);
    assert!(!s0.initialized());
}

#[test]
fn concurrent_queries_share_one_reload() {
    let fx = Fixture::new(MODULE);
    let (s0, _r0) = fx.initialized();
    s0.read_file(&fx.uri("c/c.go"), &token()).unwrap();

    fx.write("c/c.go", "package c\n\nimport \"example.com/m/b\"\n");
    let (s1, _r1) = fx.changed(&["c/c.go"]);
    assert!(s1.should_load(&id("example.com/m/c")));
    fx.fakes.loader.set_delay(Some(Duration::from_millis(300)));
    let requests = fx.fakes.loader.requests();

    let c = fx.uri("c/c.go");
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| s1.metadata_for_file(&c, &token()).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(ids(&handle.join().unwrap()), vec!["example.com/m/c"]);
        }
    });
    assert_eq!(fx.fakes.loader.requests(), requests + 1);
}
