//! Task store behavior over a real filesystem: dedup, state transitions,
//! idempotent completion, shared views, crash recovery.

use std::collections::BTreeSet;

use refmirror::store::{ReplicateRefUpdate, TaskStore, UriUpdates};
use tempfile::TempDir;

const PROJECT: &str = "myProject";
const REF: &str = "myRef";
const REMOTE: &str = "myDest";

fn http_uri() -> String {
    format!("http://example.com/{PROJECT}.git")
}

fn ssh_uri() -> String {
    format!("ssh://example.com/{PROJECT}.git")
}

fn ref_update() -> ReplicateRefUpdate {
    ReplicateRefUpdate::new(PROJECT, REF, http_uri(), REMOTE)
}

fn uri_updates(update: &ReplicateRefUpdate) -> UriUpdates {
    UriUpdates::single(update)
}

struct Fixture {
    _dir: TempDir,
    store: TaskStore,
    update: ReplicateRefUpdate,
    batch: UriUpdates,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let update = ref_update();
        let batch = uri_updates(&update);
        Self {
            _dir: dir,
            store,
            update,
            batch,
        }
    }

    fn assert_no_incomplete_tasks(&self) {
        assert!(self.store.list_waiting().unwrap().is_empty());
        assert!(self.store.list_running().unwrap().is_empty());
    }
}

#[test]
fn can_list_empty_storage() {
    let f = Fixture::new();
    f.assert_no_incomplete_tasks();
}

#[test]
fn can_list_waiting_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    assert_eq!(f.store.list_waiting().unwrap(), vec![f.update.clone()]);
}

#[test]
fn can_start_waiting_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();
    assert!(f.store.list_waiting().unwrap().is_empty());
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);
}

#[test]
fn can_finish_running_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.finish(&f.batch).unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn instances_of_the_same_storage_have_the_same_elements() {
    let f = Fixture::new();
    let persisted_view = TaskStore::open(f._dir.path()).unwrap();

    assert!(f.store.list_waiting().unwrap().is_empty());
    assert!(persisted_view.list_waiting().unwrap().is_empty());

    f.store.create(&f.update).unwrap();
    assert_eq!(f.store.list_waiting().unwrap(), vec![f.update.clone()]);
    assert_eq!(persisted_view.list_waiting().unwrap(), vec![f.update.clone()]);

    f.store.start(&f.batch).unwrap();
    assert!(f.store.list_waiting().unwrap().is_empty());
    assert!(persisted_view.list_waiting().unwrap().is_empty());
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);
    assert_eq!(persisted_view.list_running().unwrap(), vec![f.update.clone()]);

    f.store.finish(&f.batch).unwrap();
    assert!(f.store.list_running().unwrap().is_empty());
    assert!(persisted_view.list_running().unwrap().is_empty());
}

#[test]
fn same_ref_update_created_twice_is_stored_once() {
    let f = Fixture::new();
    let key = f.store.create(&f.update).unwrap();
    let second_key = f.store.create(&f.update).unwrap();
    assert_eq!(key, second_key);
    assert_eq!(f.store.list_waiting().unwrap(), vec![f.update.clone()]);
}

#[test]
fn can_create_different_uris() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);

    let key_a = f.store.create(&f.update).unwrap();
    let key_b = f.store.create(&update_b).unwrap();
    assert_eq!(f.store.list_waiting().unwrap().len(), 2);
    assert_ne!(key_a, key_b);
}

#[test]
fn can_start_different_uris() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);
    let batch_b = uri_updates(&update_b);
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();

    f.store.start(&f.batch).unwrap();
    assert_eq!(f.store.list_waiting().unwrap(), vec![update_b.clone()]);
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);

    f.store.start(&batch_b).unwrap();
    assert!(f.store.list_waiting().unwrap().is_empty());
    let running: BTreeSet<_> = f.store.list_running().unwrap().into_iter().collect();
    assert_eq!(
        running,
        BTreeSet::from([f.update.clone(), update_b.clone()])
    );
}

#[test]
fn can_finish_different_uris() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);
    let batch_b = uri_updates(&update_b);
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.start(&batch_b).unwrap();

    f.store.finish(&f.batch).unwrap();
    assert_eq!(f.store.list_running().unwrap(), vec![update_b.clone()]);

    f.store.finish(&batch_b).unwrap();
    assert!(f.store.list_running().unwrap().is_empty());
}

#[test]
fn different_uris_created_twice_is_stored_once() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);

    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    assert_eq!(f.store.list_waiting().unwrap().len(), 2);
}

#[test]
fn can_create_multiple_refs_for_same_uri() {
    let f = Fixture::new();
    let ref_a = ReplicateRefUpdate::new(PROJECT, "refA", http_uri(), REMOTE);
    let ref_b = ReplicateRefUpdate::new(PROJECT, "refB", http_uri(), REMOTE);

    let key_a = f.store.create(&ref_a).unwrap();
    let key_b = f.store.create(&ref_b).unwrap();
    assert_eq!(f.store.list_waiting().unwrap().len(), 2);
    assert_ne!(key_a, key_b);
}

#[test]
fn can_finish_multiple_refs_for_same_uri() {
    let f = Fixture::new();
    let ref_a = ReplicateRefUpdate::new(PROJECT, "refA", http_uri(), REMOTE);
    let ref_b = ReplicateRefUpdate::new(PROJECT, "refB", http_uri(), REMOTE);
    let batch = UriUpdates {
        project: PROJECT.into(),
        remote: REMOTE.into(),
        uri: http_uri(),
        refs: BTreeSet::from(["refA".to_string(), "refB".to_string()]),
    };
    f.store.create(&ref_a).unwrap();
    f.store.create(&ref_b).unwrap();
    f.store.start(&batch).unwrap();

    f.store.finish(&batch).unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn can_reset_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();

    f.store.reset(&f.batch).unwrap();
    assert_eq!(f.store.list_waiting().unwrap(), vec![f.update.clone()]);
    assert!(f.store.list_running().unwrap().is_empty());
}

#[test]
fn can_complete_reset_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.reset(&f.batch).unwrap();

    f.store.start(&f.batch).unwrap();
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);
    assert!(f.store.list_waiting().unwrap().is_empty());

    f.store.finish(&f.batch).unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn can_reset_all_empty() {
    let f = Fixture::new();
    f.store.reset_all().unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn can_reset_all_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();

    f.store.reset_all().unwrap();
    assert_eq!(f.store.list_waiting().unwrap(), vec![f.update.clone()]);
    assert!(f.store.list_running().unwrap().is_empty());
}

#[test]
fn can_complete_reset_all_update() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.reset_all().unwrap();

    f.store.start(&f.batch).unwrap();
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);
    assert!(f.store.list_waiting().unwrap().is_empty());

    f.store.finish(&f.batch).unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn can_reset_all_multiple_updates() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);
    let batch_b = uri_updates(&update_b);
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.start(&batch_b).unwrap();

    f.store.reset_all().unwrap();
    let waiting: BTreeSet<_> = f.store.list_waiting().unwrap().into_iter().collect();
    assert_eq!(
        waiting,
        BTreeSet::from([f.update.clone(), update_b.clone()])
    );
}

#[test]
fn can_complete_multiple_reset_all_updates() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);
    let batch_b = uri_updates(&update_b);
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.start(&batch_b).unwrap();
    f.store.reset_all().unwrap();

    f.store.start(&f.batch).unwrap();
    assert_eq!(f.store.list_running().unwrap(), vec![f.update.clone()]);
    assert_eq!(f.store.list_waiting().unwrap(), vec![update_b.clone()]);

    f.store.start(&batch_b).unwrap();
    let running: BTreeSet<_> = f.store.list_running().unwrap().into_iter().collect();
    assert_eq!(
        running,
        BTreeSet::from([f.update.clone(), update_b.clone()])
    );
    assert!(f.store.list_waiting().unwrap().is_empty());

    f.store.finish(&f.batch).unwrap();
    f.store.finish(&batch_b).unwrap();
    f.assert_no_incomplete_tasks();
}

#[test]
fn illegal_finish_uncreated_is_graceful() {
    let f = Fixture::new();
    f.store.finish(&f.batch).unwrap();
}

#[test]
fn illegal_double_finish_is_graceful() {
    let f = Fixture::new();
    f.store.create(&f.update).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.finish(&f.batch).unwrap();

    f.store.finish(&f.batch).unwrap();
}

#[test]
fn illegal_double_finish_different_uri_is_graceful() {
    let f = Fixture::new();
    let update_b = ReplicateRefUpdate::new(PROJECT, REF, ssh_uri(), REMOTE);
    let batch_b = uri_updates(&update_b);
    f.store.create(&f.update).unwrap();
    f.store.create(&update_b).unwrap();
    f.store.start(&f.batch).unwrap();
    f.store.start(&batch_b).unwrap();
    f.store.finish(&f.batch).unwrap();
    f.store.finish(&batch_b).unwrap();

    f.store.finish(&f.batch).unwrap();
    f.store.finish(&batch_b).unwrap();
    assert!(f.store.list_running().unwrap().is_empty());
}

#[test]
fn stale_temp_files_are_swept_on_reset_all() {
    let f = Fixture::new();
    let tmp = f._dir.path().join("ref-updates").join("tmp").join("leftover");
    std::fs::write(&tmp, b"partial").unwrap();

    f.store.reset_all().unwrap();
    assert!(!tmp.exists());
    f.assert_no_incomplete_tasks();
}
