//! End-to-end replication against bare repositories on the local
//! filesystem: real tasks, real schedulers, real git pushes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use git2::Repository;
use refmirror::config::{GeneralConfig, RemoteConfig, ReplicationConfig};
use refmirror::queue::ReplicationQueue;
use refmirror::store::{ReplicateRefUpdate, TaskStore, UriUpdates};
use tempfile::TempDir;

const PUSH_TIMEOUT: Duration = Duration::from_secs(20);

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    cond()
}

struct Site {
    dir: TempDir,
}

impl Site {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn git_dir(&self) -> PathBuf {
        self.dir.path().join("git")
    }

    fn replica_root(&self, remote: &str) -> PathBuf {
        self.dir.path().join("replicas").join(remote)
    }

    /// Create the primary repository for a project with one commit on
    /// refs/heads/master.
    fn init_project(&self, project: &str) -> git2::Oid {
        let path = self.git_dir().join(format!("{project}.git"));
        let repo = Repository::init_opts(&path, git2::RepositoryInitOptions::new().bare(true))
            .unwrap();
        commit_on(&repo, "refs/heads/master", "initial", &[])
    }

    fn open_project(&self, project: &str) -> Repository {
        Repository::open_bare(self.git_dir().join(format!("{project}.git"))).unwrap()
    }

    /// Create an empty bare replica for a project under a remote.
    fn init_replica(&self, remote: &str, project: &str) -> PathBuf {
        let path = self.replica_root(remote).join(format!("{project}.git"));
        Repository::init_opts(&path, git2::RepositoryInitOptions::new().bare(true)).unwrap();
        path
    }

    fn remote_config(&self, name: &str, delay: u64) -> RemoteConfig {
        RemoteConfig {
            name: name.into(),
            url: vec![format!(
                "file://{}/${{name}}.git",
                self.replica_root(name).display()
            )],
            replication_delay: delay,
            retry_delay: 1,
            ..RemoteConfig::default()
        }
    }

    fn config(&self, remotes: Vec<RemoteConfig>) -> ReplicationConfig {
        ReplicationConfig {
            general: GeneralConfig {
                git_dir: self.git_dir(),
                task_dir: self.dir.path().join("data"),
                ..GeneralConfig::default()
            },
            remotes,
            version: "e2e".into(),
        }
    }

    fn queue(&self, remotes: Vec<RemoteConfig>) -> Arc<ReplicationQueue> {
        let config = self.config(remotes);
        let store = Arc::new(TaskStore::open(&config.general.task_dir).unwrap());
        let queue = ReplicationQueue::new(config, store, Vec::new());
        queue.start().unwrap();
        queue
    }
}

fn commit_on(
    repo: &Repository,
    ref_name: &str,
    message: &str,
    parents: &[&git2::Commit<'_>],
) -> git2::Oid {
    let tree_oid = repo.treebuilder(None).unwrap().write().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = git2::Signature::now("test", "test@example.com").unwrap();
    repo.commit(Some(ref_name), &sig, &sig, message, &tree, parents)
        .unwrap()
}

fn resolved_ref(path: &Path, ref_name: &str) -> Option<git2::Oid> {
    let repo = Repository::open_bare(path).ok()?;
    repo.refname_to_id(ref_name).ok()
}

fn store_is_empty(queue: &ReplicationQueue) -> bool {
    queue.store().list_waiting().unwrap().is_empty()
        && queue.store().list_running().unwrap().is_empty()
}

#[test]
fn new_branch_replicates_to_two_remotes() {
    let site = Site::new();
    let master = site.init_project("proj");
    let replica1 = site.init_replica("foo1", "proj");
    let replica2 = site.init_replica("foo2", "proj");

    let queue = site.queue(vec![
        site.remote_config("foo1", 0),
        site.remote_config("foo2", 0),
    ]);

    let source = site.open_project("proj");
    let branch_oid = source.refname_to_id("refs/heads/master").unwrap();
    source
        .reference("refs/heads/mybranch", branch_oid, true, "test branch")
        .unwrap();
    drop(source);
    assert_eq!(branch_oid, master);

    queue.on_ref_updated("proj", "refs/heads/mybranch", "tester");

    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(
        resolved_ref(&replica1, "refs/heads/mybranch"),
        Some(branch_oid)
    );
    assert_eq!(
        resolved_ref(&replica2, "refs/heads/mybranch"),
        Some(branch_oid)
    );

    queue.stop();
}

#[test]
fn repush_of_unchanged_ref_succeeds() {
    let site = Site::new();
    let master = site.init_project("proj");
    let replica = site.init_replica("foo", "proj");
    let queue = site.queue(vec![site.remote_config("foo", 0)]);

    queue.on_ref_updated("proj", "refs/heads/master", "tester");
    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(resolved_ref(&replica, "refs/heads/master"), Some(master));

    // Same SHA again: a no-op push, classified as success.
    queue.on_ref_updated("proj", "refs/heads/master", "tester");
    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(resolved_ref(&replica, "refs/heads/master"), Some(master));

    queue.stop();
}

#[test]
fn superseded_ref_counts_as_replicated() {
    let site = Site::new();
    site.init_project("proj");
    let replica = site.init_replica("foo", "proj");
    let queue = site.queue(vec![site.remote_config("foo", 0)]);

    // The ref never existed on the primary: nothing to push, the task
    // still completes.
    queue.on_ref_updated("proj", "refs/heads/deleted-before-push", "tester");
    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(resolved_ref(&replica, "refs/heads/deleted-before-push"), None);

    queue.stop();
}

#[test]
fn crashed_run_replays_on_restart() {
    let site = Site::new();
    let master = site.init_project("proj");
    let replica = site.init_replica("foo", "proj");

    // Simulate the previous process dying mid-push: the task sits in
    // running with no worker attached.
    let uri = format!("file://{}/proj.git", site.replica_root("foo").display());
    let update = ReplicateRefUpdate::new("proj", "refs/heads/master", &uri, "foo");
    {
        let store = TaskStore::open(&site.dir.path().join("data")).unwrap();
        store.create(&update).unwrap();
        store.start(&UriUpdates::single(&update)).unwrap();
        assert_eq!(store.list_running().unwrap().len(), 1);
    }

    let queue = site.queue(vec![site.remote_config("foo", 0)]);
    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(resolved_ref(&replica, "refs/heads/master"), Some(master));

    queue.stop();
}

#[test]
fn non_fast_forward_without_force_is_permanent() {
    let site = Site::new();
    let master = site.init_project("proj");
    let replica = site.init_replica("foo", "proj");

    // The replica has diverged: an unrelated commit on master.
    let diverged = {
        let repo = Repository::open_bare(&replica).unwrap();
        commit_on(&repo, "refs/heads/master", "diverged", &[])
    };
    assert_ne!(master, diverged);

    let queue = site.queue(vec![site.remote_config("foo", 0)]);
    queue.on_ref_updated("proj", "refs/heads/master", "tester");

    // Permanent failure: the task is finished, not retried forever.
    assert!(wait_until(PUSH_TIMEOUT, || {
        store_is_empty(&queue) && !queue.is_replaying()
    }));
    assert_eq!(resolved_ref(&replica, "refs/heads/master"), Some(diverged));

    queue.stop();
}

#[test]
fn forced_remote_overwrites_diverged_replica() {
    let site = Site::new();
    let master = site.init_project("proj");
    let replica = site.init_replica("foo", "proj");
    {
        let repo = Repository::open_bare(&replica).unwrap();
        commit_on(&repo, "refs/heads/master", "diverged", &[]);
    }

    let remote = RemoteConfig {
        force_update: true,
        ..site.remote_config("foo", 0)
    };
    let queue = site.queue(vec![remote]);
    queue.on_ref_updated("proj", "refs/heads/master", "tester");

    assert!(wait_until(PUSH_TIMEOUT, || store_is_empty(&queue)));
    assert_eq!(resolved_ref(&replica, "refs/heads/master"), Some(master));

    queue.stop();
}

#[test]
fn project_lifecycle_through_local_admin() {
    let site = Site::new();
    site.init_project("proj");

    let admin_root = site.replica_root("foo");
    let remote = RemoteConfig {
        admin_url: vec![format!("file://{}/${{name}}.git", admin_root.display())],
        replicate_created_projects: true,
        replicate_deleted_projects: true,
        ..site.remote_config("foo", 0)
    };
    let queue = site.queue(vec![remote]);

    queue.on_project_created("proj", Some("refs/heads/main"));
    let replica = admin_root.join("proj.git");
    let repo = Repository::open_bare(&replica).unwrap();
    assert!(repo.is_bare());
    assert_eq!(
        repo.find_reference("HEAD").unwrap().symbolic_target(),
        Some("refs/heads/main")
    );
    drop(repo);

    queue.on_head_updated("proj", "refs/heads/other");
    let repo = Repository::open_bare(&replica).unwrap();
    assert_eq!(
        repo.find_reference("HEAD").unwrap().symbolic_target(),
        Some("refs/heads/other")
    );
    drop(repo);

    queue.on_project_deleted("proj");
    assert!(!replica.exists());

    queue.stop();
}
