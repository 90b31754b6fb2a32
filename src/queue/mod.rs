//! Replication queue: event routing, destination lifecycle, reload.

pub mod destination;
pub mod reload;

pub use destination::{Destination, PushFn};
pub use reload::{AutoReloadHandle, AutoReloadRunnable};

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{FilterType, ReplicationConfig};
use crate::events::{Listeners, ReplicationListener};
use crate::git::admin::admin_for_uri;
use crate::store::{ReplicateRefUpdate, StoreError, TaskStore};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct QueueState {
    running: bool,
    config: Arc<ReplicationConfig>,
    destinations: Vec<Arc<Destination>>,
}

/// Process-wide replication control plane.
///
/// Receives ref-update and project lifecycle events, persists tasks, and
/// fans them out to per-remote destinations. Explicit lifecycle: nothing
/// replicates before [`ReplicationQueue::start`], which also recovers
/// whatever the previous run left behind.
pub struct ReplicationQueue {
    store: Arc<TaskStore>,
    listeners: Listeners,
    state: RwLock<QueueState>,
}

impl ReplicationQueue {
    pub fn new(
        config: ReplicationConfig,
        store: Arc<TaskStore>,
        listeners: Vec<Arc<dyn ReplicationListener>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            listeners: Arc::new(listeners),
            state: RwLock::new(QueueState {
                running: false,
                config: Arc::new(config),
                destinations: Vec::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> Arc<ReplicationConfig> {
        Arc::clone(&self.read().config)
    }

    /// Recover persisted work and start accepting events.
    ///
    /// Tasks found in running cannot actually be in flight, so everything
    /// is reset to waiting first, then replayed through the schedulers.
    pub fn start(&self) -> Result<(), StoreError> {
        let mut state = self.write();
        if state.running {
            return Ok(());
        }
        self.store.reset_all()?;
        state.destinations = build_destinations(&state.config, &self.store, &self.listeners);
        state.running = true;
        self.enqueue_waiting(&state);
        Ok(())
    }

    /// Stop accepting events and drain in-flight pushes. Scheduled and
    /// retrying work stays in the store for the next start.
    pub fn stop(&self) {
        let destinations = {
            let mut state = self.write();
            state.running = false;
            std::mem::take(&mut state.destinations)
        };
        for destination in &destinations {
            destination.shut_down();
        }
        for destination in &destinations {
            if !destination.drain(DRAIN_TIMEOUT) {
                tracing::warn!(remote = %destination.name(), "drain timed out, abandoning pushes");
            }
            destination.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.read().running
    }

    /// True while any destination still has in-flight or retrying pushes.
    pub fn is_replaying(&self) -> bool {
        self.read().destinations.iter().any(|d| d.is_replaying())
    }

    /// Entry point for the primary-side event source: a ref changed.
    ///
    /// Touches only the store and the schedulers; never the network.
    pub fn on_ref_updated(&self, project: &str, ref_name: &str, updater: &str) {
        let state = self.read();
        if !state.running {
            tracing::warn!(project, r#ref = ref_name, "queue stopped, dropping ref update");
            return;
        }
        tracing::debug!(project, r#ref = ref_name, updater, "ref update received");
        for destination in &state.destinations {
            if !destination.config().matches_project(project) {
                continue;
            }
            for uri in destination.config().uris_for(project) {
                let update = ReplicateRefUpdate::new(project, ref_name, &uri, destination.name());
                if let Err(e) = self.store.create(&update) {
                    tracing::error!(
                        project,
                        r#ref = ref_name,
                        uri,
                        error = %e,
                        "failed to persist task"
                    );
                    continue;
                }
                destination.schedule(project, &uri, ref_name, false);
            }
        }
    }

    /// Fan project creation out to the admin transports.
    pub fn on_project_created(&self, project: &str, head: Option<&str>) {
        self.for_each_admin(FilterType::ProjectCreation, project, |admin| {
            admin.create_project(project, head)
        });
    }

    /// Fan project deletion out to the admin transports.
    pub fn on_project_deleted(&self, project: &str) {
        self.for_each_admin(FilterType::ProjectDeletion, project, |admin| {
            admin.delete_project(project)
        });
    }

    /// Fan a HEAD change out to the admin transports.
    pub fn on_head_updated(&self, project: &str, new_head: &str) {
        let state = self.read();
        if !state.running {
            return;
        }
        for destination in &state.destinations {
            let config = destination.config();
            if !config.replicate_head_updates || !config.matches_project(project) {
                continue;
            }
            for uri in config.admin_uris_for(project) {
                if let Some(admin) = admin_for_uri(&uri)
                    && !admin.update_head(project, new_head)
                {
                    tracing::error!(remote = %destination.name(), uri, "updateHead failed");
                }
            }
        }
    }

    /// Schedule a full replication of every project matching `pattern`.
    ///
    /// Enumerates projects under the primary git directory, lists their
    /// refs and enqueues each one; `now` bypasses the batching delay.
    /// Returns the number of scheduled tasks.
    pub fn trigger_all(&self, pattern: Option<&str>, now: bool) -> usize {
        let state = self.read();
        if !state.running {
            return 0;
        }
        let mut scheduled = 0;
        for project in discover_projects(&state.config.general.git_dir) {
            if let Some(pattern) = pattern
                && !crate::config::pattern_matches(pattern, &project)
            {
                continue;
            }
            let refs = match list_refs(&state.config.general.git_dir, &project) {
                Ok(refs) => refs,
                Err(e) => {
                    tracing::warn!(project, error = %e, "cannot list refs, skipping project");
                    continue;
                }
            };
            for destination in &state.destinations {
                if !destination.config().matches_project(&project) {
                    continue;
                }
                for uri in destination.config().uris_for(&project) {
                    for ref_name in &refs {
                        let update =
                            ReplicateRefUpdate::new(&project, ref_name, &uri, destination.name());
                        if self.store.create(&update).is_ok()
                            && destination.schedule(&project, &uri, ref_name, now)
                        {
                            scheduled += 1;
                        }
                    }
                }
            }
        }
        scheduled
    }

    /// Resume destinations whose remote name matches `pattern`.
    pub fn resume_remotes(&self, pattern: Option<&str>) -> usize {
        let state = self.read();
        let mut count = 0;
        for destination in &state.destinations {
            if remote_name_matches(pattern, destination.name()) && !destination.is_running() {
                destination.resume();
                count += 1;
            }
        }
        count
    }

    /// Stop accepting work on destinations whose remote name matches
    /// `pattern`. In-flight pushes finish; nothing new dispatches.
    pub fn stop_remotes(&self, pattern: Option<&str>) -> usize {
        let state = self.read();
        let mut count = 0;
        for destination in &state.destinations {
            if remote_name_matches(pattern, destination.name()) && destination.is_running() {
                destination.shut_down();
                count += 1;
            }
        }
        count
    }

    /// Swap in a freshly parsed config: drain and destroy the current
    /// destinations, build new ones, replay persisted waiting work.
    pub fn replace_config(&self, config: ReplicationConfig) {
        let mut state = self.write();
        let old = std::mem::take(&mut state.destinations);
        for destination in &old {
            destination.shut_down();
        }
        for destination in &old {
            if !destination.drain(DRAIN_TIMEOUT) {
                tracing::warn!(remote = %destination.name(), "drain timed out during reload");
            }
            destination.join();
        }
        state.config = Arc::new(config);
        if state.running {
            state.destinations = build_destinations(&state.config, &self.store, &self.listeners);
            self.enqueue_waiting(&state);
        }
        tracing::info!(version = %state.config.version, "replication configuration reloaded");
    }

    fn for_each_admin<F>(&self, filter: FilterType, project: &str, op: F)
    where
        F: Fn(&dyn crate::git::AdminApi) -> bool,
    {
        let state = self.read();
        if !state.running {
            return;
        }
        let filtered: Vec<&str> = state
            .config
            .remotes(filter)
            .map(|r| r.name.as_str())
            .collect();
        for destination in &state.destinations {
            if !filtered.contains(&destination.name()) {
                continue;
            }
            if !destination.config().matches_project(project) {
                continue;
            }
            for uri in destination.config().admin_uris_for(project) {
                match admin_for_uri(&uri) {
                    Some(admin) => {
                        if !op(admin.as_ref()) {
                            tracing::error!(
                                remote = %destination.name(),
                                uri,
                                project,
                                "admin operation failed"
                            );
                        }
                    }
                    None => tracing::warn!(
                        remote = %destination.name(),
                        uri,
                        "skipping admin operation, unsupported scheme"
                    ),
                }
            }
        }
    }

    /// Replay persisted waiting tasks through the schedulers.
    fn enqueue_waiting(&self, state: &QueueState) {
        let waiting = match self.store.list_waiting() {
            Ok(waiting) => waiting,
            Err(e) => {
                tracing::error!(error = %e, "cannot list waiting tasks for replay");
                return;
            }
        };
        for task in waiting {
            let Some(destination) = state
                .destinations
                .iter()
                .find(|d| d.name() == task.remote)
            else {
                tracing::warn!(
                    remote = %task.remote,
                    project = %task.project,
                    r#ref = %task.ref_name,
                    "waiting task references an unconfigured remote, leaving in store"
                );
                continue;
            };
            destination.schedule(&task.project, &task.uri, &task.ref_name, false);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, QueueState> {
        self.state.read().expect("queue state poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, QueueState> {
        self.state.write().expect("queue state poisoned")
    }
}

fn build_destinations(
    config: &ReplicationConfig,
    store: &Arc<TaskStore>,
    listeners: &Listeners,
) -> Vec<Arc<Destination>> {
    config
        .remotes
        .iter()
        .map(|remote| {
            Destination::start(
                remote.clone(),
                config.general.git_dir.clone(),
                Arc::clone(store),
                Arc::clone(listeners),
            )
        })
        .collect()
}

/// ListCommand semantics: empty matches all, otherwise substring or whole
/// regex match against the remote name.
pub(crate) fn remote_name_matches(pattern: Option<&str>, name: &str) -> bool {
    match pattern {
        None | Some("") => true,
        Some(pattern) => {
            name.contains(pattern)
                || regex::Regex::new(&format!("^(?:{pattern})$"))
                    .map(|re| re.is_match(name))
                    .unwrap_or(false)
        }
    }
}

/// Bare repositories under `git_dir`, named by their relative path with
/// the `.git` suffix stripped.
fn discover_projects(git_dir: &Path) -> Vec<String> {
    let mut projects = Vec::new();
    walk_projects(git_dir, git_dir, &mut projects);
    projects.sort();
    projects
}

fn walk_projects(root: &Path, dir: &Path, projects: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "git") {
            if let Ok(rel) = path.strip_prefix(root) {
                let name = rel.to_string_lossy();
                projects.push(name.trim_end_matches(".git").to_string());
            }
            continue;
        }
        walk_projects(root, &path, projects);
    }
}

fn list_refs(git_dir: &Path, project: &str) -> Result<Vec<String>, git2::Error> {
    let path = crate::git::push::project_repo_path(git_dir, project);
    let repo = git2::Repository::open_bare(&path).or_else(|_| git2::Repository::open(&path))?;
    let mut refs = Vec::new();
    for reference in repo.references()? {
        let reference = reference?;
        if let Some(name) = reference.name()
            && name.starts_with("refs/")
        {
            refs.push(name.to_string());
        }
    }
    Ok(refs)
}
