//! Replication configuration.
//!
//! One main file (`replication.toml`) plus optional per-remote fragments
//! under `replication.d/*.toml`. A parsed snapshot is immutable and
//! carries a version fingerprint derived from every contributing file, so
//! the reload controller can detect changes without re-parsing.

mod load;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use load::{ConfigError, load, version};

/// Which destinations an operation fans out to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FilterType {
    /// Ref updates: every destination.
    All,
    /// Destinations that replicate project creation.
    ProjectCreation,
    /// Destinations that replicate project deletion.
    ProjectDeletion,
}

/// Immutable snapshot of the whole replication setup.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub general: GeneralConfig,
    pub remotes: Vec<RemoteConfig>,
    /// Fingerprint over the contents and mtimes of every config file that
    /// contributed to this snapshot.
    pub version: String,
}

impl ReplicationConfig {
    /// Destinations participating in operations of the given kind.
    pub fn remotes(&self, filter: FilterType) -> impl Iterator<Item = &RemoteConfig> {
        self.remotes.iter().filter(move |r| match filter {
            FilterType::All => true,
            FilterType::ProjectCreation => r.replicate_created_projects,
            FilterType::ProjectDeletion => r.replicate_deleted_projects,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Base directory holding the primary site's bare repositories
    /// (`<git_dir>/<project>.git`).
    pub git_dir: PathBuf,
    /// Directory for persistent engine state (the task store).
    pub task_dir: PathBuf,
    /// Re-read the config files periodically and swap destinations when
    /// the version fingerprint changes.
    pub auto_reload: bool,
    /// Poll interval for auto-reload, in seconds.
    pub reload_poll_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            git_dir: PathBuf::from("git"),
            task_dir: PathBuf::from("data/refmirror"),
            auto_reload: false,
            reload_poll_secs: 1,
        }
    }
}

/// One configured destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub name: String,
    /// Destination URL templates; `${name}` is substituted per project.
    pub url: Vec<String>,
    /// Admin transport URL templates for project lifecycle operations.
    pub admin_url: Vec<String>,
    /// Project name patterns to include: exact, trailing-`*` prefix, or
    /// `^`-anchored regex. Empty means all projects.
    pub projects: Vec<String>,
    /// Access-control group names, surfaced through `list --detail`.
    pub auth_group: Vec<String>,
    /// Seconds to batch coalesce before dispatching a push.
    pub replication_delay: u64,
    /// Max transient retries per task.
    pub replication_retry: u32,
    /// Seconds between transient retries.
    pub retry_delay: u64,
    /// Worker-pool size for this destination.
    pub threads: usize,
    /// Prefix refspecs with `+`, allowing non-fast-forward updates.
    pub force_update: bool,
    pub replicate_created_projects: bool,
    pub replicate_deleted_projects: bool,
    pub replicate_head_updates: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: Vec::new(),
            admin_url: Vec::new(),
            projects: Vec::new(),
            auth_group: Vec::new(),
            replication_delay: 15,
            replication_retry: 3,
            retry_delay: 60,
            threads: 1,
            force_update: false,
            replicate_created_projects: false,
            replicate_deleted_projects: false,
            replicate_head_updates: true,
        }
    }
}

impl RemoteConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.replication_delay)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    /// Whether this destination replicates the given project.
    pub fn matches_project(&self, project: &str) -> bool {
        if self.projects.is_empty() {
            return true;
        }
        self.projects.iter().any(|p| pattern_matches(p, project))
    }

    /// Destination URIs for a project, one per URL template.
    pub fn uris_for(&self, project: &str) -> Vec<String> {
        self.url
            .iter()
            .map(|template| expand_template(template, project))
            .collect()
    }

    /// Admin URIs for a project, one per admin URL template.
    pub fn admin_uris_for(&self, project: &str) -> Vec<String> {
        self.admin_url
            .iter()
            .map(|template| expand_template(template, project))
            .collect()
    }
}

fn expand_template(template: &str, project: &str) -> String {
    template.replace("${name}", project)
}

/// Project pattern semantics: `^`-anchored patterns are regexes, a
/// trailing `*` makes a prefix match, anything else matches exactly.
pub(crate) fn pattern_matches(pattern: &str, project: &str) -> bool {
    if pattern.starts_with('^') {
        match regex::Regex::new(pattern) {
            Ok(re) => re.is_match(project),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid project regex");
                false
            }
        }
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        project.starts_with(prefix)
    } else {
        pattern == project
    }
}
