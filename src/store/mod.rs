//! Persistent replication task store.
//!
//! Every pending ref update is one small JSON file named by its task key.
//! The file lives in `waiting/` until a push picks it up, in `running/`
//! while the push is in flight, and is unlinked on completion. Atomic
//! rename is the concurrency primitive: two directories, one rename per
//! state transition, no cross-key locking.
//!
//! Layout under the store root:
//!
//! ```text
//! ref-updates/
//!   waiting/<key>     JSON {project, ref, uri, remote}
//!   running/<key>     same schema, present while a push is in flight
//!   tmp/              staging for atomic-rename creates
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const REF_UPDATES_DIR: &str = "ref-updates";
const WAITING_DIR: &str = "waiting";
const RUNNING_DIR: &str = "running";
const TMP_DIR: &str = "tmp";

/// One unit of replication work: push `ref` of `project` to `uri`.
///
/// The record is immutable; its identity is [`ReplicateRefUpdate::key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicateRefUpdate {
    pub project: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub uri: String,
    pub remote: String,
}

impl ReplicateRefUpdate {
    pub fn new(
        project: impl Into<String>,
        ref_name: impl Into<String>,
        uri: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            ref_name: ref_name.into(),
            uri: uri.into(),
            remote: remote.into(),
        }
    }

    /// Stable key over the four identity fields. Used for dedup and as the
    /// on-disk file name.
    pub fn key(&self) -> TaskKey {
        let mut hasher = Sha256::new();
        hasher.update(self.project.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.ref_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.uri.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.remote.as_bytes());
        TaskKey(hex::encode(hasher.finalize()))
    }
}

/// Hex digest naming a task in the store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskKey({})", &self.0[..12.min(self.0.len())])
    }
}

/// An in-memory batch of tasks sharing one `(remote, uri)` pair.
///
/// Produced by the scheduler when it coalesces pending refs for a single
/// destination URI. Each underlying task keeps its own identity in the
/// store; the batch exists only for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriUpdates {
    pub project: String,
    pub remote: String,
    pub uri: String,
    pub refs: BTreeSet<String>,
}

impl UriUpdates {
    pub fn single(update: &ReplicateRefUpdate) -> Self {
        Self {
            project: update.project.clone(),
            remote: update.remote.clone(),
            uri: update.uri.clone(),
            refs: BTreeSet::from([update.ref_name.clone()]),
        }
    }

    /// The per-ref task records this batch covers.
    pub fn ref_updates(&self) -> impl Iterator<Item = ReplicateRefUpdate> + '_ {
        self.refs.iter().map(|r| {
            ReplicateRefUpdate::new(
                self.project.clone(),
                r.clone(),
                self.uri.clone(),
                self.remote.clone(),
            )
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write task {key}: {source}")]
    Write {
        key: TaskKey,
        #[source]
        source: io::Error,
    },

    #[error("failed to move task {key}: {source}")]
    Rename {
        key: TaskKey,
        #[source]
        source: io::Error,
    },

    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Crash-safe index of waiting and running replication tasks.
///
/// Safe for concurrent use from multiple threads and multiple processes
/// sharing one directory: every mutation is a single atomic rename or
/// unlink, and a file missing at mutation time means another actor already
/// performed the transition, which is success.
pub struct TaskStore {
    waiting: PathBuf,
    running: PathBuf,
    tmp: PathBuf,
}

impl TaskStore {
    /// Open (creating if needed) the store rooted at `data_dir/ref-updates`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let root = data_dir.join(REF_UPDATES_DIR);
        let store = Self {
            waiting: root.join(WAITING_DIR),
            running: root.join(RUNNING_DIR),
            tmp: root.join(TMP_DIR),
        };
        for dir in [&store.waiting, &store.running, &store.tmp] {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(store)
    }

    /// Persist a new waiting task, deduplicating on the task key.
    ///
    /// If a task with the same key already exists in either state the
    /// existing key is returned and nothing is written.
    pub fn create(&self, update: &ReplicateRefUpdate) -> Result<TaskKey, StoreError> {
        let key = update.key();
        if self.waiting.join(key.as_str()).exists() || self.running.join(key.as_str()).exists() {
            return Ok(key);
        }

        let temp = tempfile::NamedTempFile::new_in(&self.tmp).map_err(|source| {
            StoreError::Write {
                key: key.clone(),
                source,
            }
        })?;
        serde_json::to_writer(temp.as_file(), update).map_err(|source| StoreError::Write {
            key: key.clone(),
            source: source.into(),
        })?;
        temp.persist(self.waiting.join(key.as_str()))
            .map_err(|e| StoreError::Write {
                key: key.clone(),
                source: e.error,
            })?;
        Ok(key)
    }

    /// Move every task in the batch from waiting to running.
    pub fn start(&self, updates: &UriUpdates) -> Result<(), StoreError> {
        for update in updates.ref_updates() {
            self.transition(&update.key(), &self.waiting, &self.running)?;
        }
        Ok(())
    }

    /// Remove every task in the batch from running. Finishing a task that
    /// was never started, or finishing twice, is a no-op.
    pub fn finish(&self, updates: &UriUpdates) -> Result<(), StoreError> {
        for update in updates.ref_updates() {
            let key = update.key();
            match fs::remove_file(self.running.join(key.as_str())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Rename { key, source }),
            }
        }
        Ok(())
    }

    /// Move every task in the batch back from running to waiting.
    pub fn reset(&self, updates: &UriUpdates) -> Result<(), StoreError> {
        for update in updates.ref_updates() {
            self.transition(&update.key(), &self.running, &self.waiting)?;
        }
        Ok(())
    }

    /// Move every running task back to waiting and sweep stale temp files.
    ///
    /// Called at process start before any worker runs: a task found in
    /// running cannot actually be in flight, it is a leftover of a crash.
    pub fn reset_all(&self) -> Result<(), StoreError> {
        for entry in self.read_dir(&self.running)? {
            let name = entry.file_name();
            match fs::rename(&entry.path(), self.waiting.join(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    tracing::error!(
                        task = %name.to_string_lossy(),
                        error = %source,
                        "failed to reset running task"
                    );
                }
            }
        }
        for entry in self.read_dir(&self.tmp)? {
            let _ = fs::remove_file(entry.path());
        }
        Ok(())
    }

    pub fn list_waiting(&self) -> Result<Vec<ReplicateRefUpdate>, StoreError> {
        self.list(&self.waiting)
    }

    pub fn list_running(&self) -> Result<Vec<ReplicateRefUpdate>, StoreError> {
        self.list(&self.running)
    }

    fn transition(&self, key: &TaskKey, from: &Path, to: &Path) -> Result<(), StoreError> {
        match fs::rename(from.join(key.as_str()), to.join(key.as_str())) {
            Ok(()) => Ok(()),
            // Another actor already moved or finished this task.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Rename {
                key: key.clone(),
                source,
            }),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<ReplicateRefUpdate>, StoreError> {
        let mut out = Vec::new();
        for entry in self.read_dir(dir)? {
            let path = entry.path();
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Unlinked by a concurrent finish mid-scan.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::List {
                        path: dir.to_path_buf(),
                        source,
                    });
                }
            };
            match serde_json::from_slice::<ReplicateRefUpdate>(&bytes) {
                Ok(update) => out.push(update),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unparsable task file"
                    );
                }
            }
        }
        Ok(out)
    }

    fn read_dir(&self, dir: &Path) -> Result<Vec<fs::DirEntry>, StoreError> {
        let iter = fs::read_dir(dir).map_err(|source| StoreError::List {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut entries = Vec::new();
        for entry in iter {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::List {
                        path: dir.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Ok(entries)
    }
}
