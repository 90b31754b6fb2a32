//! Destination push worker.
//!
//! Executes one batched push: open the primary repository, build a
//! refspec per pending ref, push over an anonymous git2 remote, collect
//! per-ref rejections, classify the outcome.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::{ErrorClass, Repository};
use thiserror::Error;

use crate::error::Transience;
use crate::store::UriUpdates;

/// Result of one batched push, already classified.
#[derive(Debug)]
pub enum PushOutcome {
    /// Every refspec was accepted (or had nothing left to push).
    Success,
    /// Worth retrying within the destination's budget.
    Transient(PushError),
    /// Retrying cannot help.
    Permanent(PushError),
}

#[derive(Error, Debug)]
pub enum PushError {
    #[error("failed to open primary repository at {0}: {1}")]
    OpenSource(PathBuf, #[source] git2::Error),

    #[error("failed to connect to {uri}: {source}")]
    Remote {
        uri: String,
        #[source]
        source: git2::Error,
    },

    #[error("push to {uri} failed: {source}")]
    Push {
        uri: String,
        #[source]
        source: git2::Error,
    },

    #[error("remote rejected {ref_name}: {message}")]
    Rejected { ref_name: String, message: String },
}

impl PushError {
    /// Whether retrying this push may succeed.
    pub fn transience(&self) -> Transience {
        match self {
            // Opening the local repository does not touch the network; a
            // failure here means the project is gone or unreadable.
            PushError::OpenSource(_, _) => Transience::Permanent,

            PushError::Remote { source, .. } | PushError::Push { source, .. } => {
                match source.class() {
                    ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http | ErrorClass::Os => {
                        Transience::Retryable
                    }
                    _ => Transience::Permanent,
                }
            }

            PushError::Rejected { message, .. } => {
                if is_lock_contention(message) {
                    Transience::Retryable
                } else {
                    Transience::Permanent
                }
            }
        }
    }
}

fn is_lock_contention(message: &str) -> bool {
    message.contains("cannot lock ref")
        || message.contains("failed to lock")
        || message.contains("unable to lock")
}

fn is_non_fast_forward(message: &str) -> bool {
    message.contains("non-fast-forward") || message.contains("fetch first")
}

/// Push every pending ref of the batch to its URI.
///
/// A ref whose source object no longer exists locally is skipped and
/// counted as replicated: the engine mirrors the current truth of the
/// primary, not historical objects. Re-pushing a ref already at the
/// target SHA is a successful no-op at the transport level.
pub fn push_batch(git_dir: &Path, updates: &UriUpdates, force: bool) -> PushOutcome {
    match try_push(git_dir, updates, force) {
        Ok(()) => PushOutcome::Success,
        Err(e) => match e.transience() {
            Transience::Retryable => PushOutcome::Transient(e),
            Transience::Permanent => PushOutcome::Permanent(e),
        },
    }
}

fn try_push(git_dir: &Path, updates: &UriUpdates, force: bool) -> Result<(), PushError> {
    let repo_path = project_repo_path(git_dir, &updates.project);
    let repo = Repository::open_bare(&repo_path)
        .or_else(|_| Repository::open(&repo_path))
        .map_err(|e| PushError::OpenSource(repo_path.clone(), e))?;

    let mut refspecs = Vec::new();
    for ref_name in &updates.refs {
        if repo.refname_to_id(ref_name).is_err() {
            tracing::debug!(
                project = %updates.project,
                r#ref = %ref_name,
                "source ref gone, treating as replicated"
            );
            continue;
        }
        if force {
            refspecs.push(format!("+{ref_name}:{ref_name}"));
        } else {
            refspecs.push(format!("{ref_name}:{ref_name}"));
        }
    }
    if refspecs.is_empty() {
        return Ok(());
    }

    let mut remote = repo
        .remote_anonymous(&updates.uri)
        .map_err(|source| PushError::Remote {
            uri: updates.uri.clone(),
            source,
        })?;

    let rejection: RefCell<Option<(String, String)>> = RefCell::new(None);
    {
        let cfg = repo.config().ok();
        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            if allowed.is_ssh_key()
                && let Some(user) = username_from_url
            {
                return git2::Cred::ssh_key_from_agent(user);
            }
            if allowed.is_user_pass_plaintext()
                && let Some(ref cfg) = cfg
                && let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url)
            {
                return Ok(cred);
            }
            git2::Cred::default()
        });
        callbacks.push_update_reference(|ref_name, status| {
            if let Some(msg) = status
                && rejection.borrow().is_none()
            {
                *rejection.borrow_mut() = Some((ref_name.to_string(), msg.to_string()));
            }
            Ok(())
        });

        let mut options = git2::PushOptions::new();
        options.remote_callbacks(callbacks);

        let specs: Vec<&str> = refspecs.iter().map(String::as_str).collect();
        remote
            .push(&specs, Some(&mut options))
            .map_err(|source| classify_push_error(&updates.uri, source, force))?;
    }

    if let Some((ref_name, message)) = rejection.into_inner() {
        return Err(PushError::Rejected { ref_name, message });
    }

    Ok(())
}

/// Some servers report per-ref failures only through the transport error.
fn classify_push_error(uri: &str, source: git2::Error, force: bool) -> PushError {
    let message = source.message().to_string();
    if is_non_fast_forward(&message) && !force {
        return PushError::Rejected {
            ref_name: String::new(),
            message,
        };
    }
    PushError::Push {
        uri: uri.to_string(),
        source,
    }
}

/// Primary repositories live at `<git_dir>/<project>.git`, falling back to
/// `<git_dir>/<project>` for sites that keep undecorated directories.
pub fn project_repo_path(git_dir: &Path, project: &str) -> PathBuf {
    let decorated = git_dir.join(format!("{project}.git"));
    if decorated.exists() {
        return decorated;
    }
    let plain = git_dir.join(project);
    if plain.exists() { plain } else { decorated }
}
