//! Admin transports for remote project lifecycle.
//!
//! Selected per admin-URL scheme: `file://` manages bare repositories on a
//! locally mounted path, `ssh://` runs the equivalent shell commands on
//! the remote host. Every operation is best-effort: failures are logged
//! and reported as `false`, never raised.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::Repository;

/// Project lifecycle operations against one admin URI.
pub trait AdminApi: Send {
    fn create_project(&self, project: &str, head: Option<&str>) -> bool;
    fn delete_project(&self, project: &str) -> bool;
    fn update_head(&self, project: &str, new_head: &str) -> bool;
}

/// Pick an admin back-end for an expanded admin URI.
pub fn admin_for_uri(uri: &str) -> Option<Box<dyn AdminApi>> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(Box::new(LocalFs::new(PathBuf::from(path))));
    }
    if uri.starts_with("ssh://") {
        return SshAdmin::parse(uri).map(|a| Box::new(a) as Box<dyn AdminApi>);
    }
    tracing::warn!(uri, "no admin transport for scheme");
    None
}

/// Admin back-end for repositories reachable through the filesystem.
pub struct LocalFs {
    path: PathBuf,
}

impl LocalFs {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn link_head(repo: &Repository, head: &str) -> Result<(), git2::Error> {
        repo.reference_symbolic("HEAD", head, true, "refmirror admin")?;
        Ok(())
    }
}

impl AdminApi for LocalFs {
    fn create_project(&self, project: &str, head: Option<&str>) -> bool {
        let result = Repository::init_opts(
            &self.path,
            git2::RepositoryInitOptions::new().bare(true),
        )
        .and_then(|repo| {
            if let Some(head) = head
                && head.starts_with("refs/")
            {
                Self::link_head(&repo, head)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                tracing::info!(project, path = %self.path.display(), "created local repository");
                true
            }
            Err(e) => {
                tracing::error!(
                    project,
                    path = %self.path.display(),
                    error = %e,
                    "error creating local repository"
                );
                false
            }
        }
    }

    fn delete_project(&self, project: &str) -> bool {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::info!(project, path = %self.path.display(), "deleted local repository");
                true
            }
            Err(e) => {
                tracing::error!(
                    project,
                    path = %self.path.display(),
                    error = %e,
                    "error deleting local repository"
                );
                false
            }
        }
    }

    fn update_head(&self, project: &str, new_head: &str) -> bool {
        let result = Repository::open_bare(&self.path)
            .or_else(|_| Repository::open(&self.path))
            .and_then(|repo| Self::link_head(&repo, new_head));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    project,
                    path = %self.path.display(),
                    head = new_head,
                    error = %e,
                    "failed to update HEAD of repository"
                );
                false
            }
        }
    }
}

/// Admin back-end that shells the lifecycle commands to the remote host.
pub struct SshAdmin {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    path: String,
}

impl SshAdmin {
    /// Parse `ssh://[user@]host[:port]/path`.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("ssh://")?;
        let (authority, path) = rest.split_once('/')?;
        if path.is_empty() {
            return None;
        }
        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().ok()),
            None => (host_port.to_string(), None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host,
            user,
            port,
            path: format!("/{path}"),
        })
    }

    fn run(&self, command: &str) -> bool {
        let mut ssh = Command::new("ssh");
        if let Some(port) = self.port {
            ssh.arg("-p").arg(port.to_string());
        }
        match &self.user {
            Some(user) => ssh.arg(format!("{user}@{}", self.host)),
            None => ssh.arg(&self.host),
        };
        ssh.arg(command);
        match ssh.output() {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                tracing::error!(
                    host = %self.host,
                    command,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "remote admin command failed"
                );
                false
            }
            Err(e) => {
                tracing::error!(host = %self.host, command, error = %e, "failed to run ssh");
                false
            }
        }
    }

    fn quoted_path(&self) -> String {
        quote(&self.path)
    }
}

impl AdminApi for SshAdmin {
    fn create_project(&self, project: &str, head: Option<&str>) -> bool {
        let quoted = self.quoted_path();
        let mut command = format!("mkdir -p {quoted} && cd {quoted} && git init --bare");
        if let Some(head) = head
            && head.starts_with("refs/")
        {
            command.push_str(&format!(" && git symbolic-ref HEAD {}", quote(head)));
        }
        let ok = self.run(&command);
        if ok {
            tracing::info!(project, host = %self.host, path = %self.path, "created remote repository");
        }
        ok
    }

    fn delete_project(&self, project: &str) -> bool {
        let ok = self.run(&format!("rm -rf {}", self.quoted_path()));
        if ok {
            tracing::info!(project, host = %self.host, path = %self.path, "deleted remote repository");
        }
        ok
    }

    fn update_head(&self, _project: &str, new_head: &str) -> bool {
        self.run(&format!(
            "cd {} && git symbolic-ref HEAD {}",
            self.quoted_path(),
            quote(new_head)
        ))
    }
}

/// Single-quote a shell argument for the remote side.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
