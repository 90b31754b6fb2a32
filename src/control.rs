//! Control socket for the administrative commands.
//!
//! Protocol: newline-delimited JSON over a Unix socket at
//! `<task_dir>/control.sock`. One request per connection.
//!
//! Request format: `{"op": "list", ...}\n`
//! Response format: `{"ok": ...}\n` or `{"err": "..."}\n`

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{FilterType, ReplicationConfig};
use crate::queue::{ReplicationQueue, remote_name_matches};

pub const SOCKET_NAME: &str = "control.sock";

/// How long `--wait` blocks before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Print configured destinations.
    List {
        #[serde(default)]
        remote: Option<String>,
        #[serde(default)]
        detail: bool,
    },
    /// Resume destinations and trigger replication of matching projects.
    Start {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        now: bool,
        #[serde(default)]
        wait: bool,
    },
    /// Stop destinations matching a remote-name pattern.
    Stop {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        wait: bool,
    },
    Status,
    /// Drain the queue and exit the daemon.
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponsePayload),
    #[serde(rename = "err")]
    Err(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Remotes(Vec<RemoteInfo>),
    Started { scheduled: usize, resumed: usize },
    Stopped { stopped: usize },
    Status(StatusInfo),
    ShuttingDown,
}

/// One destination as shown by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub remote: String,
    #[serde(rename = "Url")]
    pub url: Vec<String>,
    #[serde(rename = "AdminUrl", default, skip_serializing_if = "Vec::is_empty")]
    pub admin_url: Vec<String>,
    #[serde(rename = "AuthGroup", default, skip_serializing_if = "Vec::is_empty")]
    pub auth_group: Vec<String>,
    #[serde(rename = "Project", default, skip_serializing_if = "Vec::is_empty")]
    pub project: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusInfo {
    pub running: bool,
    pub replaying: bool,
    pub waiting_tasks: usize,
    pub running_tasks: usize,
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("cannot bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon unreachable at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Destination rows for `list`, filtered and trimmed like the original
/// list command: detail off hides admin URLs, auth groups and patterns.
pub fn remote_infos(
    config: &ReplicationConfig,
    pattern: Option<&str>,
    detail: bool,
) -> Vec<RemoteInfo> {
    config
        .remotes(FilterType::All)
        .filter(|r| remote_name_matches(pattern, &r.name))
        .map(|r| RemoteInfo {
            remote: r.name.clone(),
            url: r.url.clone(),
            admin_url: if detail { r.admin_url.clone() } else { Vec::new() },
            auth_group: if detail { r.auth_group.clone() } else { Vec::new() },
            project: if detail { r.projects.clone() } else { Vec::new() },
        })
        .collect()
}

/// Accept-loop thread serving control requests for a running queue.
pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn spawn(
        queue: Arc<ReplicationQueue>,
        socket_dir: &Path,
        shutdown_tx: Sender<()>,
    ) -> Result<Self, ControlError> {
        let path = socket_dir.join(SOCKET_NAME);
        // A leftover socket from a dead daemon would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|source| ControlError::Bind {
            path: path.clone(),
            source,
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "control accept failed");
                        continue;
                    }
                };
                let queue = Arc::clone(&queue);
                let shutdown_tx = shutdown_tx.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, &queue, &shutdown_tx) {
                        tracing::warn!(error = %e, "control connection failed");
                    }
                });
            }
        });

        Ok(Self {
            path,
            stop: Arc::clone(&stop),
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock the accept loop.
        let _ = UnixStream::connect(&self.path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection(
    stream: UnixStream,
    queue: &ReplicationQueue,
    shutdown_tx: &Sender<()>,
) -> Result<(), ControlError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => handle_request(queue, request, shutdown_tx),
        Err(e) => Response::Err(format!("malformed request: {e}")),
    };

    let mut stream = stream;
    serde_json::to_writer(&mut stream, &response)?;
    stream.write_all(b"\n")?;
    Ok(())
}

fn handle_request(
    queue: &ReplicationQueue,
    request: Request,
    shutdown_tx: &Sender<()>,
) -> Response {
    match request {
        Request::List { remote, detail } => {
            let config = queue.config();
            Response::Ok(ResponsePayload::Remotes(remote_infos(
                &config,
                remote.as_deref(),
                detail,
            )))
        }
        Request::Start { pattern, now, wait } => {
            let resumed = queue.resume_remotes(None);
            let scheduled = queue.trigger_all(pattern.as_deref(), now);
            if wait {
                wait_until_quiet(queue);
            }
            Response::Ok(ResponsePayload::Started { scheduled, resumed })
        }
        Request::Stop { pattern, wait } => {
            let stopped = queue.stop_remotes(pattern.as_deref());
            if wait {
                wait_until_quiet(queue);
            }
            Response::Ok(ResponsePayload::Stopped { stopped })
        }
        Request::Status => Response::Ok(ResponsePayload::Status(status(queue))),
        Request::Shutdown => {
            let _ = shutdown_tx.send(());
            Response::Ok(ResponsePayload::ShuttingDown)
        }
    }
}

fn status(queue: &ReplicationQueue) -> StatusInfo {
    StatusInfo {
        running: queue.is_running(),
        replaying: queue.is_replaying(),
        waiting_tasks: queue.store().list_waiting().map(|t| t.len()).unwrap_or(0),
        running_tasks: queue.store().list_running().map(|t| t.len()).unwrap_or(0),
    }
}

fn wait_until_quiet(queue: &ReplicationQueue) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    // Give zero-delay timers a chance to fire before the first check.
    std::thread::sleep(Duration::from_millis(50));
    while queue.is_replaying() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Send one request to a running daemon and read its response.
pub fn request(socket_dir: &Path, request: &Request) -> Result<Response, ControlError> {
    let path = socket_dir.join(SOCKET_NAME);
    let mut stream = UnixStream::connect(&path).map_err(|source| ControlError::Unreachable {
        path: path.clone(),
        source,
    })?;
    serde_json::to_writer(&mut stream, request)?;
    stream.write_all(b"\n")?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(serde_json::from_str(&line)?)
}
