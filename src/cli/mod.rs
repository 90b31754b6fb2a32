//! CLI surface.
//!
//! `run` hosts the engine; `list`, `start` and `stop` are thin clients of
//! the control socket. `list` also works without a running daemon by
//! reading the config directly, since it only prints configuration.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use crossbeam::channel::bounded;

use crate::config;
use crate::control::{self, ControlError, Request, Response, ResponsePayload};
use crate::events::LoggingListener;
use crate::queue::{AutoReloadHandle, ReplicationQueue};
use crate::store::TaskStore;

/// Exit code when the daemon control socket is unreachable.
pub const EXIT_DAEMON_UNAVAILABLE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "refmirror",
    version,
    about = "Mirrors git ref updates to configured remote destinations",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Main configuration file.
    #[arg(long, global = true, value_name = "PATH", default_value = "replication.toml")]
    pub config: PathBuf,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the replication engine.
    Run,

    /// List configured remote destinations.
    List {
        /// Pattern to match remote name on.
        #[arg(long, value_name = "PATTERN")]
        remote: Option<String>,
        /// Print remote destination detail information.
        #[arg(long)]
        detail: bool,
        /// Output in json format.
        #[arg(long)]
        json: bool,
    },

    /// Resume replication and schedule matching projects.
    Start {
        /// Bypass the per-remote batching delay.
        #[arg(long)]
        now: bool,
        /// Block until the scheduled pushes complete.
        #[arg(long)]
        wait: bool,
        /// Project pattern (default: all projects).
        pattern: Option<String>,
    },

    /// Stop accepting new replication work.
    Stop {
        /// Block until in-flight pushes complete.
        #[arg(long)]
        wait: bool,
        /// Remote-name pattern (default: all remotes).
        pattern: Option<String>,
    },
}

pub fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Run => run_daemon(&cli.config),
        Commands::List {
            remote,
            detail,
            json,
        } => run_list(&cli.config, remote.as_deref(), detail, json),
        Commands::Start { now, wait, pattern } => run_control(
            &cli.config,
            &Request::Start { pattern, now, wait },
        ),
        Commands::Stop { wait, pattern } => {
            run_control(&cli.config, &Request::Stop { pattern, wait })
        }
    }
}

fn run_daemon(config_path: &PathBuf) -> i32 {
    match try_run_daemon(config_path) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "replication engine failed");
            1
        }
    }
}

fn try_run_daemon(config_path: &PathBuf) -> crate::Result<()> {
    let config = config::load(config_path)?;
    let store = Arc::new(TaskStore::open(&config.general.task_dir)?);

    let task_dir = config.general.task_dir.clone();
    let auto_reload = config.general.auto_reload;
    let poll = std::time::Duration::from_secs(config.general.reload_poll_secs.max(1));

    let queue = ReplicationQueue::new(config, store, vec![Arc::new(LoggingListener)]);
    queue.start()?;

    let (shutdown_tx, shutdown_rx) = bounded(1);
    let control = match control::ControlServer::spawn(Arc::clone(&queue), &task_dir, shutdown_tx) {
        Ok(control) => control,
        Err(e) => {
            queue.stop();
            return Err(e.into());
        }
    };

    let reload = auto_reload
        .then(|| AutoReloadHandle::spawn(config_path.clone(), Arc::clone(&queue), poll));

    tracing::info!("replication engine started");
    let _ = shutdown_rx.recv();
    tracing::info!("shutting down");

    if let Some(reload) = reload {
        reload.stop();
    }
    control.stop();
    queue.stop();
    Ok(())
}

fn run_list(config_path: &PathBuf, pattern: Option<&str>, detail: bool, json: bool) -> i32 {
    // Prefer the daemon's live snapshot, fall back to the file.
    let infos = match daemon_list(config_path, pattern, detail) {
        Some(infos) => infos,
        None => match config::load(config_path) {
            Ok(config) => control::remote_infos(&config, pattern, detail),
            Err(e) => {
                eprintln!("cannot load configuration: {e}");
                return 1;
            }
        },
    };

    for info in infos {
        if json {
            match serde_json::to_string(&info) {
                Ok(line) => println!("{line}"),
                Err(e) => {
                    eprintln!("cannot render remote: {e}");
                    return 1;
                }
            }
        } else {
            println!("Remote: {}", info.remote);
            for url in &info.url {
                println!("Url: {url}");
            }
            for admin_url in &info.admin_url {
                println!("AdminUrl: {admin_url}");
            }
            for auth_group in &info.auth_group {
                println!("AuthGroup: {auth_group}");
            }
            for project in &info.project {
                println!("Project: {project}");
            }
            println!();
        }
    }
    0
}

fn daemon_list(
    config_path: &PathBuf,
    pattern: Option<&str>,
    detail: bool,
) -> Option<Vec<control::RemoteInfo>> {
    let task_dir = config::load(config_path).ok()?.general.task_dir;
    let request = Request::List {
        remote: pattern.map(str::to_string),
        detail,
    };
    match control::request(&task_dir, &request) {
        Ok(Response::Ok(ResponsePayload::Remotes(infos))) => Some(infos),
        _ => None,
    }
}

fn run_control(config_path: &PathBuf, request: &Request) -> i32 {
    let config = match config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load configuration: {e}");
            return 1;
        }
    };
    match control::request(&config.general.task_dir, request) {
        Ok(Response::Ok(payload)) => {
            match payload {
                ResponsePayload::Started { scheduled, resumed } => {
                    println!("scheduled {scheduled} tasks on {resumed} resumed remotes");
                }
                ResponsePayload::Stopped { stopped } => {
                    println!("stopped {stopped} remotes");
                }
                other => {
                    if let Ok(line) = serde_json::to_string(&other) {
                        println!("{line}");
                    }
                }
            }
            0
        }
        Ok(Response::Err(message)) => {
            eprintln!("{message}");
            1
        }
        Err(ControlError::Unreachable { path, .. }) => {
            eprintln!("replication daemon is not running (no socket at {})", path.display());
            EXIT_DAEMON_UNAVAILABLE
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
