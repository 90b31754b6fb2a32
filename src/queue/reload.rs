//! Config auto-reload controller.
//!
//! A single poller thread re-reads the config version fingerprint and,
//! when it changes, parses a new snapshot and hands it to the queue for a
//! drain-and-swap. A snapshot that fails to parse is remembered so the
//! same broken version is not re-parsed every cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config;
use crate::queue::ReplicationQueue;

pub struct AutoReloadRunnable {
    config_path: PathBuf,
    queue: Arc<ReplicationQueue>,
    loaded_version: String,
    last_failed_version: String,
}

impl AutoReloadRunnable {
    pub fn new(config_path: PathBuf, queue: Arc<ReplicationQueue>) -> Self {
        let loaded_version = queue.config().version.clone();
        Self {
            config_path,
            queue,
            loaded_version,
            last_failed_version: String::new(),
        }
    }

    /// One poll cycle: reload unless nothing changed, the change already
    /// failed to parse, or the queue is stopped or mid-replication.
    pub fn run_once(&mut self) {
        let pending_version = config::version(&self.config_path);
        if pending_version == self.loaded_version
            || pending_version == self.last_failed_version
            || !self.queue.is_running()
            || self.queue.is_replaying()
        {
            return;
        }
        self.reload(pending_version);
    }

    fn reload(&mut self, pending_version: String) {
        match config::load(&self.config_path) {
            Ok(snapshot) => {
                self.loaded_version = snapshot.version.clone();
                self.last_failed_version.clear();
                self.queue.replace_config(snapshot);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "cannot reload replication configuration: keeping existing settings"
                );
                self.last_failed_version = pending_version;
            }
        }
    }
}

/// Owns the poller thread; dropping or stopping cancels it.
pub struct AutoReloadHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AutoReloadHandle {
    /// Spawn the poller. `poll_interval` comes from the general config.
    pub fn spawn(
        config_path: PathBuf,
        queue: Arc<ReplicationQueue>,
        poll_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut runnable = AutoReloadRunnable::new(config_path, queue);
            while !stop_flag.load(Ordering::Relaxed) {
                runnable.run_once();
                std::thread::sleep(poll_interval);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AutoReloadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
