//! Replication events for observers.
//!
//! Push workers emit one event per ref after each batch completes;
//! interested parties register a listener on the queue. Listeners are
//! infallible by signature, so a misbehaving observer cannot derail the
//! scheduler.

use std::sync::Arc;

/// Outcome of replicating one ref to one URI.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefPushStatus {
    Succeeded,
    /// Failed and will be retried.
    Deferred,
    /// Failed permanently (or exhausted its retry budget).
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefReplicatedEvent {
    pub project: String,
    pub ref_name: String,
    pub uri: String,
    pub remote: String,
    pub status: RefPushStatus,
}

pub trait ReplicationListener: Send + Sync {
    fn on_ref_replicated(&self, event: &RefReplicatedEvent);
}

/// Shared, immutable set of listeners handed to every destination.
pub type Listeners = Arc<Vec<Arc<dyn ReplicationListener>>>;

pub fn notify(listeners: &Listeners, event: &RefReplicatedEvent) {
    for listener in listeners.iter() {
        listener.on_ref_replicated(event);
    }
}

/// Default listener: structured log lines, nothing else.
pub struct LoggingListener;

impl ReplicationListener for LoggingListener {
    fn on_ref_replicated(&self, event: &RefReplicatedEvent) {
        match event.status {
            RefPushStatus::Succeeded => tracing::info!(
                project = %event.project,
                r#ref = %event.ref_name,
                uri = %event.uri,
                remote = %event.remote,
                "ref replicated"
            ),
            RefPushStatus::Deferred => tracing::warn!(
                project = %event.project,
                r#ref = %event.ref_name,
                uri = %event.uri,
                remote = %event.remote,
                "ref replication deferred"
            ),
            RefPushStatus::Failed => tracing::error!(
                project = %event.project,
                r#ref = %event.ref_name,
                uri = %event.uri,
                remote = %event.remote,
                "ref replication failed"
            ),
        }
    }
}
