#![forbid(unsafe_code)]

//! refmirror - mirrors git ref updates from a primary site to a set of
//! configured remote destinations.
//!
//! The moving parts:
//! - [`store::TaskStore`] - crash-safe on-disk index of pending work
//! - [`queue::ReplicationQueue`] - routes ref-update events into per-remote
//!   destinations, batches them, and drives the worker pools
//! - [`git::push`] - executes a single batched push over git2
//! - [`queue::reload`] - watches the config files and swaps destinations
//!   when the on-disk version changes

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod git;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use config::{GeneralConfig, RemoteConfig, ReplicationConfig};
pub use events::{RefPushStatus, RefReplicatedEvent, ReplicationListener};
pub use queue::ReplicationQueue;
pub use store::{ReplicateRefUpdate, TaskKey, TaskStore, UriUpdates};
