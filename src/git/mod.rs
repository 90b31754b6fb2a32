//! Git transport: the wire-level push and the admin back-ends.

pub mod admin;
pub mod push;

pub use admin::{AdminApi, LocalFs, SshAdmin, admin_for_uri};
pub use push::{PushError, PushOutcome, push_batch};
