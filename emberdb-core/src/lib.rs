//! EmberDB Core — replication client
//!
//! This crate turns a freshly started EmberDB instance into a replica
//! of a designated master over the Redis-compatible wire protocol. It
//! owns the handshake, the full-state transfer in both master dialects,
//! the change-stream consumer with its ack policy, and the reconnect
//! state machine that ties them together.
//!
//! The storage engine stays behind the [`dispatch::CommandDispatcher`]
//! seam and the snapshot dump format behind [`snapshot::SnapshotLoader`];
//! the outer server drives everything through
//! [`controller::ReplicationController`].

pub mod config;
pub mod conn;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod replication;
pub mod resp;
pub mod snapshot;

pub use config::ReplicationConfig;
pub use controller::ReplicationController;
pub use dispatch::{CommandArgs, CommandDispatcher, DispatchContext, DispatchError};
pub use error::{ReplicaError, ReplicaResult};
pub use replication::{Dialect, MasterContext, Replica, ReplicaInfo, Stage};
pub use snapshot::{
    LoadStatus, SnapshotError, SnapshotLoader, SnapshotLoaderFactory, EOF_TOKEN_LEN,
};
