//! Replication error taxonomy
//!
//! Every I/O call in the replication core returns one of these kinds.
//! Components return early on the first error; only the supervisor
//! inspects the kind to decide between retry and terminate.

use thiserror::Error;

/// Errors surfaced by the replication client core
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Host name did not resolve to any address
    #[error("could not resolve master host {host}: {reason}")]
    DnsUnresolved { host: String, reason: String },

    /// TCP connect to the master endpoint failed
    #[error("could not connect to master: {0}")]
    ConnectRefused(std::io::Error),

    /// The peer closed the connection, or the link was shut down locally
    #[error("connection to master closed")]
    ConnClosed,

    /// Protocol framing violation or unexpected reply shape
    #[error("bad message from master: {0}")]
    BadMessage(String),

    /// Snapshot transfer failed or the EOF sentinel did not match
    #[error("full sync failed: {0}")]
    SyncFailed(String),

    /// Internal invariant violation; not retriable
    #[error("fatal replication error: {0}")]
    Fatal(String),
}

impl ReplicaError {
    /// Classify a transport error observed while reading or writing an
    /// established connection. Once the link is up, every transport
    /// failure ends the attempt the same way, so they all collapse into
    /// `ConnClosed`; the original error is logged at the call site.
    pub fn from_io(err: std::io::Error) -> Self {
        tracing::debug!("transport error on replication link: {}", err);
        ReplicaError::ConnClosed
    }

    /// Classify an error from the connect stage.
    pub fn from_connect(err: std::io::Error) -> Self {
        ReplicaError::ConnectRefused(err)
    }

    /// Whether the supervisor may retry from the connect stage.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ReplicaError::Fatal(_))
    }
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;
