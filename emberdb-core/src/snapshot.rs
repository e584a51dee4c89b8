//! Snapshot loader contract and transfer ingestion
//!
//! The binary dump format is opaque to the replication core. A
//! [`SnapshotLoader`] decodes it into storage mutations; this module
//! owns the byte source side: the post-header residue buffer, the live
//! socket, the announced byte limit, and the EOF-sentinel verification
//! at the end of a diskless transfer.

use crate::conn::MasterConnection;
use crate::error::{ReplicaError, ReplicaResult};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// Length of the random sentinel a master appends to a diskless
/// snapshot stream.
pub const EOF_TOKEN_LEN: usize = 40;

/// Chunk size for socket reads while loading a snapshot.
const INGEST_CHUNK: usize = 16 * 1024;

/// Error raised by a loader on corrupt snapshot input
#[derive(Debug, Error)]
#[error("snapshot decode failed: {0}")]
pub struct SnapshotError(pub String);

/// Progress report from [`SnapshotLoader::feed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The loader needs more bytes to reach its format terminator.
    NeedMore,
    /// The format terminator was reached. Any tail of the final chunk
    /// past it is available through [`SnapshotLoader::leftover`].
    Complete,
}

/// Incremental decoder for the snapshot dump format
///
/// The ingest driver pushes byte chunks in arrival order. The loader
/// applies decoded mutations to storage as it goes and reports when its
/// internal format terminator (or the hinted byte limit) is reached.
pub trait SnapshotLoader: Send {
    /// Announce the exact transfer size for length-prefixed dumps.
    /// Delimited (EOF-token) transfers give no hint.
    fn hint_limit(&mut self, limit: u64);

    /// Consume one chunk of the transfer.
    fn feed(&mut self, chunk: &[u8]) -> Result<LoadStatus, SnapshotError>;

    /// Total bytes consumed as snapshot payload.
    fn bytes_read(&self) -> u64;

    /// Bytes fed past the logical end of the dump.
    fn leftover(&self) -> &[u8];
}

/// Factory handed to the replication core; each sync attempt and each
/// flow gets a fresh loader.
pub trait SnapshotLoaderFactory: Send + Sync {
    fn make_loader(&self) -> Box<dyn SnapshotLoader>;
}

/// How the master frames the snapshot bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Exactly this many bytes follow, no trailing terminator.
    Sized(u64),
    /// Bytes follow until this sentinel appears at a frame boundary.
    EofToken([u8; EOF_TOKEN_LEN]),
}

/// Drive one snapshot transfer into `loader`.
///
/// `prefix` is whatever the connection had buffered past the transfer
/// header; it is consumed before the socket is read. On return the
/// transfer is fully verified: byte counts match in sized mode, the
/// sentinel matched byte-for-byte in delimited mode, and neither the
/// loader nor the connection holds residual bytes.
pub async fn ingest_snapshot(
    loader: &mut dyn SnapshotLoader,
    prefix: Bytes,
    conn: &mut MasterConnection,
    mode: &TransferMode,
) -> ReplicaResult<()> {
    match mode {
        TransferMode::Sized(size) => ingest_sized(loader, prefix, conn, *size).await,
        TransferMode::EofToken(token) => ingest_delimited(loader, prefix, conn, token).await,
    }
}

async fn ingest_sized(
    loader: &mut dyn SnapshotLoader,
    prefix: Bytes,
    conn: &mut MasterConnection,
    size: u64,
) -> ReplicaResult<()> {
    loader.hint_limit(size);

    let mut fed: u64 = 0;
    let mut status = LoadStatus::Complete;
    let mut prefix = prefix;

    while fed < size {
        let want = (size - fed).min(INGEST_CHUNK as u64) as usize;
        let chunk = if !prefix.is_empty() {
            prefix.split_to(prefix.len().min(want))
        } else {
            conn.recv_up_to(want).await?
        };

        status = loader
            .feed(&chunk)
            .map_err(|e| ReplicaError::SyncFailed(e.to_string()))?;
        fed += chunk.len() as u64;

        if status == LoadStatus::Complete && fed < size {
            return Err(ReplicaError::SyncFailed(format!(
                "snapshot ended after {fed} of {size} announced bytes"
            )));
        }
    }

    if size > 0 && status != LoadStatus::Complete {
        return Err(ReplicaError::SyncFailed(format!(
            "snapshot incomplete after {size} announced bytes"
        )));
    }
    if !loader.leftover().is_empty() {
        return Err(ReplicaError::SyncFailed(
            "snapshot decoder stopped before the announced size".into(),
        ));
    }
    if loader.bytes_read() != size {
        return Err(ReplicaError::SyncFailed(format!(
            "snapshot decoder consumed {} of {} announced bytes",
            loader.bytes_read(),
            size
        )));
    }
    if !prefix.is_empty() || conn.buffered_len() > 0 {
        return Err(ReplicaError::SyncFailed(
            "residual bytes after sized snapshot transfer".into(),
        ));
    }

    debug!("sized snapshot transfer complete, {} bytes", size);
    Ok(())
}

async fn ingest_delimited(
    loader: &mut dyn SnapshotLoader,
    prefix: Bytes,
    conn: &mut MasterConnection,
    token: &[u8; EOF_TOKEN_LEN],
) -> ReplicaResult<()> {
    let mut status = if prefix.is_empty() {
        LoadStatus::NeedMore
    } else {
        loader
            .feed(&prefix)
            .map_err(|e| ReplicaError::SyncFailed(e.to_string()))?
    };

    while status == LoadStatus::NeedMore {
        let chunk = conn.recv_up_to(INGEST_CHUNK).await?;
        status = loader
            .feed(&chunk)
            .map_err(|e| ReplicaError::SyncFailed(e.to_string()))?;
    }

    // The sentinel starts in the loader's leftover and may continue on
    // the socket.
    let leftover = loader.leftover();
    if leftover.len() > EOF_TOKEN_LEN {
        return Err(ReplicaError::SyncFailed(
            "trailing bytes beyond the snapshot sentinel".into(),
        ));
    }

    let mut sentinel = Vec::with_capacity(EOF_TOKEN_LEN);
    sentinel.extend_from_slice(leftover);
    if sentinel.len() < EOF_TOKEN_LEN {
        let rest = conn.read_exact_bytes(EOF_TOKEN_LEN - sentinel.len()).await?;
        sentinel.extend_from_slice(&rest);
    }

    if sentinel.as_slice() != token.as_slice() {
        return Err(ReplicaError::SyncFailed(
            "snapshot sentinel did not match the announced token".into(),
        ));
    }
    if conn.buffered_len() > 0 {
        return Err(ReplicaError::SyncFailed(
            "residual bytes after snapshot sentinel".into(),
        ));
    }

    debug!(
        "delimited snapshot transfer complete, {} bytes",
        loader.bytes_read()
    );
    Ok(())
}
