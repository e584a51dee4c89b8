//! Legacy-dialect sync driver
//!
//! Executes the full transfer over the control connection, then turns
//! the change stream into dispatched commands with periodic acks. The
//! ack offset is the master-side wire offset: it advances by raw bytes
//! received, never by parser-consumed counts.

use super::master::{FullSyncHeader, MasterContext};
use crate::config::ReplicationConfig;
use crate::conn::MasterConnection;
use crate::dispatch::{CommandDispatcher, DispatchContext};
use crate::error::{ReplicaError, ReplicaResult};
use crate::resp::RespValue;
use crate::snapshot::{SnapshotLoaderFactory, TransferMode, EOF_TOKEN_LEN};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Legacy-dialect driver borrowed pieces of the supervisor
pub struct LegacyPsyncDriver<'a> {
    pub conn: &'a mut MasterConnection,
    pub cfg: &'a ReplicationConfig,
    pub master: &'a Mutex<MasterContext>,
    pub repl_offset: &'a AtomicU64,
    pub dispatcher: &'a dyn CommandDispatcher,
}

impl<'a> LegacyPsyncDriver<'a> {
    /// Issue `PSYNC` and ingest the announced full transfer.
    pub async fn full_sync(&mut self, loaders: &dyn SnapshotLoaderFactory) -> ReplicaResult<()> {
        let request = {
            let master = self.master.lock();
            if master.master_repl_id.is_empty() {
                "PSYNC ? -1".to_string()
            } else {
                format!(
                    "PSYNC {} {}",
                    master.master_repl_id,
                    self.repl_offset.load(Ordering::Relaxed)
                )
            }
        };
        self.conn.send_command(&request).await?;
        self.conn.flush_status()?;

        let header_line = self.conn.read_line().await?;
        let (master_repl_id, stream_offset) = parse_sync_header(&header_line)?;

        {
            let mut master = self.master.lock();
            master.master_repl_id = master_repl_id;
        }
        self.repl_offset.store(stream_offset, Ordering::Relaxed);

        let transfer_line = self.conn.read_line().await?;
        let header = parse_transfer_header(&transfer_line)?;
        debug!("full sync transfer framing: {:?}", header);

        // Every full sync restarts from empty storage; nothing from a
        // previous attempt may survive into this one.
        self.dispatcher.flush_all();

        let mode = match header {
            FullSyncHeader::Sized(size) => TransferMode::Sized(size),
            FullSyncHeader::EofToken(token) => TransferMode::EofToken(token),
        };
        let mut loader = loaders.make_loader();
        let prefix = self.conn.drain_buffer();
        crate::snapshot::ingest_snapshot(loader.as_mut(), prefix, &mut *self.conn, &mode).await?;

        info!(
            "full sync complete: {} snapshot bytes from master {}",
            loader.bytes_read(),
            self.master.lock().master_repl_id
        );
        Ok(())
    }

    /// Consume the change stream until the socket fails or the stream
    /// violates framing. The supervisor decides whether to retry.
    pub async fn consume_stream(&mut self) -> ReplicaResult<()> {
        let mut last_ack_offset = self.repl_offset.load(Ordering::Relaxed);
        let mut last_ack_time = Instant::now();

        // Masters gate the stream on the first ack.
        self.conn
            .send_command(&format!("REPLCONF ACK {last_ack_offset}"))
            .await?;

        loop {
            self.conn.flush_status()?;
            let received = self.conn.recv_some().await?;
            let offset = self
                .repl_offset
                .fetch_add(received as u64, Ordering::Relaxed)
                + received as u64;

            if offset - last_ack_offset >= self.cfg.ack_bytes_threshold
                || last_ack_time.elapsed() >= self.cfg.ack_interval
            {
                self.conn
                    .send_command(&format!("REPLCONF ACK {offset}"))
                    .await?;
                last_ack_offset = offset;
                last_ack_time = Instant::now();
            }

            while let Some(value) = self.conn.next_parsed()? {
                let args = command_args(value)?;
                if args.is_empty() {
                    continue;
                }
                if let Err(e) = self.dispatcher.dispatch(args, &DispatchContext::replay()) {
                    // One bad replayed command must not wedge the
                    // stream; the divergence is the operator's to fix.
                    warn!("failed to apply replicated command: {}", e);
                }
            }
        }
    }
}

/// Parse the first `PSYNC` reply line: `+FULLRESYNC <id> <offset>`.
///
/// `+CONTINUE` (partial resync) is announced by newer masters but not
/// implemented here; it is rejected so the supervisor falls back to a
/// clean full attempt instead of silently pretending success.
pub fn parse_sync_header(line: &str) -> ReplicaResult<(String, u64)> {
    let Some(header) = line.strip_prefix('+') else {
        return Err(ReplicaError::BadMessage(format!(
            "bad sync header line: {line:?}"
        )));
    };

    if let Some(rest) = header.strip_prefix("FULLRESYNC ") {
        let mut parts = rest.split(' ');
        let id = parts.next().unwrap_or_default();
        let offset = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                ReplicaError::BadMessage(format!("bad sync header offset: {line:?}"))
            })?;
        if id.is_empty() || parts.next().is_some() {
            return Err(ReplicaError::BadMessage(format!(
                "bad sync header line: {line:?}"
            )));
        }
        return Ok((id.to_string(), offset));
    }

    if header.starts_with("CONTINUE") {
        warn!("master offered a partial resync, which is not supported");
        return Err(ReplicaError::BadMessage(
            "partial resync is not supported".into(),
        ));
    }

    Err(ReplicaError::BadMessage(format!(
        "bad sync header line: {line:?}"
    )))
}

/// Parse the transfer framing line: `$EOF:<token>` or `$<size>`.
pub fn parse_transfer_header(line: &str) -> ReplicaResult<FullSyncHeader> {
    let Some(body) = line.strip_prefix('$') else {
        return Err(ReplicaError::BadMessage(format!(
            "bad transfer header line: {line:?}"
        )));
    };

    if let Some(token_text) = body.strip_prefix("EOF:") {
        if token_text.len() != EOF_TOKEN_LEN {
            return Err(ReplicaError::BadMessage(format!(
                "snapshot sentinel has length {}, expected {}",
                token_text.len(),
                EOF_TOKEN_LEN
            )));
        }
        let mut token = [0u8; EOF_TOKEN_LEN];
        token.copy_from_slice(token_text.as_bytes());
        return Ok(FullSyncHeader::EofToken(token));
    }

    let size = body.parse::<u64>().map_err(|_| {
        ReplicaError::BadMessage(format!("bad transfer header size: {line:?}"))
    })?;
    Ok(FullSyncHeader::Sized(size))
}

/// Flatten a parsed stream entry into dispatchable argument bytes.
fn command_args(value: RespValue) -> ReplicaResult<Vec<Bytes>> {
    let RespValue::Array(items) = value else {
        return Err(ReplicaError::BadMessage(
            "change stream entry is not a command array".into(),
        ));
    };

    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::Bulk(bytes) => args.push(bytes),
            RespValue::Simple(text) => args.push(Bytes::from(text)),
            other => {
                return Err(ReplicaError::BadMessage(format!(
                    "change stream argument has unexpected shape: {other:?}"
                )))
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_resync_header() {
        let id = "d".repeat(40);
        let (parsed_id, offset) = parse_sync_header(&format!("+FULLRESYNC {id} 1234")).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(offset, 1234);
    }

    #[test]
    fn test_parse_header_rejects_continue() {
        assert!(matches!(
            parse_sync_header("+CONTINUE"),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        for line in ["FULLRESYNC x 1", "+FULLRESYNC", "+FULLRESYNC id", "+FULLRESYNC id x"] {
            assert!(
                matches!(parse_sync_header(line), Err(ReplicaError::BadMessage(_))),
                "line {line:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_transfer_sized() {
        assert_eq!(
            parse_transfer_header("$11").unwrap(),
            FullSyncHeader::Sized(11)
        );
    }

    #[test]
    fn test_parse_transfer_eof_token() {
        let token_text = "t".repeat(EOF_TOKEN_LEN);
        match parse_transfer_header(&format!("$EOF:{token_text}")).unwrap() {
            FullSyncHeader::EofToken(token) => {
                assert_eq!(&token[..], token_text.as_bytes());
            }
            other => panic!("expected EOF token header, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_transfer_rejects_short_token() {
        assert!(matches!(
            parse_transfer_header("$EOF:short"),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_command_args_flattening() {
        let value = RespValue::Array(vec![
            RespValue::Bulk(Bytes::from_static(b"SET")),
            RespValue::Bulk(Bytes::from_static(b"k")),
            RespValue::Bulk(Bytes::from_static(b"v")),
        ]);
        let args = command_args(value).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(&args[0][..], b"SET");
    }

    #[test]
    fn test_command_args_rejects_non_array() {
        assert!(matches!(
            command_args(RespValue::Simple("PING".into())),
            Err(ReplicaError::BadMessage(_))
        ));
    }
}
