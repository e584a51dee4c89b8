//! Master-facing connection
//!
//! Owns one TCP socket to the master plus the growable read buffer the
//! resumable parser works over. Every receive races the supervisor's
//! shutdown flag, so a `stop()` turns all pending and future socket I/O
//! on this connection into `ConnClosed`.

use crate::error::{ReplicaError, ReplicaResult};
use crate::resp::{encode_command_line, parse_value, RespValue};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Receive window reserved ahead of every read.
const DEFAULT_RECV_RESERVE: usize = 16 * 1024;

/// Resolve the master host to a socket address.
///
/// Uses the system resolver; the first returned address of either
/// family wins, so IPv6-only masters work the same as IPv4 ones.
pub async fn resolve_master_addr(host: &str, port: u16) -> ReplicaResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ReplicaError::DnsUnresolved {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ReplicaError::DnsUnresolved {
        host: host.to_string(),
        reason: "no addresses returned".to_string(),
    })
}

/// A connection to the master with buffered reads and framed writes
pub struct MasterConnection {
    stream: TcpStream,
    buf: BytesMut,
    /// Last write error, consulted via [`flush_status`](Self::flush_status)
    /// after batched sends.
    last_write_error: Option<std::io::Error>,
    recv_reserve: usize,
    shutdown_rx: watch::Receiver<bool>,
    last_io: Arc<Mutex<Instant>>,
}

impl MasterConnection {
    /// Connect to `addr` within `timeout`.
    pub async fn connect(
        addr: SocketAddr,
        timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
        last_io: Arc<Mutex<Instant>>,
    ) -> ReplicaResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ReplicaError::ConnectRefused(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(ReplicaError::from_connect)?;

        debug!("connected to master at {}", addr);

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(DEFAULT_RECV_RESERVE),
            last_write_error: None,
            recv_reserve: DEFAULT_RECV_RESERVE,
            shutdown_rx,
            last_io,
        })
    }

    /// Size the receive window. Larger windows let the stream consumer
    /// take a whole burst in one receive, which keeps its ack
    /// accounting aligned with the master's write boundaries.
    pub fn set_recv_buffer(&mut self, bytes: usize) {
        self.recv_reserve = bytes.max(512);
    }

    /// Receive at least one byte into the read buffer.
    ///
    /// Returns the number of bytes received. Fails with `ConnClosed` on
    /// peer EOF or once the shutdown flag is set.
    pub async fn recv_some(&mut self) -> ReplicaResult<usize> {
        if *self.shutdown_rx.borrow() {
            return Err(ReplicaError::ConnClosed);
        }

        self.buf.reserve(self.recv_reserve);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = shutdown_rx.changed() => Err(ReplicaError::ConnClosed),
            read = tokio::io::AsyncReadExt::read_buf(&mut self.stream, &mut self.buf) => {
                let n = read.map_err(ReplicaError::from_io)?;
                if n == 0 {
                    return Err(ReplicaError::ConnClosed);
                }
                *self.last_io.lock() = Instant::now();
                Ok(n)
            }
        }
    }

    /// Try to decode one complete reply from the buffered bytes,
    /// consuming them on success.
    pub fn next_parsed(&mut self) -> ReplicaResult<Option<RespValue>> {
        match parse_value(&self.buf)? {
            Some((value, used)) => {
                self.buf.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Read one complete reply, receiving more bytes as needed.
    pub async fn read_value(&mut self) -> ReplicaResult<RespValue> {
        loop {
            if let Some(value) = self.next_parsed()? {
                return Ok(value);
            }
            self.recv_some().await?;
        }
    }

    /// Read one `\r\n`-terminated line, skipping leading ASCII
    /// whitespace. Only used between `PSYNC` and the first snapshot
    /// byte, where the master speaks in raw lines rather than replies.
    pub async fn read_line(&mut self) -> ReplicaResult<String> {
        loop {
            let ws = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buf.advance(ws);
            if !self.buf.is_empty() {
                break;
            }
            self.recv_some().await?;
        }

        loop {
            if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                if nl == 0 || self.buf[nl - 1] != b'\r' {
                    return Err(ReplicaError::BadMessage(
                        "sync header line feed without carriage return".into(),
                    ));
                }
                let line = String::from_utf8_lossy(&self.buf[..nl - 1]).into_owned();
                self.buf.advance(nl + 1);
                return Ok(line);
            }
            self.recv_some().await?;
        }
    }

    /// Read exactly `n` raw bytes, draining the buffer first.
    pub async fn read_exact_bytes(&mut self, n: usize) -> ReplicaResult<Bytes> {
        while self.buf.len() < n {
            self.recv_some().await?;
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read up to `max` raw bytes: whatever is buffered, or one receive
    /// if the buffer is empty. Never returns an empty chunk.
    pub async fn recv_up_to(&mut self, max: usize) -> ReplicaResult<Bytes> {
        if self.buf.is_empty() {
            self.recv_some().await?;
        }
        let take = self.buf.len().min(max);
        Ok(self.buf.split_to(take).freeze())
    }

    /// Take every byte currently buffered. Used to hand post-header
    /// residue to the snapshot loader.
    pub fn drain_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Send one command, framed as an array of bulk strings.
    ///
    /// A write failure is returned and also recorded in the sticky
    /// write-error field for callers that batch sends.
    pub async fn send_command(&mut self, line: &str) -> ReplicaResult<()> {
        debug!("sending command: {}", line);
        let frame = encode_command_line(line);
        match self.stream.write_all(&frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mapped = ReplicaError::from_io(std::io::Error::new(e.kind(), e.to_string()));
                self.last_write_error = Some(e);
                Err(mapped)
            }
        }
    }

    /// Result of the most recent send, for call sites that issue a
    /// batch of writes and check once before the next read.
    pub fn flush_status(&self) -> ReplicaResult<()> {
        match &self.last_write_error {
            Some(e) => Err(ReplicaError::from_io(std::io::Error::new(
                e.kind(),
                e.to_string(),
            ))),
            None => Ok(()),
        }
    }
}
