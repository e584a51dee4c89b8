//! Multi-flow dialect sync driver
//!
//! One data connection per master worker thread, each carrying an
//! independent snapshot fragment delimited by a per-flow sentinel. The
//! control connection stays quiet until every flow has attached, then
//! fires the rendezvous that lets the master start shipping.

use super::master::{partition_flows, FlowDescriptor, MasterContext};
use crate::config::ReplicationConfig;
use crate::conn::MasterConnection;
use crate::error::{ReplicaError, ReplicaResult};
use crate::resp::RespValue;
use crate::snapshot::{
    ingest_snapshot, SnapshotLoaderFactory, TransferMode, EOF_TOKEN_LEN,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One data connection in the multi-flow dialect
pub struct FlowWorker {
    descriptor: FlowDescriptor,
    endpoint: SocketAddr,
    master_repl_id: String,
    session_id: String,
    connect_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl FlowWorker {
    pub fn new(
        descriptor: FlowDescriptor,
        endpoint: SocketAddr,
        master_repl_id: String,
        session_id: String,
        connect_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            descriptor,
            endpoint,
            master_repl_id,
            session_id,
            connect_timeout,
            shutdown_rx,
        }
    }

    /// Open the data connection and authenticate the flow. On success
    /// the master has announced this flow's snapshot sentinel; the
    /// fragment itself starts flowing only after the global rendezvous.
    pub async fn attach(self) -> ReplicaResult<AttachedFlow> {
        let mut conn = MasterConnection::connect(
            self.endpoint,
            self.connect_timeout,
            self.shutdown_rx,
            Arc::new(Mutex::new(Instant::now())),
        )
        .await?;

        conn.send_command(&format!(
            "DFLY FLOW {} {} {}",
            self.master_repl_id, self.session_id, self.descriptor.flow_id
        ))
        .await?;

        let reply = conn.read_value().await?;
        let RespValue::Array(items) = reply else {
            return Err(ReplicaError::BadMessage(
                "flow announcement is not an array".into(),
            ));
        };
        if items.len() < 2 {
            return Err(ReplicaError::BadMessage(format!(
                "flow announcement has {} elements, expected at least 2",
                items.len()
            )));
        }

        let directive = items[0].as_text().ok_or_else(|| {
            ReplicaError::BadMessage("flow directive is not a string".into())
        })?;
        if directive != "FULL" {
            return Err(ReplicaError::BadMessage(format!(
                "unexpected flow directive {directive:?}"
            )));
        }

        let token_bytes = items[1].as_bulk().ok_or_else(|| {
            ReplicaError::BadMessage("flow sentinel is not a bulk string".into())
        })?;
        if token_bytes.len() != EOF_TOKEN_LEN {
            return Err(ReplicaError::BadMessage(format!(
                "flow sentinel has length {}, expected {}",
                token_bytes.len(),
                EOF_TOKEN_LEN
            )));
        }
        let mut eof_token = [0u8; EOF_TOKEN_LEN];
        eof_token.copy_from_slice(token_bytes);

        debug!("flow {} attached", self.descriptor.flow_id);

        Ok(AttachedFlow {
            flow_id: self.descriptor.flow_id,
            conn,
            eof_token,
        })
    }
}

/// A flow that finished its handshake and awaits its fragment
pub struct AttachedFlow {
    flow_id: u32,
    conn: MasterConnection,
    eof_token: [u8; EOF_TOKEN_LEN],
}

impl AttachedFlow {
    /// Ingest this flow's snapshot fragment and verify its sentinel.
    /// The flow terminates cleanly once the fragment is ingested; its
    /// change stream is reserved until that protocol is negotiated.
    pub async fn ingest(
        mut self,
        mut loader: Box<dyn crate::snapshot::SnapshotLoader>,
    ) -> ReplicaResult<()> {
        // The flow handshake reply may have carried the first fragment
        // bytes; they go to the loader ahead of the socket.
        let prefix = self.conn.drain_buffer();
        ingest_snapshot(
            loader.as_mut(),
            prefix,
            &mut self.conn,
            &TransferMode::EofToken(self.eof_token),
        )
        .await?;

        debug!(
            "flow {} ingested {} snapshot bytes",
            self.flow_id,
            loader.bytes_read()
        );
        Ok(())
    }
}

/// Multi-flow dialect driver borrowed pieces of the supervisor
pub struct MultiFlowDriver<'a> {
    pub conn: &'a mut MasterConnection,
    pub cfg: &'a ReplicationConfig,
    pub master: &'a Mutex<MasterContext>,
    pub loaders: &'a Arc<dyn SnapshotLoaderFactory>,
    pub shutdown_rx: &'a watch::Receiver<bool>,
}

impl<'a> MultiFlowDriver<'a> {
    /// Run one full multi-flow sync: attach every flow, fire the
    /// rendezvous on the control connection, and join every fragment.
    pub async fn run(&mut self) -> ReplicaResult<()> {
        let (endpoint, master_repl_id, session_id, flow_count) = {
            let master = self.master.lock();
            let endpoint = master.endpoint.ok_or_else(|| {
                ReplicaError::Fatal("multi-flow sync without a resolved endpoint".into())
            })?;
            let session_id = master.session_id().ok_or_else(|| {
                ReplicaError::Fatal("multi-flow sync without a session id".into())
            })?;
            (
                endpoint,
                master.master_repl_id.clone(),
                session_id.to_string(),
                master.flow_count(),
            )
        };

        let workers = self.cfg.effective_worker_count();
        let partition = partition_flows(flow_count, workers);
        info!(
            "starting multi-flow sync: session {}, {} flows across {} workers",
            session_id, flow_count, workers
        );

        // Attach all flows in parallel, one starter task per partition
        // slot. The first failure wins; later ones are dropped.
        let first_error: Arc<Mutex<Option<ReplicaError>>> = Arc::new(Mutex::new(None));
        let attached: Arc<Mutex<Vec<AttachedFlow>>> = Arc::new(Mutex::new(Vec::new()));

        let mut starters = Vec::new();
        for flows in partition.into_iter().filter(|p| !p.is_empty()) {
            let first_error = Arc::clone(&first_error);
            let attached = Arc::clone(&attached);
            let master_repl_id = master_repl_id.clone();
            let session_id = session_id.clone();
            let connect_timeout = self.cfg.connect_timeout;
            let shutdown_rx = self.shutdown_rx.clone();

            starters.push(tokio::spawn(async move {
                for descriptor in flows {
                    if first_error.lock().is_some() {
                        break;
                    }
                    let worker = FlowWorker::new(
                        descriptor,
                        endpoint,
                        master_repl_id.clone(),
                        session_id.clone(),
                        connect_timeout,
                        shutdown_rx.clone(),
                    );
                    match worker.attach().await {
                        Ok(flow) => attached.lock().push(flow),
                        Err(e) => {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                }
            }));
        }
        for starter in starters {
            starter
                .await
                .map_err(|_| ReplicaError::Fatal("flow starter task panicked".into()))?;
        }

        if let Some(err) = first_error.lock().take() {
            warn!("flow attach failed: {}", err);
            return Err(err);
        }

        // Rendezvous: every flow is attached, tell the master to start
        // shipping fragments.
        self.conn
            .send_command(&format!("DFLY SYNC {session_id}"))
            .await?;
        self.conn.flush_status()?;
        let reply = self.conn.read_value().await?;
        if !reply.is_text("OK") {
            warn!("sync rendezvous rejected: {:?}", reply);
            return Err(ReplicaError::BadMessage(
                "master rejected the sync rendezvous".into(),
            ));
        }

        let flows: Vec<AttachedFlow> = std::mem::take(&mut *attached.lock());
        let mut ingests = Vec::with_capacity(flows.len());
        for flow in flows {
            let loader = self.loaders.make_loader();
            ingests.push(tokio::spawn(flow.ingest(loader)));
        }

        let mut result = Ok(());
        for ingest in ingests {
            match ingest.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(ReplicaError::Fatal("flow ingest task panicked".into()));
                    }
                }
            }
        }

        if result.is_ok() {
            info!("multi-flow sync complete: {} flows ingested", flow_count);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{LoadStatus, SnapshotError, SnapshotLoader};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct SwallowLoader {
        bytes_read: u64,
        leftover: Vec<u8>,
    }

    impl SnapshotLoader for SwallowLoader {
        fn hint_limit(&mut self, _limit: u64) {}

        fn feed(&mut self, chunk: &[u8]) -> Result<LoadStatus, SnapshotError> {
            match chunk.iter().position(|&b| b == 0) {
                Some(pos) => {
                    self.bytes_read += (pos + 1) as u64;
                    self.leftover.extend_from_slice(&chunk[pos + 1..]);
                    Ok(LoadStatus::Complete)
                }
                None => {
                    self.bytes_read += chunk.len() as u64;
                    Ok(LoadStatus::NeedMore)
                }
            }
        }

        fn bytes_read(&self) -> u64 {
            self.bytes_read
        }

        fn leftover(&self) -> &[u8] {
            &self.leftover
        }
    }

    #[tokio::test]
    async fn test_flow_attach_and_ingest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = [b'F'; EOF_TOKEN_LEN];

        let master = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();

            // announce FULL + sentinel, then ship the fragment
            let mut reply = Vec::new();
            reply.extend_from_slice(b"*2\r\n$4\r\nFULL\r\n$40\r\n");
            reply.extend_from_slice(&token);
            reply.extend_from_slice(b"\r\n");
            reply.extend_from_slice(&[9u8; 63]);
            reply.push(0);
            reply.extend_from_slice(&token);
            sock.write_all(&reply).await.unwrap();
            request
        });

        let (_tx, rx) = watch::channel(false);
        let worker = FlowWorker::new(
            FlowDescriptor {
                flow_id: 3,
                partition: 0,
            },
            addr,
            "m".repeat(40),
            "sess9".into(),
            Duration::from_secs(1),
            rx,
        );

        let flow = worker.attach().await.unwrap();
        flow.ingest(Box::new(SwallowLoader {
            bytes_read: 0,
            leftover: Vec::new(),
        }))
        .await
        .unwrap();

        let request = master.await.unwrap();
        assert!(request.contains("FLOW"));
        assert!(request.contains("sess9"));
        assert!(request.contains('3'));
    }

    #[tokio::test]
    async fn test_flow_rejects_unknown_directive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"*2\r\n$7\r\nPARTIAL\r\n$3\r\nabc\r\n")
                .await
                .unwrap();
            // keep the socket open until the client gives up
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (_tx, rx) = watch::channel(false);
        let worker = FlowWorker::new(
            FlowDescriptor {
                flow_id: 0,
                partition: 0,
            },
            addr,
            "m".repeat(40),
            "sess9".into(),
            Duration::from_secs(1),
            rx,
        );

        assert!(matches!(
            worker.attach().await,
            Err(ReplicaError::BadMessage(_))
        ));
    }
}
