//! Replica supervisor
//!
//! One supervisor per configured master. It owns the control
//! connection, the master identity, and the long-running driver task,
//! and is the only layer that inspects errors to decide between retry
//! and terminate. `stop` must be called before dropping a supervisor:
//! it trips the shutdown flag shared by every socket, joins the driver
//! task, and with it every flow task.

use super::handshake::{greet, Greeting};
use super::legacy::LegacyPsyncDriver;
use super::master::{Dialect, MasterContext};
use super::multiflow::MultiFlowDriver;
use super::state::{ReplicaInfo, ReplicaState, Stage};
use crate::config::ReplicationConfig;
use crate::conn::{resolve_master_addr, MasterConnection};
use crate::dispatch::CommandDispatcher;
use crate::error::{ReplicaError, ReplicaResult};
use crate::snapshot::SnapshotLoaderFactory;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to one replication attempt chain against one master
pub struct Replica {
    shared: Arc<ReplicaShared>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ReplicaShared {
    cfg: ReplicationConfig,
    dispatcher: Arc<dyn CommandDispatcher>,
    loaders: Arc<dyn SnapshotLoaderFactory>,
    state: RwLock<ReplicaState>,
    master: Mutex<MasterContext>,
    repl_offset: AtomicU64,
    last_io: Arc<Mutex<Instant>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Replica {
    pub fn new(
        host: String,
        port: u16,
        cfg: ReplicationConfig,
        dispatcher: Arc<dyn CommandDispatcher>,
        loaders: Arc<dyn SnapshotLoaderFactory>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(ReplicaShared {
                cfg,
                dispatcher,
                loaders,
                state: RwLock::new(ReplicaState::new()),
                master: Mutex::new(MasterContext::new(host, port)),
                repl_offset: AtomicU64::new(0),
                last_io: Arc::new(Mutex::new(Instant::now())),
                shutdown_rx,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Connect and greet the master, then hand off to the driver task.
    ///
    /// Connect and greet failures are reported synchronously so the
    /// admin command that created this replica can relay them; every
    /// later failure is visible only through logs and [`info`](Self::info).
    pub async fn start(&self) -> ReplicaResult<()> {
        if self.task.lock().is_some() {
            return Err(ReplicaError::Fatal("replica is already running".into()));
        }

        let mut conn = self.shared.connect_control().await?;
        self.shared.state.write().advance_to(Stage::Connected)?;

        let greeting = greet(&mut conn).await?;
        self.shared.apply_greeting(&greeting);
        self.shared.state.write().advance_to(Stage::Greeted)?;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_loop(shared, Some(conn)));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Disable the replica and join the driver task and all flows.
    pub async fn stop(&self) {
        self.shared.state.write().disable();
        let _ = self.shutdown_tx.send(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                error!("replication driver task panicked during shutdown");
            }
        }
        debug!("replica stopped");
    }

    /// Gate reconnect attempts without dropping a healthy link.
    pub fn pause(&self, paused: bool) {
        self.shared.state.write().set_paused(paused);
        info!("replica reconnects {}", if paused { "paused" } else { "resumed" });
    }

    /// Status snapshot for the server's INFO section.
    pub fn info(&self) -> ReplicaInfo {
        let (host, port) = {
            let master = self.shared.master.lock();
            (master.host.clone(), master.port)
        };
        let state = self.shared.state.read();
        ReplicaInfo {
            host,
            port,
            link_established: state.link_established(),
            sync_in_progress: state.sync_in_progress(),
            seconds_since_last_io: self.shared.last_io.lock().elapsed().as_secs(),
        }
    }

    /// Current change-stream offset (legacy dialect).
    pub fn repl_offset(&self) -> u64 {
        self.shared.repl_offset.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.read().is_enabled()
    }
}

impl ReplicaShared {
    async fn connect_control(&self) -> ReplicaResult<MasterConnection> {
        let (host, port) = {
            let master = self.master.lock();
            (master.host.clone(), master.port)
        };
        let addr = resolve_master_addr(&host, port).await?;
        self.master.lock().endpoint = Some(addr);

        let mut conn = MasterConnection::connect(
            addr,
            self.cfg.connect_timeout,
            self.shutdown_rx.clone(),
            Arc::clone(&self.last_io),
        )
        .await?;
        conn.set_recv_buffer(self.cfg.stream_buffer_bytes);
        Ok(conn)
    }

    fn apply_greeting(&self, greeting: &Greeting) {
        let mut master = self.master.lock();
        if let Greeting::MultiFlow { master_repl_id, .. } = greeting {
            master.master_repl_id = master_repl_id.clone();
        }
        master.dialect = Some(greeting.dialect());
    }

    fn stage(&self) -> Stage {
        self.state.read().stage()
    }

    fn enabled(&self) -> bool {
        self.state.read().is_enabled()
    }
}

/// The supervisor main task: one pass per attempt stage, restarting
/// from the earliest failed stage on any transient error.
async fn run_loop(shared: Arc<ReplicaShared>, mut conn: Option<MasterConnection>) {
    while shared.enabled() {
        if conn.is_none() {
            let mut shutdown_rx = shared.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(shared.cfg.reconnect_delay) => {}
                _ = shutdown_rx.changed() => continue,
            }
            if shared.state.read().is_paused() {
                continue;
            }

            match shared.connect_control().await {
                Ok(new_conn) => {
                    conn = Some(new_conn);
                    if advance_or_disable(&shared, Stage::Connected).is_err() {
                        break;
                    }
                    debug!("replica control socket connected");
                }
                Err(e) => {
                    error!("error connecting to master: {}", e);
                    continue;
                }
            }
        }

        if shared.stage() < Stage::Greeted {
            let greet_result = match conn.as_mut() {
                Some(control) => greet(control).await,
                None => continue,
            };
            match greet_result {
                Ok(greeting) => {
                    shared.apply_greeting(&greeting);
                    if advance_or_disable(&shared, Stage::Greeted).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    info!("error greeting master: {}", e);
                    conn = None;
                    shared.state.write().reset_attempt();
                    continue;
                }
            }
        }

        if shared.stage() < Stage::SyncOk {
            let sync_result = match conn.as_mut() {
                Some(control) => run_sync(&shared, control).await,
                None => continue,
            };
            if let Err(e) = sync_result {
                warn!("error syncing with master: {}", e);
                if !e.is_retriable() {
                    debug_assert!(false, "fatal replication error: {e}");
                    shared.state.write().disable();
                    break;
                }
                conn = None;
                shared.state.write().reset_attempt();
                continue;
            }
            debug!("replica sync ok");
        }

        let dialect = shared.master.lock().dialect.clone();
        let stream_result = match (dialect, conn.as_mut()) {
            (Some(Dialect::Legacy), Some(control)) => {
                consume_legacy_stream(&shared, control).await
            }
            (Some(Dialect::MultiFlow { .. }), Some(control)) => {
                consume_multiflow_stream(&shared, control).await
            }
            (None, _) => Err(ReplicaError::Fatal(
                "streaming without a negotiated dialect".into(),
            )),
            (_, None) => continue,
        };

        if let Err(e) = &stream_result {
            if !matches!(e, ReplicaError::ConnClosed) {
                error!("replica stream error: {}", e);
            }
        }
        shared.state.write().drop_sync();
    }

    debug!("replication driver finished");
}

fn advance_or_disable(shared: &ReplicaShared, stage: Stage) -> ReplicaResult<()> {
    if let Err(e) = shared.state.write().advance_to(stage) {
        debug_assert!(false, "fatal replication error: {e}");
        error!("{}", e);
        shared.state.write().disable();
        return Err(e);
    }
    Ok(())
}

async fn run_sync(shared: &Arc<ReplicaShared>, conn: &mut MasterConnection) -> ReplicaResult<()> {
    shared.state.write().advance_to(Stage::Syncing)?;

    let dialect = shared
        .master
        .lock()
        .dialect
        .clone()
        .ok_or_else(|| ReplicaError::Fatal("sync attempted before the handshake".into()))?;

    match dialect {
        Dialect::Legacy => {
            let mut driver = LegacyPsyncDriver {
                conn,
                cfg: &shared.cfg,
                master: &shared.master,
                repl_offset: &shared.repl_offset,
                dispatcher: shared.dispatcher.as_ref(),
            };
            driver.full_sync(shared.loaders.as_ref()).await?;

            // Narrow the legacy-master window where an immediate ack
            // right after the transfer is silently dropped.
            tokio::time::sleep(shared.cfg.first_ack_delay).await;
        }
        Dialect::MultiFlow { .. } => {
            let mut driver = MultiFlowDriver {
                conn,
                cfg: &shared.cfg,
                master: &shared.master,
                loaders: &shared.loaders,
                shutdown_rx: &shared.shutdown_rx,
            };
            driver.run().await?;
        }
    }

    shared.state.write().advance_to(Stage::SyncOk)?;
    Ok(())
}

async fn consume_legacy_stream(
    shared: &Arc<ReplicaShared>,
    conn: &mut MasterConnection,
) -> ReplicaResult<()> {
    let mut driver = LegacyPsyncDriver {
        conn,
        cfg: &shared.cfg,
        master: &shared.master,
        repl_offset: &shared.repl_offset,
        dispatcher: shared.dispatcher.as_ref(),
    };
    driver.consume_stream().await
}

/// The per-flow change stream has no negotiated protocol yet: detach
/// politely after the fragments are ingested instead of spinning.
async fn consume_multiflow_stream(
    shared: &Arc<ReplicaShared>,
    conn: &mut MasterConnection,
) -> ReplicaResult<()> {
    shared.state.write().disable();
    info!("multi-flow snapshot ingested; detaching until flow streaming is negotiated");
    conn.send_command("QUIT").await?;
    let _ = conn.read_value().await;
    Ok(())
}
