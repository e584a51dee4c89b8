//! Role-change administration
//!
//! The server's `REPLICAOF` handler lands here. A single async mutex is
//! the critical section for role changes: at most one supervisor exists
//! per configured master, and switching back to primary fully tears the
//! old one down before the instance serves writes again.

use crate::config::ReplicationConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::ReplicaResult;
use crate::replication::{Replica, ReplicaInfo};
use crate::snapshot::SnapshotLoaderFactory;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Owns the replica pointer on behalf of the outer server
pub struct ReplicationController {
    cfg: ReplicationConfig,
    dispatcher: Arc<dyn CommandDispatcher>,
    loaders: Arc<dyn SnapshotLoaderFactory>,
    replica: Mutex<Option<Arc<Replica>>>,
}

impl ReplicationController {
    pub fn new(
        cfg: ReplicationConfig,
        dispatcher: Arc<dyn CommandDispatcher>,
        loaders: Arc<dyn SnapshotLoaderFactory>,
    ) -> Self {
        Self {
            cfg,
            dispatcher,
            loaders,
            replica: Mutex::new(None),
        }
    }

    /// Make this instance a replica of `host:port`.
    ///
    /// Tears down any previous replica first. Storage is flushed before
    /// the first sync attempt; the connect and greet outcome is
    /// returned synchronously so the admin command can relay it.
    pub async fn replica_of(&self, host: &str, port: u16) -> ReplicaResult<()> {
        let new_replica = Arc::new(Replica::new(
            host.to_string(),
            port,
            self.cfg.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.loaders),
        ));

        let mut guard = self.replica.lock().await;
        if let Some(old) = guard.take() {
            old.stop().await;
        }

        // Flush after the role is claimed, so the snapshot lands in
        // empty storage.
        self.dispatcher.flush_all();

        new_replica.start().await?;
        info!("instance is now a replica of {}:{}", host, port);
        *guard = Some(new_replica);
        Ok(())
    }

    /// `REPLICAOF NO ONE`: return to primary mode.
    pub async fn detach(&self) {
        let mut guard = self.replica.lock().await;
        if let Some(old) = guard.take() {
            old.stop().await;
            info!("instance returned to primary mode");
        }
    }

    /// Gate or un-gate reconnect attempts of the current replica.
    pub async fn pause(&self, paused: bool) {
        if let Some(replica) = self.replica.lock().await.as_ref() {
            replica.pause(paused);
        }
    }

    /// Replication status for the INFO section; `None` in primary mode.
    pub async fn info(&self) -> Option<ReplicaInfo> {
        self.replica.lock().await.as_ref().map(|r| r.info())
    }

    /// Whether the instance currently runs in replica mode.
    pub async fn is_replica(&self) -> bool {
        self.replica.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommandArgs, DispatchContext, DispatchError};
    use crate::error::ReplicaError;
    use crate::snapshot::{LoadStatus, SnapshotError, SnapshotLoader};
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FlushCountingDispatcher {
        flushes: SyncMutex<u32>,
    }

    impl CommandDispatcher for FlushCountingDispatcher {
        fn dispatch(&self, _args: CommandArgs, _ctx: &DispatchContext) -> Result<(), DispatchError> {
            Ok(())
        }

        fn flush_all(&self) {
            *self.flushes.lock() += 1;
        }
    }

    struct NullLoader;

    impl SnapshotLoader for NullLoader {
        fn hint_limit(&mut self, _limit: u64) {}

        fn feed(&mut self, _chunk: &[u8]) -> Result<LoadStatus, SnapshotError> {
            Ok(LoadStatus::Complete)
        }

        fn bytes_read(&self) -> u64 {
            0
        }

        fn leftover(&self) -> &[u8] {
            &[]
        }
    }

    struct NullLoaderFactory;

    impl SnapshotLoaderFactory for NullLoaderFactory {
        fn make_loader(&self) -> Box<dyn SnapshotLoader> {
            Box::new(NullLoader)
        }
    }

    fn test_controller() -> (ReplicationController, Arc<FlushCountingDispatcher>) {
        let dispatcher = Arc::new(FlushCountingDispatcher::default());
        let controller = ReplicationController::new(
            ReplicationConfig::default(),
            dispatcher.clone(),
            Arc::new(NullLoaderFactory),
        );
        (controller, dispatcher)
    }

    #[tokio::test]
    async fn test_failed_attach_stays_primary() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (controller, dispatcher) = test_controller();
        let err = controller.replica_of("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ReplicaError::ConnectRefused(_)));
        assert!(!controller.is_replica().await);
        assert!(controller.info().await.is_none());

        // the flush still happened before the attach attempt
        assert_eq!(*dispatcher.flushes.lock(), 1);
    }

    #[tokio::test]
    async fn test_detach_without_replica_is_noop() {
        let (controller, _) = test_controller();
        controller.detach().await;
        assert!(!controller.is_replica().await);
    }
}
