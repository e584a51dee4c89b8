//! Storage engine seam
//!
//! The replication core never touches shard tables directly. Replayed
//! commands go through [`CommandDispatcher`], the same interface the
//! front-end connections use, with the replay flag set so the engine
//! suppresses replies and write-path side effects meant for clients.

use bytes::Bytes;
use thiserror::Error;

/// One decoded command, as the argument vector off the wire.
pub type CommandArgs = Vec<Bytes>;

/// Execution context for a dispatched command
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchContext {
    /// Set for commands replayed from the master's change stream.
    /// The engine must not generate replies and must accept writes
    /// even while the instance is in replica (read-only) mode.
    pub replaying: bool,
}

impl DispatchContext {
    /// Context for change-stream replay.
    pub fn replay() -> Self {
        Self { replaying: true }
    }
}

/// Error from the storage engine while executing a command
#[derive(Debug, Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Command execution interface of the storage engine
pub trait CommandDispatcher: Send + Sync {
    /// Execute one command.
    fn dispatch(&self, args: CommandArgs, ctx: &DispatchContext) -> Result<(), DispatchError>;

    /// Drop every key in every shard. Called when the instance enters
    /// replica mode and before each legacy full sync, so a sync attempt
    /// always starts from empty storage.
    fn flush_all(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        commands: Mutex<Vec<CommandArgs>>,
    }

    impl CommandDispatcher for RecordingDispatcher {
        fn dispatch(&self, args: CommandArgs, ctx: &DispatchContext) -> Result<(), DispatchError> {
            assert!(ctx.replaying);
            self.commands.lock().push(args);
            Ok(())
        }

        fn flush_all(&self) {
            self.commands.lock().clear();
        }
    }

    #[test]
    fn test_replay_context() {
        let ctx = DispatchContext::replay();
        assert!(ctx.replaying);
        assert!(!DispatchContext::default().replaying);
    }

    #[test]
    fn test_recording_dispatcher() {
        let dispatcher = RecordingDispatcher::default();
        dispatcher
            .dispatch(
                vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")],
                &DispatchContext::replay(),
            )
            .unwrap();
        assert_eq!(dispatcher.commands.lock().len(), 1);

        dispatcher.flush_all();
        assert!(dispatcher.commands.lock().is_empty());
    }
}
