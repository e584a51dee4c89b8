//! Replica attempt state
//!
//! Progress through one attempt is a ladder of stages. Transitions only
//! move forward within an attempt; error recovery retreats through the
//! named methods, so an accidental backward `advance` is a programming
//! error caught at the transition point rather than a silent bitmask
//! update.

use crate::error::{ReplicaError, ReplicaResult};

/// Stages of one replication attempt, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// No live control socket
    Disconnected,
    /// Control socket connected
    Connected,
    /// Handshake finished, dialect known
    Greeted,
    /// Full-state transfer in progress
    Syncing,
    /// Full-state transfer verified; streaming or ready to stream
    SyncOk,
}

/// Mutable replica state shared between the driver task and the admin
/// surface
#[derive(Debug, Clone)]
pub struct ReplicaState {
    stage: Stage,
    enabled: bool,
    paused: bool,
}

impl ReplicaState {
    /// Fresh enabled state at the bottom of the ladder.
    pub fn new() -> Self {
        Self {
            stage: Stage::Disconnected,
            enabled: true,
            paused: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Move forward to `stage`.
    pub fn advance_to(&mut self, stage: Stage) -> ReplicaResult<()> {
        if stage <= self.stage {
            return Err(ReplicaError::Fatal(format!(
                "replica stage cannot go from {:?} to {:?}",
                self.stage, stage
            )));
        }
        self.stage = stage;
        Ok(())
    }

    /// Full retreat after a failed attempt; only `enabled` survives.
    pub fn reset_attempt(&mut self) {
        self.stage = Stage::Disconnected;
    }

    /// Retreat from `SyncOk` after a stream error, keeping the earlier
    /// stages. The next sync attempt revalidates the link and performs
    /// the full reset if the socket is in fact dead.
    pub fn drop_sync(&mut self) {
        if self.stage == Stage::SyncOk {
            self.stage = Stage::Greeted;
        }
    }

    /// Disable the replica; set only by `stop`.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether the control link is up.
    pub fn link_established(&self) -> bool {
        self.stage >= Stage::Connected
    }

    /// Whether a full-state transfer is running right now.
    pub fn sync_in_progress(&self) -> bool {
        self.stage == Stage::Syncing
    }
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of replica status for the server's INFO section
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub host: String,
    pub port: u16,
    pub link_established: bool,
    pub sync_in_progress: bool,
    pub seconds_since_last_io: u64,
}
