//! Replication client for EmberDB
//!
//! Makes a freshly started instance a replica of a designated master:
//! - Control-connection handshake with dialect classification
//! - Legacy dialect: PSYNC full transfer + change stream with acks
//! - Multi-flow dialect: parallel per-flow snapshot fragments with a
//!   control-connection rendezvous
//! - Outer reconnect loop restarting from the earliest failed stage
//! - Stop / pause / info administrative surface

pub mod handshake;
pub mod legacy;
pub mod master;
pub mod multiflow;
pub mod state;
pub mod supervisor;

pub use handshake::Greeting;
pub use master::{Dialect, FlowDescriptor, FullSyncHeader, MasterContext, REPL_ID_LEN};
pub use state::{ReplicaInfo, ReplicaState, Stage};
pub use supervisor::Replica;
