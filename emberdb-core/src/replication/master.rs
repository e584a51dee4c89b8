//! Master identity and sync negotiation types

use crate::snapshot::EOF_TOKEN_LEN;
use std::net::SocketAddr;

/// Length of a master replication id on the wire.
pub const REPL_ID_LEN: usize = 40;

/// Most flows a multi-flow master may announce.
pub const MAX_FLOW_COUNT: i64 = 1024;

/// Which wire protocol the master speaks, decided by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    /// Single connection: PSYNC full transfer, then the command stream
    /// with periodic acks.
    Legacy,
    /// One control connection plus `flow_count` parallel data
    /// connections, one snapshot fragment each.
    MultiFlow {
        session_id: String,
        flow_count: u32,
    },
}

/// Identity and negotiated parameters of the configured master
///
/// Written by the handshake (and, for the legacy dialect, by the
/// `FULLRESYNC` header), read-only for the rest of an attempt. Flow
/// workers receive their own copy.
#[derive(Debug, Clone)]
pub struct MasterContext {
    pub host: String,
    pub port: u16,
    /// Resolved endpoint, available once a connect succeeded.
    pub endpoint: Option<SocketAddr>,
    /// 40-byte identifier of the master replication epoch; empty until
    /// learned from the handshake or sync header.
    pub master_repl_id: String,
    /// Negotiated dialect; `None` before the first successful greet.
    pub dialect: Option<Dialect>,
}

impl MasterContext {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            endpoint: None,
            master_repl_id: String::new(),
            dialect: None,
        }
    }

    /// Session id of a multi-flow master.
    pub fn session_id(&self) -> Option<&str> {
        match &self.dialect {
            Some(Dialect::MultiFlow { session_id, .. }) => Some(session_id.as_str()),
            _ => None,
        }
    }

    /// Announced flow count of a multi-flow master.
    pub fn flow_count(&self) -> u32 {
        match &self.dialect {
            Some(Dialect::MultiFlow { flow_count, .. }) => *flow_count,
            _ => 0,
        }
    }
}

/// Parsed `PSYNC` reply header: how the full transfer is framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullSyncHeader {
    /// `$<N>` — exactly `N` snapshot bytes follow.
    Sized(u64),
    /// `$EOF:<token>` — snapshot bytes until the 40-byte sentinel.
    EofToken([u8; EOF_TOKEN_LEN]),
}

/// Identity of one multi-flow data connection
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    pub flow_id: u32,
    /// Index of the starter partition that owns this flow.
    pub partition: usize,
}

/// Partition `[0, flow_count)` across `workers` starter slots by
/// `flow_id mod workers`, so each slot owns a disjoint subset for the
/// lifetime of the attempt.
pub fn partition_flows(flow_count: u32, workers: usize) -> Vec<Vec<FlowDescriptor>> {
    let workers = workers.max(1);
    let mut partition: Vec<Vec<FlowDescriptor>> = vec![Vec::new(); workers];
    for flow_id in 0..flow_count {
        let slot = flow_id as usize % workers;
        partition[slot].push(FlowDescriptor {
            flow_id,
            partition: slot,
        });
    }
    partition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let partition = partition_flows(10, 4);
        assert_eq!(partition.len(), 4);

        let mut seen = vec![false; 10];
        for (slot, flows) in partition.iter().enumerate() {
            for flow in flows {
                assert_eq!(flow.flow_id as usize % 4, slot);
                assert_eq!(flow.partition, slot);
                assert!(!seen[flow.flow_id as usize]);
                seen[flow.flow_id as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_partition_more_workers_than_flows() {
        let partition = partition_flows(2, 8);
        let total: usize = partition.iter().map(|p| p.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_context_accessors() {
        let mut ctx = MasterContext::new("db0.example".into(), 6380);
        assert!(ctx.session_id().is_none());
        assert_eq!(ctx.flow_count(), 0);

        ctx.dialect = Some(Dialect::MultiFlow {
            session_id: "sess1".into(),
            flow_count: 4,
        });
        assert_eq!(ctx.session_id(), Some("sess1"));
        assert_eq!(ctx.flow_count(), 4);
    }
}
