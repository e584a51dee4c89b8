//! Replication client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the replication client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Delay before each reconnect attempt
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,

    /// Timeout for the TCP connect to the master
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Delay after the first legacy full sync before the first ack.
    /// Legacy masters have a window where an immediate `ACK 0` is
    /// silently discarded; this delay narrows it.
    #[serde(with = "duration_ms")]
    pub first_ack_delay: Duration,

    /// Ack after this many unacknowledged stream bytes
    pub ack_bytes_threshold: u64,

    /// Ack at least this often regardless of byte count
    #[serde(with = "duration_ms")]
    pub ack_interval: Duration,

    /// Read buffer size for the change-stream consumer
    pub stream_buffer_bytes: usize,

    /// Number of starter tasks the multi-flow driver partitions flows
    /// across. `None` means available parallelism.
    pub worker_count: Option<usize>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
            first_ack_delay: Duration::from_millis(50),
            ack_bytes_threshold: 1024,
            ack_interval: Duration::from_secs(5),
            stream_buffer_bytes: 16 * 1024,
            worker_count: None,
        }
    }
}

impl ReplicationConfig {
    /// Resolved worker count for flow partitioning.
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.first_ack_delay, Duration::from_millis(50));
        assert_eq!(config.ack_bytes_threshold, 1024);
        assert_eq!(config.ack_interval, Duration::from_secs(5));
        assert_eq!(config.stream_buffer_bytes, 16 * 1024);
    }

    #[test]
    fn test_worker_count_floor() {
        let config = ReplicationConfig {
            worker_count: Some(0),
            ..Default::default()
        };
        assert_eq!(config.effective_worker_count(), 1);
    }

}
