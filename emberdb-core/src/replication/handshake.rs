//! Control-connection greeting
//!
//! Speaks the capability sub-protocol on a fresh control socket and
//! classifies the peer. Single-use: a failed step leaves the socket
//! unusable and the supervisor retries from the connect stage.

use super::master::{Dialect, MAX_FLOW_COUNT, REPL_ID_LEN};
use crate::conn::MasterConnection;
use crate::error::{ReplicaError, ReplicaResult};
use crate::resp::RespValue;
use tracing::{debug, warn};

/// Outcome of a successful greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    /// Peer answered the probe with a plain `OK`.
    Legacy,
    /// Peer announced a replication session with parallel flows.
    MultiFlow {
        master_repl_id: String,
        session_id: String,
        flow_count: u32,
    },
}

impl Greeting {
    pub fn dialect(&self) -> Dialect {
        match self {
            Greeting::Legacy => Dialect::Legacy,
            Greeting::MultiFlow {
                session_id,
                flow_count,
                ..
            } => Dialect::MultiFlow {
                session_id: session_id.clone(),
                flow_count: *flow_count,
            },
        }
    }
}

/// Run the greeting sequence on the control connection.
pub async fn greet(conn: &mut MasterConnection) -> ReplicaResult<Greeting> {
    conn.send_command("PING").await?;
    expect_text(conn.read_value().await?, "PONG")?;

    conn.send_command("REPLCONF capa eof capa psync2").await?;
    expect_text(conn.read_value().await?, "OK")?;

    // The dialect probe: a legacy master acknowledges the unknown
    // capability, a multi-flow master announces its session instead.
    conn.send_command("REPLCONF capa dragonfly").await?;
    let reply = conn.read_value().await?;

    match reply {
        ref ok if ok.is_text("OK") => {
            debug!("master speaks the legacy dialect");
            Ok(Greeting::Legacy)
        }
        RespValue::Array(items) if items.len() == 3 => classify_multiflow(items),
        other => {
            warn!("unexpected dialect probe reply: {:?}", other);
            Err(ReplicaError::BadMessage(
                "unexpected reply to the capability probe".into(),
            ))
        }
    }
}

fn classify_multiflow(items: Vec<RespValue>) -> ReplicaResult<Greeting> {
    let master_repl_id = items[0]
        .as_text()
        .ok_or_else(|| ReplicaError::BadMessage("session announcement id is not a string".into()))?;
    let session_id = items[1]
        .as_text()
        .ok_or_else(|| ReplicaError::BadMessage("session announcement session is not a string".into()))?;
    let flow_count = items[2]
        .as_integer()
        .ok_or_else(|| ReplicaError::BadMessage("session announcement flow count is not an integer".into()))?;

    if master_repl_id.len() != REPL_ID_LEN {
        return Err(ReplicaError::BadMessage(format!(
            "master replication id has length {}, expected {}",
            master_repl_id.len(),
            REPL_ID_LEN
        )));
    }
    if flow_count <= 0 || flow_count > MAX_FLOW_COUNT {
        return Err(ReplicaError::BadMessage(format!(
            "master announced {flow_count} flows"
        )));
    }

    debug!(
        "master speaks the multi-flow dialect: session {}, {} flows",
        session_id, flow_count
    );

    Ok(Greeting::MultiFlow {
        master_repl_id: master_repl_id.to_string(),
        session_id: session_id.to_string(),
        flow_count: flow_count as u32,
    })
}

fn expect_text(reply: RespValue, expected: &str) -> ReplicaResult<()> {
    if reply.is_text(expected) {
        Ok(())
    } else {
        warn!("expected {expected}, master replied {:?}", reply);
        Err(ReplicaError::BadMessage(format!(
            "expected {expected} from master"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_classify_multiflow_valid() {
        let id = "a".repeat(REPL_ID_LEN);
        let items = vec![
            RespValue::Bulk(Bytes::from(id.clone())),
            RespValue::Bulk(Bytes::from_static(b"sess1")),
            RespValue::Integer(4),
        ];

        match classify_multiflow(items).unwrap() {
            Greeting::MultiFlow {
                master_repl_id,
                session_id,
                flow_count,
            } => {
                assert_eq!(master_repl_id, id);
                assert_eq!(session_id, "sess1");
                assert_eq!(flow_count, 4);
            }
            Greeting::Legacy => panic!("expected multi-flow greeting"),
        }
    }

    #[test]
    fn test_classify_rejects_short_id() {
        let items = vec![
            RespValue::Bulk(Bytes::from_static(b"short")),
            RespValue::Bulk(Bytes::from_static(b"sess1")),
            RespValue::Integer(4),
        ];
        assert!(matches!(
            classify_multiflow(items),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_classify_rejects_flow_count_out_of_range() {
        let id = "a".repeat(REPL_ID_LEN);
        for bad in [0i64, -1, MAX_FLOW_COUNT + 1] {
            let items = vec![
                RespValue::Bulk(Bytes::from(id.clone())),
                RespValue::Bulk(Bytes::from_static(b"sess1")),
                RespValue::Integer(bad),
            ];
            assert!(matches!(
                classify_multiflow(items),
                Err(ReplicaError::BadMessage(_))
            ));
        }
    }

    #[test]
    fn test_greeting_dialect() {
        assert_eq!(Greeting::Legacy.dialect(), Dialect::Legacy);

        let greeting = Greeting::MultiFlow {
            master_repl_id: "x".repeat(REPL_ID_LEN),
            session_id: "s".into(),
            flow_count: 2,
        };
        assert_eq!(
            greeting.dialect(),
            Dialect::MultiFlow {
                session_id: "s".into(),
                flow_count: 2
            }
        );
    }
}
