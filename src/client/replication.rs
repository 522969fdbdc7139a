//! Quorum replication
//!
//! Fans a mutating request out to every node owning the partition and
//! applies majority acceptance. The fan-out never short-circuits: every
//! sub-request runs to completion so no in-flight write is abandoned,
//! then successes are counted against `floor(R/2) + 1`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::protocol::{codec, Response};

use super::pool::NodePool;
use super::{ClientError, ClientResult, NodeId};

/// Majority threshold for a replica set of `total` nodes.
pub fn quorum_size(total: usize) -> usize {
    total / 2 + 1
}

/// Result of one quorum fan-out.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Nodes that accepted the write
    pub successes: usize,
    /// Size of the replica set
    pub total: usize,
    /// A successful response, when at least one node accepted
    pub response: Option<Response>,
}

impl WriteOutcome {
    /// True when a majority accepted.
    pub fn quorum_met(&self) -> bool {
        self.successes >= quorum_size(self.total)
    }
}

/// Coordinator issuing the same request to a whole replica set.
pub struct ReplicationCoordinator {
    pools: Arc<HashMap<NodeId, Arc<NodePool>>>,
}

impl ReplicationCoordinator {
    /// Build a coordinator over the client's per-node pools.
    pub fn new(pools: Arc<HashMap<NodeId, Arc<NodePool>>>) -> Self {
        Self { pools }
    }

    /// Send `frame` to every node in `targets` concurrently and apply
    /// quorum acceptance.
    ///
    /// Each sub-request checks out its own connection, so one slow node
    /// cannot block the others beyond its own timeout. All sub-requests
    /// are awaited before the verdict.
    pub async fn replicate(&self, targets: &[NodeId], frame: Vec<u8>) -> ClientResult<Response> {
        if targets.is_empty() {
            return Err(ClientError::InvalidTopology(
                "empty replica set".to_string(),
            ));
        }

        let mut join_set = JoinSet::new();
        for node in targets {
            let pool = self
                .pools
                .get(node)
                .cloned()
                .ok_or_else(|| ClientError::NodeNotFound(node.clone()))?;
            let frame = frame.clone();
            let node = node.clone();
            join_set.spawn(async move {
                let result = send_to_node(&pool, &frame).await;
                (node, result)
            });
        }

        let total = targets.len();
        let mut successes = 0usize;
        let mut first_success: Option<Response> = None;
        let mut last_error = String::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((node, Ok(response))) => match response {
                    Response::Error(message) => {
                        log::debug!("replica {node} rejected write: {message}");
                        last_error = format!("{node}: {message}");
                    }
                    accepted => {
                        successes += 1;
                        if first_success.is_none() {
                            first_success = Some(accepted);
                        }
                    }
                },
                Ok((node, Err(err))) => {
                    log::debug!("replica {node} failed: {err}");
                    last_error = format!("{node}: {err}");
                }
                Err(err) => {
                    last_error = format!("fan-out task failed: {err}");
                }
            }
        }

        let outcome = WriteOutcome {
            successes,
            total,
            response: first_success,
        };
        if outcome.quorum_met() {
            // A met quorum implies at least one success to report.
            outcome
                .response
                .ok_or_else(|| ClientError::Server("quorum met without a response".to_string()))
        } else {
            Err(ClientError::QuorumFailed {
                successes: outcome.successes,
                total: outcome.total,
                last_error: if last_error.is_empty() {
                    "no error recorded".to_string()
                } else {
                    last_error
                },
            })
        }
    }
}

/// One sub-request: check out, roundtrip, return or recycle.
pub(super) async fn send_to_node(pool: &NodePool, frame: &[u8]) -> ClientResult<Response> {
    let mut conn = pool.get().await?;
    match conn.roundtrip(frame).await {
        Ok((status, payload)) => {
            pool.put(conn).await;
            Ok(codec::decode_response(status, &payload)?)
        }
        Err(err) => {
            pool.recycle(conn);
            Err(err)
        }
    }
}
