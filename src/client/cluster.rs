//! Cluster client facade
//!
//! Owns the router, one connection pool per node, and the replication
//! coordinator, and exposes the data-plane operations. Mutating
//! single-key operations replicate across the partition's replica set;
//! reads, counters, and batches go to the primary only.
//!
//! Counter operations (`incr`/`decr`) are deliberately not replicated:
//! read-modify-write cannot be mirrored safely without consensus, so
//! they hit the primary and may diverge across replicas under
//! concurrent writers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::protocol::{codec, Request, Response};

use super::pool::{NodePool, PoolConfig};
use super::replication::{send_to_node, ReplicationCoordinator};
use super::router::{PartitionRouter, Topology};
use super::{ClientError, ClientResult, NodeId};

/// Default client-side partition count. Must agree across every client
/// of one cluster.
pub const DEFAULT_PARTITIONS: u32 = 256;

/// Client tuning parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Logical partition count
    pub partitions: u32,

    /// Per-node pool parameters
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            pool: PoolConfig::default(),
        }
    }
}

/// Partition-aware client for a Flin cluster.
pub struct ClusterClient {
    router: PartitionRouter,
    pools: Arc<HashMap<NodeId, Arc<NodePool>>>,
    coordinator: ReplicationCoordinator,
}

impl ClusterClient {
    /// Build a client over a cluster topology.
    pub fn new(topology: Topology, config: ClientConfig) -> ClientResult<Self> {
        let router = PartitionRouter::new(topology.clone(), config.partitions)?;
        let mut pools = HashMap::with_capacity(topology.nodes.len());
        for node in &topology.nodes {
            pools.insert(
                node.id.clone(),
                NodePool::new(node.addr.clone(), config.pool.clone()),
            );
        }
        let pools = Arc::new(pools);
        let coordinator = ReplicationCoordinator::new(Arc::clone(&pools));
        Ok(Self {
            router,
            pools,
            coordinator,
        })
    }

    /// Build a client for one node owning every partition.
    pub fn single(addr: impl Into<String>, config: ClientConfig) -> ClientResult<Self> {
        let topology = Topology::single_node("node-1", addr, config.partitions);
        Self::new(topology, config)
    }

    /// The router, for topology inspection and updates.
    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    /// Close every pool. In-flight operations fail over to errors.
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }

    fn pool(&self, node: &str) -> ClientResult<Arc<NodePool>> {
        self.pools
            .get(node)
            .cloned()
            .ok_or_else(|| ClientError::NodeNotFound(node.to_string()))
    }

    /// Send a request to the primary owning `routing_key`.
    async fn on_primary(&self, routing_key: &[u8], request: &Request) -> ClientResult<Response> {
        let assignment = self.router.route(routing_key)?;
        let pool = self.pool(&assignment.primary)?;
        let frame = codec::encode_request(request);
        send_to_node(&pool, &frame).await
    }

    /// Replicate a mutating request across the replica set owning `key`.
    async fn replicated(&self, key: &[u8], request: &Request) -> ClientResult<Response> {
        let assignment = self.router.route(key)?;
        let targets = assignment.replica_set();
        let frame = codec::encode_request(request);
        if targets.len() == 1 {
            let pool = self.pool(&targets[0])?;
            return send_to_node(&pool, &frame).await;
        }
        self.coordinator.replicate(&targets, frame).await
    }

    /// Write one key with quorum replication.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let request = Request::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        expect_ok(self.replicated(key, &request).await?)
    }

    /// Read one key from its partition primary.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let request = Request::Get { key: key.to_vec() };
        match self.on_primary(key, &request).await? {
            Response::Ok(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            Response::Error(message) => Err(ClientError::Server(message)),
            Response::Multi(_) => Err(unexpected("multi response to get")),
        }
    }

    /// Delete one key with quorum replication.
    pub async fn delete(&self, key: &[u8]) -> ClientResult<()> {
        let request = Request::Delete { key: key.to_vec() };
        expect_ok(self.replicated(key, &request).await?)
    }

    /// Presence check on the partition primary.
    pub async fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        let request = Request::Exists { key: key.to_vec() };
        match self.on_primary(key, &request).await? {
            Response::Ok(payload) if payload.len() == 1 => Ok(payload[0] != 0),
            Response::Error(message) => Err(ClientError::Server(message)),
            _ => Err(unexpected("malformed exists response")),
        }
    }

    /// Increment a counter on the partition primary.
    pub async fn incr(&self, key: &[u8]) -> ClientResult<i64> {
        self.counter(key, Request::Incr { key: key.to_vec() }).await
    }

    /// Decrement a counter on the partition primary.
    pub async fn decr(&self, key: &[u8]) -> ClientResult<i64> {
        self.counter(key, Request::Decr { key: key.to_vec() }).await
    }

    async fn counter(&self, key: &[u8], request: Request) -> ClientResult<i64> {
        match self.on_primary(key, &request).await? {
            Response::Ok(payload) if payload.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload);
                Ok(i64::from_be_bytes(buf))
            }
            Response::Error(message) => Err(ClientError::Server(message)),
            _ => Err(unexpected("malformed counter response")),
        }
    }

    /// Write many pairs. Keys are grouped by partition and each group
    /// goes to its primary as one batch; there is no replication and no
    /// atomicity across partitions.
    pub async fn set_many(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> ClientResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut by_primary: HashMap<NodeId, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
        for (key, value) in pairs {
            let assignment = self.router.route(key)?;
            by_primary
                .entry(assignment.primary)
                .or_default()
                .push((key.clone(), value.clone()));
        }
        self.fan_out_batches(by_primary, |group| Request::SetMany { pairs: group })
            .await
    }

    /// Read many keys, preserving input order.
    pub async fn get_many(&self, keys: &[Vec<u8>]) -> ClientResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_primary: HashMap<NodeId, Vec<(usize, Vec<u8>)>> = HashMap::new();
        for (position, key) in keys.iter().enumerate() {
            let assignment = self.router.route(key)?;
            by_primary
                .entry(assignment.primary)
                .or_default()
                .push((position, key.clone()));
        }

        let mut join_set = JoinSet::new();
        for (node, group) in by_primary {
            let pool = self.pool(&node)?;
            join_set.spawn(async move {
                let positions: Vec<usize> = group.iter().map(|(p, _)| *p).collect();
                let request = Request::GetMany {
                    keys: group.into_iter().map(|(_, k)| k).collect(),
                };
                let frame = codec::encode_request(&request);
                let response = send_to_node(&pool, &frame).await;
                (positions, response)
            });
        }

        let mut results = vec![None; keys.len()];
        while let Some(joined) = join_set.join_next().await {
            let (positions, response) = joined
                .map_err(|e| ClientError::Connection(format!("batch task failed: {e}")))?;
            match response? {
                Response::Multi(values) => {
                    if values.len() != positions.len() {
                        return Err(unexpected("multi response length mismatch"));
                    }
                    for (position, value) in positions.into_iter().zip(values) {
                        results[position] = value;
                    }
                }
                Response::Error(message) => return Err(ClientError::Server(message)),
                _ => return Err(unexpected("non-multi response to get_many")),
            }
        }
        Ok(results)
    }

    /// Delete many keys, grouped by partition primary.
    pub async fn delete_many(&self, keys: &[Vec<u8>]) -> ClientResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut by_primary: HashMap<NodeId, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            let assignment = self.router.route(key)?;
            by_primary
                .entry(assignment.primary)
                .or_default()
                .push(key.clone());
        }
        self.fan_out_batches(by_primary, |group| Request::DeleteMany { keys: group })
            .await
    }

    async fn fan_out_batches<T: Send + 'static>(
        &self,
        by_primary: HashMap<NodeId, Vec<T>>,
        build: impl Fn(Vec<T>) -> Request,
    ) -> ClientResult<()> {
        let mut join_set = JoinSet::new();
        for (node, group) in by_primary {
            let pool = self.pool(&node)?;
            let frame = codec::encode_request(&build(group));
            join_set.spawn(async move { send_to_node(&pool, &frame).await });
        }
        while let Some(joined) = join_set.join_next().await {
            let response = joined
                .map_err(|e| ClientError::Connection(format!("batch task failed: {e}")))??;
            expect_ok(response)?;
        }
        Ok(())
    }

    /// Append to a queue. Queue operations route by queue name and
    /// replicate like single-key writes.
    pub async fn queue_push(&self, name: &str, value: &[u8]) -> ClientResult<()> {
        let request = Request::QueuePush {
            name: name.to_string(),
            value: value.to_vec(),
        };
        expect_ok(self.replicated(name.as_bytes(), &request).await?)
    }

    /// Take the queue head. `None` when the queue is empty.
    pub async fn queue_pop(&self, name: &str) -> ClientResult<Option<Vec<u8>>> {
        let request = Request::QueuePop {
            name: name.to_string(),
        };
        match self.on_primary(name.as_bytes(), &request).await? {
            Response::Ok(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            Response::Error(message) => Err(ClientError::Server(message)),
            Response::Multi(_) => Err(unexpected("multi response to queue_pop")),
        }
    }

    /// Read the queue head without removing it.
    pub async fn queue_peek(&self, name: &str) -> ClientResult<Option<Vec<u8>>> {
        let request = Request::QueuePeek {
            name: name.to_string(),
        };
        match self.on_primary(name.as_bytes(), &request).await? {
            Response::Ok(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            Response::Error(message) => Err(ClientError::Server(message)),
            Response::Multi(_) => Err(unexpected("multi response to queue_peek")),
        }
    }

    /// Queue length.
    pub async fn queue_len(&self, name: &str) -> ClientResult<u64> {
        let request = Request::QueueLen {
            name: name.to_string(),
        };
        match self.on_primary(name.as_bytes(), &request).await? {
            Response::Ok(payload) if payload.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload);
                Ok(u64::from_be_bytes(buf))
            }
            Response::Error(message) => Err(ClientError::Server(message)),
            _ => Err(unexpected("malformed queue_len response")),
        }
    }

    /// Remove every item from a queue.
    pub async fn queue_clear(&self, name: &str) -> ClientResult<()> {
        let request = Request::QueueClear {
            name: name.to_string(),
        };
        expect_ok(self.replicated(name.as_bytes(), &request).await?)
    }
}

fn expect_ok(response: Response) -> ClientResult<()> {
    match response {
        Response::Ok(_) => Ok(()),
        Response::Error(message) => Err(ClientError::Server(message)),
        Response::NotFound => Ok(()),
        Response::Multi(_) => Err(unexpected("unexpected multi response")),
    }
}

fn unexpected(context: &str) -> ClientError {
    ClientError::Server(format!("protocol violation: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_builds_full_partition_map() {
        // Construction only; no I/O happens until an operation runs.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let client = ClusterClient::single("127.0.0.1:7380", ClientConfig::default()).unwrap();
            let topology = client.router().topology();
            assert_eq!(topology.nodes.len(), 1);
            assert_eq!(topology.partitions.len(), DEFAULT_PARTITIONS as usize);
            client.close();
        });
    }

    #[test]
    fn test_unknown_node_surfaces_as_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let client = ClusterClient::single("127.0.0.1:7380", ClientConfig::default()).unwrap();
            assert!(matches!(
                client.pool("ghost"),
                Err(ClientError::NodeNotFound(_))
            ));
            client.close();
        });
    }
}
