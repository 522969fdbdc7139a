//! Partition routing
//!
//! Maps keys to logical partitions by FNV-1a (32-bit) modulo the
//! partition count, and partitions to nodes through a topology snapshot.
//! Topology updates swap the whole snapshot under a write lock, so a
//! reader always sees a coherent `(nodes, partition_map)` pair.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::fnv1a_32;

use super::{ClientError, ClientResult, NodeId};

/// One node in the cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier
    pub id: NodeId,
    /// Address of the node's binary-protocol listener, `host:port`
    pub addr: String,
}

/// Ownership of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Node serving single-target reads and batch writes
    pub primary: NodeId,
    /// Nodes mirroring quorum writes
    #[serde(default)]
    pub replicas: Vec<NodeId>,
}

impl PartitionAssignment {
    /// Primary plus replicas, primary first, without duplicates.
    pub fn replica_set(&self) -> Vec<NodeId> {
        let mut set = Vec::with_capacity(1 + self.replicas.len());
        set.push(self.primary.clone());
        for replica in &self.replicas {
            if !set.contains(replica) {
                set.push(replica.clone());
            }
        }
        set
    }
}

/// A whole-cluster view: nodes plus the partition map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// All known nodes
    pub nodes: Vec<NodeInfo>,
    /// Partition id to owning nodes
    pub partitions: HashMap<u32, PartitionAssignment>,
}

impl Topology {
    /// Topology for a single node owning every partition, the common
    /// benchmarking configuration.
    pub fn single_node(
        id: impl Into<NodeId>,
        addr: impl Into<String>,
        partition_count: u32,
    ) -> Self {
        let id = id.into();
        let mut partitions = HashMap::with_capacity(partition_count as usize);
        for partition in 0..partition_count {
            partitions.insert(
                partition,
                PartitionAssignment {
                    primary: id.clone(),
                    replicas: Vec::new(),
                },
            );
        }
        Self {
            nodes: vec![NodeInfo {
                id,
                addr: addr.into(),
            }],
            partitions,
        }
    }

    /// Load a topology from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ClientError::InvalidTopology(e.to_string()))
    }

    /// Address of a node by id.
    pub fn node_addr(&self, id: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .map(|node| node.addr.as_str())
    }

    /// Check that every partition references known nodes.
    pub fn validate(&self) -> ClientResult<()> {
        if self.nodes.is_empty() {
            return Err(ClientError::InvalidTopology("no nodes".to_string()));
        }
        for (partition, assignment) in &self.partitions {
            for node in assignment.replica_set() {
                if self.node_addr(&node).is_none() {
                    return Err(ClientError::InvalidTopology(format!(
                        "partition {partition} references unknown node {node}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Counter snapshot for the router.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Successful partition lookups
    pub lookups: u64,
    /// Lookups that hit an unmapped partition
    pub misses: u64,
}

/// Key-to-node router over a swappable topology snapshot.
pub struct PartitionRouter {
    partition_count: u32,
    topology: RwLock<Arc<Topology>>,
    stats: RwLock<RouterStats>,
}

impl PartitionRouter {
    /// Build a router with a fixed partition count. The count must agree
    /// across every client of the cluster.
    pub fn new(topology: Topology, partition_count: u32) -> ClientResult<Self> {
        if partition_count == 0 {
            return Err(ClientError::InvalidTopology(
                "partition count must be at least 1".to_string(),
            ));
        }
        topology.validate()?;
        Ok(Self {
            partition_count,
            topology: RwLock::new(Arc::new(topology)),
            stats: RwLock::new(RouterStats::default()),
        })
    }

    /// Number of logical partitions.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition a key routes to. Deterministic for a fixed count.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        fnv1a_32(key) % self.partition_count
    }

    /// Owning nodes for a key.
    pub fn route(&self, key: &[u8]) -> ClientResult<PartitionAssignment> {
        self.assignment(self.partition_for(key))
    }

    /// Owning nodes for a partition.
    pub fn assignment(&self, partition: u32) -> ClientResult<PartitionAssignment> {
        let topology = self.topology.read();
        match topology.partitions.get(&partition) {
            Some(assignment) => {
                self.stats.write().lookups += 1;
                Ok(assignment.clone())
            }
            None => {
                self.stats.write().misses += 1;
                Err(ClientError::PartitionUnmapped(partition))
            }
        }
    }

    /// Address of a node by id.
    pub fn node_addr(&self, id: &str) -> ClientResult<String> {
        self.topology
            .read()
            .node_addr(id)
            .map(str::to_string)
            .ok_or_else(|| ClientError::NodeNotFound(id.to_string()))
    }

    /// Replace the topology with a new snapshot. Readers in flight keep
    /// the old snapshot; new lookups see the new one.
    pub fn update_topology(&self, topology: Topology) -> ClientResult<()> {
        topology.validate()?;
        *self.topology.write() = Arc::new(topology);
        Ok(())
    }

    /// Deep copy of the current topology.
    pub fn topology(&self) -> Topology {
        self.topology.read().as_ref().clone()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RouterStats {
        self.stats.read().clone()
    }
}
