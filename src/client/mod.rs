//! # Cluster Client
//!
//! Partition-aware client for a cluster of Flin nodes. Keys hash to
//! logical partitions; a topology maps each partition to a primary node
//! and optional replicas. Mutating single-key operations fan out to the
//! whole replica set and succeed on a majority; reads and batches go to
//! primaries only.

use thiserror::Error;

use crate::protocol::ProtocolError;

mod cluster;
mod pool;
mod replication;
mod router;

pub use cluster::{ClientConfig, ClusterClient};
pub use pool::{FramedConn, NodePool, PoolConfig, PoolStats};
pub use replication::{quorum_size, ReplicationCoordinator, WriteOutcome};
pub use router::{NodeInfo, PartitionAssignment, PartitionRouter, RouterStats, Topology};

/// Node identifier, matching the server's `node_id`.
pub type NodeId = String;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Read or write deadline exceeded
    #[error("operation timed out")]
    Timeout,

    /// Connection could not be established or has failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Topology has no entry for this node
    #[error("node not found in topology: {0}")]
    NodeNotFound(NodeId),

    /// Topology has no assignment for this partition
    #[error("partition {0} is unmapped")]
    PartitionUnmapped(u32),

    /// Server returned an error status
    #[error("server error: {0}")]
    Server(String),

    /// Fewer than a majority of replicas accepted a write
    #[error("quorum failed: {successes}/{total} accepted (last error: {last_error})")]
    QuorumFailed {
        /// Replicas that accepted the write
        successes: usize,
        /// Size of the replica set
        total: usize,
        /// Most recent failure observed during the fan-out
        last_error: String,
    },

    /// Topology is structurally invalid
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Operation on a closed client or pool
    #[error("client is closed")]
    Closed,
}

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;
