use thiserror::Error;

use super::cluster::NodeId;

/// Error that terminated a reduce query or a distributed update.
///
/// The variants mirror the failure surface of the coordinator: planning
/// rejections, mapping retries that ran out of budget, failures reported by
/// map nodes, and local conditions such as cancellation or a client
/// disconnect.
#[derive(Error, Debug, Clone)]
pub enum ReduceError {
    /// The retry loop exceeded the retry timeout while the partition mapping
    /// kept changing under it.
    #[error("Failed to map SQL query to topology, retry timed out [node={node:?}, cause={cause}]")]
    RetryExhausted {
        node: Option<NodeId>,
        cause: String,
    },

    /// The caller cancelled the query, or a map node reported it as
    /// cancelled by the originator.
    #[error("The query was cancelled while executing")]
    Cancelled,

    /// A map node reported a non-cancellation failure.
    #[error("Failed to execute map query on node {node}: {message}")]
    MapNodeFailed { node: NodeId, message: String },

    /// The current attempt has to be retried; surfaced to the consumer only
    /// when it happens after the result iterator was handed out.
    #[error("The query needs to be retried [node={node:?}, cause={cause}]")]
    RetryNeeded {
        node: Option<NodeId>,
        cause: String,
    },

    /// The local client node disconnected from the cluster.
    #[error("Client node disconnected, running queries were failed")]
    Disconnected,

    /// The server topology moved while the transaction held a locked
    /// topology version; the caller must roll back and retry.
    #[error("Server topology is changed during query execution inside a transaction, the transaction must be rolled back and retried")]
    TransactionTopologyChanged,

    /// Explicit partitions were combined with a purely replicated plan.
    #[error("Partitions are not supported for replicated caches")]
    ReplicatedWithPartitions,

    /// Partition mapping failed outside the retry loop (distributed DML).
    #[error("Failed to map update query to topology: {0}")]
    MappingFailed(String),

    /// The request could not be delivered to one or more nodes.
    #[error("Failed to send request to nodes: {0}")]
    SendFailed(String),

    /// The local SQL engine failed while executing the reduce query.
    #[error("Reduce query execution failed: {0}")]
    Engine(String),

    /// The query was rejected at planning time.
    #[error("Failed to plan reduce query: {0}")]
    Planning(String),
}

impl ReduceError {
    /// True for errors that terminate a run for good; retriable conditions
    /// never reach the caller as errors.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReduceError::RetryNeeded { .. })
    }
}

/// A single failed delivery, as reported by the messaging layer.
#[derive(Error, Debug)]
#[error("failed to deliver message to node {node}: {reason}")]
pub struct SendError {
    pub node: NodeId,
    pub reason: String,
}
