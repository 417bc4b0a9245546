use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

/// Identifier of a cluster node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn random() -> NodeId {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic counter naming a cluster-membership snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct TopologyVersion(pub u64);

/// Identifier of a cache (one partitioned/replicated key-value table).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CacheId(pub i32);

/// Software version advertised by a node; used for feature pre-flight.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct NodeVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl NodeVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> NodeVersion {
        NodeVersion {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Oldest node version that executes DML on the server side; older nodes
/// force the caller back onto client-side DML.
pub const MIN_SERVER_DML_VERSION: NodeVersion = NodeVersion::new(2, 3, 0);

/// Read-only view of cluster membership, maintained by the discovery
/// service outside this crate.
#[async_trait]
pub trait ClusterView: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn is_alive(&self, node: NodeId) -> bool;

    /// `None` when the node is unknown (already departed).
    fn node_version(&self, node: NodeId) -> Option<NodeVersion>;

    /// Latest topology version for which affinity is ready.
    fn ready_topology(&self) -> TopologyVersion;

    /// Resolves once the ready topology reaches `at_least`.
    async fn await_topology(&self, at_least: TopologyVersion);

    /// Configured query parallelism of a cache (segments per node).
    fn cache_parallelism(&self, _cache: CacheId) -> usize {
        1
    }
}

/// Arguments for one partition-mapping request.
pub struct MappingRequest<'a> {
    pub caches: &'a [CacheId],
    pub topology: TopologyVersion,
    /// Explicit partition pinning requested by the caller.
    pub partitions: Option<&'a [u32]>,
    pub replicated_only: bool,
}

/// Result of partition mapping for one topology version.
#[derive(Clone, Debug, Default)]
pub struct PartitionMapping {
    /// Nodes that own at least one partition of the queried caches.
    pub nodes: Vec<NodeId>,
    /// Per-node partitions the map side must reserve.
    pub partitions: HashMap<NodeId, Vec<u32>>,
    /// Per-node partitions the map queries must restrict themselves to
    /// (present only when the caller pinned explicit partitions).
    pub query_partitions: HashMap<NodeId, Vec<u32>>,
}

impl PartitionMapping {
    /// Mapping for a `local` query: everything runs on this node.
    pub fn local(node: NodeId) -> PartitionMapping {
        PartitionMapping {
            nodes: vec![node],
            ..Default::default()
        }
    }
}

/// Maps caches onto data-owning nodes for one topology version.
///
/// Returns `None` while the topology is unstable (a rebalance is moving
/// partitions); the coordinator then retries on a later version.
pub trait PartitionMapper: Send + Sync {
    fn map(&self, req: &MappingRequest<'_>) -> Option<PartitionMapping>;
}
