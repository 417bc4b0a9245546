pub mod adapter;
pub mod cluster;
pub mod errors;
pub mod messages;
pub mod metrics;

pub use adapter::{MapExecutor, MessageAdapter, Specializer, Transport};
pub use cluster::{
    CacheId, ClusterView, MappingRequest, NodeId, NodeVersion, PartitionMapper, PartitionMapping,
    TopologyVersion, MIN_SERVER_DML_VERSION,
};
pub use errors::{ReduceError, SendError};
pub use metrics::{MetricsView, ReducerMetrics};
