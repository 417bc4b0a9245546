//! Semantic contract of the messages exchanged with the map side. The wire
//! format lives in the messaging layer; the coordinator only manipulates
//! these shapes.

use std::time::Duration;

use num_enum::TryFromPrimitive;
use uuid::Uuid;

use crate::engine::MvccSnapshot;
use crate::row::{Row, Value};

use super::cluster::{CacheId, NodeId, TopologyVersion};

/// Per-query flags forwarded to the map executors.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryFlags {
    /// Always set on the map side so join order stays deterministic there.
    pub enforce_join_order: bool,
    pub distributed_joins: bool,
    pub local: bool,
    pub explain: bool,
    pub replicated: bool,
    /// Lazy map execution is only safe with a single map query.
    pub lazy: bool,
}

/// Transaction details attached per recipient for SELECT FOR UPDATE.
#[derive(Clone, Debug)]
pub struct TxRequestMeta {
    pub xid: Uuid,
    /// Fresh id per outbound request.
    pub request_id: Uuid,
    /// Monotonically increasing per-run counter, orders lock requests.
    pub order: u64,
    pub thread_id: u64,
    pub subject: Uuid,
    pub task_name_hash: i32,
    pub client_first: bool,
    pub remaining: Option<Duration>,
}

/// Fan-out request starting one map query execution per node.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub req_id: u64,
    pub topology: TopologyVersion,
    pub page_size: usize,
    pub cache_ids: Vec<CacheId>,
    /// Table list, attached only when distributed joins are enabled.
    pub tables: Option<Vec<String>>,
    /// Map query texts; already EXPLAIN-wrapped for explain runs.
    pub queries: Vec<String>,
    pub params: Vec<Value>,
    /// Node-specific partition restriction, filled by specialization.
    pub partitions: Option<Vec<u32>>,
    pub flags: QueryFlags,
    pub timeout: Option<Duration>,
    pub schema: String,
    pub mvcc: Option<MvccSnapshot>,
    /// Node-specific SELECT FOR UPDATE details, filled by specialization.
    pub tx: Option<TxRequestMeta>,
}

/// Pulls the next page of one (map query, segment) stream.
#[derive(Clone, Debug)]
pub struct NextPageRequest {
    pub req_id: u64,
    pub query: usize,
    pub segment: u32,
    pub page_size: usize,
    pub data_page_scan: Option<bool>,
}

/// Releases all map-side resources of a run.
#[derive(Clone, Debug)]
pub struct QueryCancelRequest {
    pub req_id: u64,
}

/// Fan-out request for a distributed DML statement.
#[derive(Clone, Debug)]
pub struct DmlRequest {
    pub req_id: u64,
    pub topology: TopologyVersion,
    pub cache_ids: Vec<CacheId>,
    pub schema: String,
    pub statement: String,
    pub params: Vec<Value>,
    pub partitions: Option<Vec<u32>>,
    pub flags: QueryFlags,
    pub timeout: Option<Duration>,
}

/// Everything the reducer sends towards the map side.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    Query(QueryRequest),
    NextPage(NextPageRequest),
    Cancel(QueryCancelRequest),
    Dml(DmlRequest),
}

/// Map-side request to re-run the attempt on a newer topology.
#[derive(Clone, Debug)]
pub struct RetryRequest {
    pub topology: TopologyVersion,
    pub cause: String,
}

/// One page of partial results from a (node, map query, segment) stream.
#[derive(Clone, Debug)]
pub struct NextPageResponse {
    pub req_id: u64,
    pub query: usize,
    pub segment: u32,
    pub page_no: u32,
    pub rows: Vec<Row>,
    pub last: bool,
    pub retry: Option<RetryRequest>,
    /// Total locked-row count, present for SELECT FOR UPDATE streams.
    pub all_rows: Option<u64>,
    pub remove_mapping: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FailCode {
    General = 0,
    CancelledByOriginator = 1,
}

/// Map-side failure report for a whole run.
#[derive(Clone, Debug)]
pub struct FailResponse {
    pub req_id: u64,
    pub code: FailCode,
    pub message: String,
}

/// Per-node result of a distributed DML request.
#[derive(Clone, Debug)]
pub struct DmlResponse {
    pub req_id: u64,
    pub affected: u64,
    pub error: Option<String>,
}

/// Everything the reducer receives from the map side.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    NextPage(NextPageResponse),
    Fail(FailResponse),
    Dml(DmlResponse),
}

/// Key of one page stream inside a merge index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceKey {
    pub node: NodeId,
    pub segment: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_code_from_wire_value() {
        assert_eq!(FailCode::try_from(0u8).unwrap(), FailCode::General);
        assert_eq!(
            FailCode::try_from(1u8).unwrap(),
            FailCode::CancelledByOriginator
        );
        assert!(FailCode::try_from(7u8).is_err());
    }
}
