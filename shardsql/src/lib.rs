//! Reduce-side coordinator of a two-step distributed SQL engine.
//!
//! A two-step query splits a SQL statement into per-node *map queries* and a
//! *reduce query* combining their partial results on the originating node.
//! This crate implements the reducer: it plans the fan-out over the current
//! topology, dispatches map requests, streams paged partial results into
//! in-memory merge indexes, and either hands them to the caller directly or
//! executes the reduce SQL over merge tables on the local engine.
//!
//! The SQL engine itself, the map-side executor, discovery, messaging and
//! the partition mapper are collaborators behind traits ([`ReduceEngine`],
//! [`MapExecutor`](transport::MapExecutor), [`ClusterView`],
//! [`Transport`], [`PartitionMapper`]).
//!
//! Entry points: [`Reducer::query`] returns a streaming [`RowStream`];
//! [`Reducer::update`] fans a DML statement out and aggregates affected-row
//! counts; [`Reducer::on_message`] is the inbound demultiplexer the
//! messaging layer calls into.

pub mod engine;
pub mod merge;
pub mod reduce;
pub mod row;
pub mod statement;
pub mod transport;

pub use engine::{
    MvccSnapshot, MvccTracker, ReduceConnection, ReduceContext, ReduceEngine, RowCursor,
};
pub use merge::{merge_table_name, MergeTable, MergeTableCursor, MergeTableRegistry};
pub use reduce::{ForUpdateFuture, Reducer, ReducerConfig, RowStream, UpdateResult, RETRY_TIMEOUT_ENV};
pub use row::{ColumnMeta, DataType, Row, Value};
pub use statement::{ActiveTx, MapQuery, QueryCancel, QueryOptions, SortColumn, SplitQuery};
pub use transport::{
    CacheId, ClusterView, MappingRequest, MetricsView, NodeId, NodeVersion, PartitionMapper,
    PartitionMapping, ReduceError, SendError, TopologyVersion, Transport,
};
