//! Seam to the local SQL engine. The engine executes the reduce query over
//! the merge tables; everything else about it (parsing, planning, storage)
//! lives outside this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::merge::MergeTable;
use crate::row::{Row, Value};
use crate::transport::errors::ReduceError;

/// Context of one reduce call, passed explicitly through the engine entry
/// points. Slot `i` of `tables` backs the merge table of the `i`-th map
/// query; the engine resolves `T___<i>` references against it.
#[derive(Clone)]
pub struct ReduceContext {
    pub request_id: u64,
    pub tables: Vec<Arc<MergeTable>>,
    pub timeout: Option<Duration>,
    pub data_page_scan: Option<bool>,
}

/// Streaming cursor over an engine result set.
#[async_trait]
pub trait RowCursor: Send {
    async fn next_row(&mut self) -> Result<Option<Row>, ReduceError>;
}

/// One pooled engine connection, pinned to a run for its lifetime.
#[async_trait]
pub trait ReduceConnection: Send {
    fn set_enforce_join_order(&mut self, enabled: bool);

    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        ctx: &ReduceContext,
    ) -> Result<Box<dyn RowCursor>, ReduceError>;
}

/// Connection source of the local SQL engine.
pub trait ReduceEngine: Send + Sync {
    fn connection(&self, schema: &str) -> Result<Box<dyn ReduceConnection>, ReduceError>;
}

/// MVCC read snapshot attached to transactional read-only queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MvccSnapshot {
    pub coordinator_version: u64,
    pub counter: u64,
}

/// External snapshot handle; the coordinator only forwards the snapshot to
/// the map side and signals when the last consumer is done with it.
pub trait MvccTracker: Send + Sync {
    fn snapshot(&self) -> MvccSnapshot;

    /// Called exactly once when the run's resources are released.
    fn on_done(&self);
}
