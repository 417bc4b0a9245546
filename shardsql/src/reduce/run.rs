use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::engine::ReduceConnection;
use crate::merge::index::MergeIndex;
use crate::transport::cluster::{NodeId, TopologyVersion};
use crate::transport::errors::ReduceError;

use super::latch::CountDownLatch;

/// State machine of one reduce query run.
#[derive(Clone, Debug)]
pub(crate) enum RunState {
    Running,
    /// The current attempt must be abandoned and re-mapped on `topology`.
    Retry {
        topology: TopologyVersion,
        node: Option<NodeId>,
        cause: String,
    },
    Failed(ReduceError),
    Disconnected,
}

impl RunState {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, RunState::Failed(_) | RunState::Disconnected)
    }
}

/// Per-request state of one active reduce query.
pub(crate) struct QueryRun {
    pub(crate) req_id: u64,
    pub(crate) page_size: usize,
    pub(crate) data_page_scan: Option<bool>,
    /// Nodes the map request was fanned out to.
    pub(crate) nodes: Vec<NodeId>,
    /// One merge index per map query, in split order.
    pub(crate) indexes: Vec<Arc<MergeIndex>>,
    /// Counts down once per expected first page.
    pub(crate) latch: CountDownLatch,
    pub(crate) for_update: Option<Arc<ForUpdateFuture>>,
    state: Mutex<RunState>,
    conn: Mutex<Option<Box<dyn ReduceConnection>>>,
    cancel_broadcast: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl QueryRun {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        req_id: u64,
        page_size: usize,
        data_page_scan: Option<bool>,
        nodes: Vec<NodeId>,
        indexes: Vec<Arc<MergeIndex>>,
        latch_count: usize,
        conn: Box<dyn ReduceConnection>,
        for_update: Option<Arc<ForUpdateFuture>>,
    ) -> QueryRun {
        QueryRun {
            req_id,
            page_size,
            data_page_scan,
            nodes,
            indexes,
            latch: CountDownLatch::new(latch_count),
            for_update,
            state: Mutex::new(RunState::Running),
            conn: Mutex::new(Some(conn)),
            cancel_broadcast: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.state.lock().clone()
    }

    /// Moves a running attempt into the retry state. The first retry cause
    /// wins; terminal states are never overwritten.
    pub(crate) fn set_retry(
        &self,
        topology: TopologyVersion,
        node: Option<NodeId>,
        cause: impl Into<String>,
    ) -> bool {
        let mut st = self.state.lock();
        match &*st {
            RunState::Running => {
                *st = RunState::Retry {
                    topology,
                    node,
                    cause: cause.into(),
                };
                true
            }
            _ => false,
        }
    }

    /// Terminal failure: sticks, force-zeroes the latch and fails every
    /// merge index so blocked consumers wake up.
    pub(crate) fn fail(&self, err: ReduceError) -> bool {
        {
            let mut st = self.state.lock();
            if st.is_terminal() {
                return false;
            }
            *st = RunState::Failed(err.clone());
        }
        self.latch.force_zero();
        for index in &self.indexes {
            index.fail(err.clone());
        }
        true
    }

    pub(crate) fn disconnect(&self) -> bool {
        {
            let mut st = self.state.lock();
            if st.is_terminal() {
                return false;
            }
            *st = RunState::Disconnected;
        }
        self.latch.force_zero();
        for index in &self.indexes {
            index.fail(ReduceError::Disconnected);
        }
        true
    }

    /// Takes the pinned reducer connection for the reduce phase.
    pub(crate) fn take_connection(&self) -> Option<Box<dyn ReduceConnection>> {
        self.conn.lock().take()
    }

    /// True exactly once; gates the cancel broadcast for this run.
    pub(crate) fn begin_cancel_broadcast(&self) -> bool {
        !self.cancel_broadcast.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn attach_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher.lock() = Some(handle);
    }

    pub(crate) fn abort_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

/// Accumulates per-node locked-row counts of a SELECT FOR UPDATE run; the
/// transaction subsystem awaits it to finish enlisting.
pub struct ForUpdateFuture {
    order: AtomicU64,
    state: Mutex<ForUpdateState>,
    done: Notify,
}

struct ForUpdateState {
    counts: HashMap<NodeId, u64>,
    remove_mapping: Vec<NodeId>,
    result: Option<Result<u64, ReduceError>>,
}

impl Default for ForUpdateFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl ForUpdateFuture {
    pub fn new() -> ForUpdateFuture {
        ForUpdateFuture {
            order: AtomicU64::new(0),
            state: Mutex::new(ForUpdateState {
                counts: HashMap::new(),
                remove_mapping: Vec::new(),
                result: None,
            }),
            done: Notify::new(),
        }
    }

    /// Next value of the per-run lock ordering counter.
    pub(crate) fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn record(&self, node: NodeId, rows: u64, remove_mapping: bool) {
        let mut st = self.state.lock();
        st.counts.insert(node, rows);
        if remove_mapping {
            st.remove_mapping.push(node);
        }
    }

    /// Nodes whose mapping the transaction should drop.
    pub fn remove_mapping(&self) -> Vec<NodeId> {
        self.state.lock().remove_mapping.clone()
    }

    /// Settles with the sum of the recorded per-node counts.
    pub(crate) fn complete(&self) {
        {
            let mut st = self.state.lock();
            if st.result.is_some() {
                return;
            }
            let total = st.counts.values().sum();
            st.result = Some(Ok(total));
        }
        self.done.notify_waiters();
    }

    pub(crate) fn fail(&self, err: ReduceError) {
        {
            let mut st = self.state.lock();
            if st.result.is_some() {
                return;
            }
            st.result = Some(Err(err));
        }
        self.done.notify_waiters();
    }

    pub async fn wait(&self) -> Result<u64, ReduceError> {
        loop {
            let notified = self.done.notified();
            if let Some(result) = self.state.lock().result.clone() {
                return result;
            }
            notified.await;
        }
    }
}
