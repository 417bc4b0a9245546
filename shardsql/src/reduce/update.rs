use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::transport::cluster::NodeId;
use crate::transport::errors::ReduceError;

/// Result of a distributed DML statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub affected_rows: u64,
}

struct UpdState {
    responded: HashSet<NodeId>,
    gone: HashSet<NodeId>,
    total: u64,
    result: Option<Result<u64, ReduceError>>,
}

/// Per-request state of one distributed DML fan-out: accumulates per-node
/// affected-row counts and settles exactly once.
pub(crate) struct UpdateRun {
    pub(crate) req_id: u64,
    pub(crate) nodes: Vec<NodeId>,
    expected: HashSet<NodeId>,
    state: Mutex<UpdState>,
    done: Notify,
    cancel_broadcast: AtomicBool,
}

impl UpdateRun {
    pub(crate) fn new(req_id: u64, nodes: Vec<NodeId>) -> UpdateRun {
        let expected = nodes.iter().copied().collect();
        UpdateRun {
            req_id,
            nodes,
            expected,
            state: Mutex::new(UpdState {
                responded: HashSet::new(),
                gone: HashSet::new(),
                total: 0,
                result: None,
            }),
            done: Notify::new(),
            cancel_broadcast: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin_cancel_broadcast(&self) -> bool {
        !self.cancel_broadcast.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn on_response(&self, node: NodeId, affected: u64, error: Option<String>) {
        let settled = {
            let mut st = self.state.lock();
            if st.result.is_some() {
                return;
            }
            if !self.expected.contains(&node) {
                warn!(req_id = self.req_id, node = %node, "DML response from unexpected node");
                return;
            }
            if !st.responded.insert(node) {
                warn!(req_id = self.req_id, node = %node, "duplicate DML response");
                return;
            }

            if let Some(message) = error {
                st.result = Some(Err(ReduceError::MapNodeFailed { node, message }));
                true
            } else {
                st.total += affected;
                if st.responded.len() == self.expected.len() {
                    st.result = Some(Ok(st.total));
                    true
                } else {
                    false
                }
            }
        };

        if settled {
            self.done.notify_waiters();
        }
    }

    /// A node the request was mapped to left the cluster. A node that had
    /// already responded stays covered; one that had not loses its counts,
    /// which fails the whole update.
    pub(crate) fn on_node_left(&self, node: NodeId) {
        let settled = {
            let mut st = self.state.lock();
            if st.result.is_some() || !self.expected.contains(&node) {
                return;
            }
            if !st.gone.insert(node) {
                return;
            }
            if st.responded.contains(&node) {
                false
            } else {
                st.result = Some(Err(ReduceError::MapNodeFailed {
                    node,
                    message: "node left the cluster before the DML response".into(),
                }));
                true
            }
        };

        if settled {
            self.done.notify_waiters();
        }
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

    pub(crate) async fn wait(&self) -> Result<u64, ReduceError> {
        loop {
            let notified = self.done.notified();
            if let Some(result) = self.state.lock().result.clone() {
                return result;
            }
            notified.await;
        }
    }
}
