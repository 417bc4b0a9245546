use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::engine::{MvccSnapshot, MvccTracker};
use crate::row::Value;
use crate::transport::cluster::TopologyVersion;

/// Cancellation token shared between the caller and a running query.
///
/// Firing it is sticky: every clone observes the cancelled state, and the
/// coordinator broadcasts at most one cancel request per run.
#[derive(Clone, Default)]
pub struct QueryCancel {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    notify: Notify,
}

impl QueryCancel {
    pub fn new() -> QueryCancel {
        QueryCancel::default()
    }

    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// State of the active pessimistic transaction, supplied by the transaction
/// subsystem for SELECT FOR UPDATE queries.
#[derive(Clone, Debug)]
pub struct ActiveTx {
    pub xid: Uuid,
    pub thread_id: u64,
    pub subject: Uuid,
    pub task_name_hash: i32,
    /// Topology the transaction mapped on, with its client-first flag.
    pub topology_version: TopologyVersion,
    pub client_first: bool,
    /// Set once the transaction locked a topology version; any later server
    /// topology change forces a rollback.
    pub locked_topology: Option<TopologyVersion>,
    pub remaining: Option<Duration>,
    pub snapshot: Option<MvccSnapshot>,
}

/// Per-invocation options of `Reducer::query` / `Reducer::update`.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub keep_binary: bool,
    pub enforce_join_order: bool,
    /// Query timeout; also bounds the retry loop when positive.
    pub timeout: Option<Duration>,
    pub params: Vec<Value>,
    /// Explicit partition pinning.
    pub partitions: Option<Vec<u32>>,
    pub lazy: bool,
    pub data_page_scan: Option<bool>,
    pub tx: Option<ActiveTx>,
    pub mvcc: Option<Arc<dyn MvccTracker>>,
    pub cancel: QueryCancel,
}

impl QueryOptions {
    pub fn new() -> QueryOptions {
        QueryOptions::default()
    }

    pub fn with_params(mut self, params: Vec<Value>) -> QueryOptions {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> QueryOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: QueryCancel) -> QueryOptions {
        self.cancel = cancel;
        self
    }
}
