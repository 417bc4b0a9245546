use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tracing::debug;

use crate::engine::{MvccTracker, RowCursor};
use crate::merge::index::{IndexCursor, MergeIndex};
use crate::row::Row;
use crate::transport::cluster::NodeId;
use crate::transport::errors::ReduceError;

use super::executor::ReducerInner;

/// Releases a run's local and remote resources exactly once, no matter how
/// the result stream ends: exhausted, failed, dropped, or closed explicitly.
pub(crate) struct ReleaseGuard {
    inner: Weak<ReducerInner>,
    req_id: u64,
    nodes: Vec<NodeId>,
    distributed_joins: bool,
    mvcc: Option<Arc<dyn MvccTracker>>,
    released: AtomicBool,
}

impl ReleaseGuard {
    pub(crate) fn new(
        inner: Weak<ReducerInner>,
        req_id: u64,
        nodes: Vec<NodeId>,
        distributed_joins: bool,
        mvcc: Option<Arc<dyn MvccTracker>>,
    ) -> ReleaseGuard {
        ReleaseGuard {
            inner,
            req_id,
            nodes,
            distributed_joins,
            mvcc,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner
                .release_run(
                    self.req_id,
                    &self.nodes,
                    self.distributed_joins,
                    self.mvcc.clone(),
                )
                .await;
        }
    }

    /// Non-async variant for drop/poll contexts; the remote part runs on its
    /// own task when a runtime is available.
    fn release_background(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let finished = inner.finish_run(self.req_id);
        if let Some(tracker) = &self.mvcc {
            tracker.on_done();
        }

        if let Some((run, unread)) = finished {
            if (self.distributed_joins || unread) && run.begin_cancel_broadcast() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let nodes = self.nodes.clone();
                        let req_id = self.req_id;
                        handle.spawn(async move {
                            inner.broadcast_cancel(&nodes, req_id).await;
                        });
                    }
                    Err(_) => debug!(
                        req_id = self.req_id,
                        "no runtime to broadcast cancel during release"
                    ),
                }
            }
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release_background();
    }
}

type BoxRowStream = Pin<Box<dyn Stream<Item = Result<Row, ReduceError>> + Send>>;

/// Streaming result of a reduce query.
///
/// Owns the run's remote resources: dropping the stream (or draining it)
/// releases them and signals the MVCC tracker.
pub struct RowStream {
    inner: BoxRowStream,
    guard: Option<ReleaseGuard>,
    done: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").field("done", &self.done).finish()
    }
}

impl RowStream {
    /// Wraps the engine result set of the reduce SQL execution.
    pub(crate) fn from_cursor(cursor: Box<dyn RowCursor>, guard: ReleaseGuard) -> RowStream {
        let inner = stream::try_unfold(cursor, |mut cursor| async move {
            Ok(cursor.next_row().await?.map(|row| (row, cursor)))
        });
        RowStream {
            inner: Box::pin(inner),
            guard: Some(guard),
            done: false,
        }
    }

    /// Skip-merge-table fast path: drains the merge indexes directly, one
    /// map query after another.
    pub(crate) fn direct(indexes: Vec<Arc<MergeIndex>>, guard: ReleaseGuard) -> RowStream {
        struct DirectState {
            queue: VecDeque<Arc<MergeIndex>>,
            current: Option<IndexCursor>,
        }

        let state = DirectState {
            queue: indexes.into_iter().collect(),
            current: None,
        };

        let inner = stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(cursor) = &mut state.current {
                    if let Some(row) = cursor.next_row().await? {
                        return Ok(Some((row, state)));
                    }
                    state.current = None;
                }
                match state.queue.pop_front() {
                    Some(index) => state.current = Some(index.cursor()),
                    None => return Ok(None),
                }
            }
        });

        RowStream {
            inner: Box::pin(inner),
            guard: Some(guard),
            done: false,
        }
    }

    /// Fully materialized result (EXPLAIN output); resources were already
    /// released by the caller.
    pub(crate) fn of_rows(rows: Vec<Row>) -> RowStream {
        RowStream {
            inner: Box::pin(stream::iter(rows.into_iter().map(Ok))),
            guard: None,
            done: false,
        }
    }

    pub async fn next_row(&mut self) -> Option<Result<Row, ReduceError>> {
        self.next().await
    }

    /// Collects every remaining row, failing on the first error.
    pub async fn try_collect(mut self) -> Result<Vec<Row>, ReduceError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Releases the run's resources without draining the remaining rows.
    pub async fn close(mut self) {
        self.done = true;
        if let Some(guard) = self.guard.take() {
            guard.release().await;
        }
    }
}

impl Stream for RowStream {
    type Item = Result<Row, ReduceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                self.done = true;
                if let Some(guard) = &self.guard {
                    guard.release_background();
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                if let Some(guard) = &self.guard {
                    guard.release_background();
                }
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}
