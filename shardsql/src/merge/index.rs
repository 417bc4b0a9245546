use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::row::Row;
use crate::statement::SortColumn;
use crate::transport::cluster::NodeId;
use crate::transport::errors::ReduceError;
use crate::transport::messages::SourceKey;

use super::sorted::SortedCursor;

/// Issues the next-page request for one page stream. Implemented by the
/// coordinator; pages only hold a weak handle plus the stable request id, so
/// a released run simply makes the fetch a no-op.
#[async_trait]
pub(crate) trait PageFetch: Send + Sync {
    async fn fetch_next_page(
        &self,
        req_id: u64,
        query: usize,
        source: SourceKey,
    ) -> Result<(), ReduceError>;
}

#[derive(Clone, Debug)]
pub(crate) struct FetchHandle {
    fetch: Option<Weak<dyn PageFetch>>,
    req_id: u64,
}

impl FetchHandle {
    pub(crate) fn new(fetch: Weak<dyn PageFetch>, req_id: u64) -> FetchHandle {
        FetchHandle {
            fetch: Some(fetch),
            req_id,
        }
    }

    /// Handle with no backing coordinator; every fetch is a no-op.
    #[cfg(test)]
    pub(crate) fn detached() -> FetchHandle {
        FetchHandle {
            fetch: None,
            req_id: 0,
        }
    }
}

/// One received page of a (node, map query, segment) stream.
#[derive(Debug)]
pub(crate) struct ResultPage {
    pub query: usize,
    pub source: SourceKey,
    pub page_no: u32,
    pub rows: Vec<Row>,
    pub last: bool,
    fetch: FetchHandle,
}

impl ResultPage {
    pub(crate) fn new(
        query: usize,
        source: SourceKey,
        page_no: u32,
        rows: Vec<Row>,
        last: bool,
        fetch: FetchHandle,
    ) -> ResultPage {
        ResultPage {
            query,
            source,
            page_no,
            rows,
            last,
            fetch,
        }
    }

    /// Requests the successor of this page. No-op when the owning run is
    /// already gone; raises when the run is in a retry or terminal state.
    pub(crate) async fn fetch_next(&self) -> Result<(), ReduceError> {
        let Some(weak) = &self.fetch.fetch else {
            return Ok(());
        };
        let Some(fetch) = weak.upgrade() else {
            return Ok(());
        };
        fetch
            .fetch_next_page(self.fetch.req_id, self.query, self.source)
            .await
    }
}

struct SourceState {
    next_page: u32,
    done: bool,
}

enum PageBuffer {
    /// Arrival order, shared across sources.
    Arrival(VecDeque<ResultPage>),
    /// One queue per source, consumed by the k-way merge.
    PerSource(HashMap<SourceKey, VecDeque<ResultPage>>),
}

struct IndexState {
    sources: HashMap<SourceKey, SourceState>,
    buffer: PageBuffer,
    finished: usize,
    failed: Option<ReduceError>,
}

#[derive(Debug)]
pub(crate) enum PagePush {
    Accepted { first: bool },
    Dropped,
}

/// In-memory sink for the paged partial results of one map query.
///
/// An unsorted index concatenates pages in arrival order; a sorted index
/// keeps per-source streams and merges them by the declared sort columns.
pub(crate) struct MergeIndex {
    query: usize,
    sort: Option<Arc<Vec<SortColumn>>>,
    state: Mutex<IndexState>,
    page_ready: Notify,
}

impl MergeIndex {
    pub(crate) fn unsorted(query: usize) -> MergeIndex {
        MergeIndex {
            query,
            sort: None,
            state: Mutex::new(IndexState {
                sources: HashMap::new(),
                buffer: PageBuffer::Arrival(VecDeque::new()),
                finished: 0,
                failed: None,
            }),
            page_ready: Notify::new(),
        }
    }

    pub(crate) fn sorted(query: usize, sort: Vec<SortColumn>) -> MergeIndex {
        MergeIndex {
            query,
            sort: Some(Arc::new(sort)),
            state: Mutex::new(IndexState {
                sources: HashMap::new(),
                buffer: PageBuffer::PerSource(HashMap::new()),
                finished: 0,
                failed: None,
            }),
            page_ready: Notify::new(),
        }
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.sort.is_some()
    }

    /// Declares the expected page streams: every node times `segments`
    /// parallel lanes. Must be called before the index starts receiving.
    pub(crate) fn set_sources(&self, nodes: &[NodeId], segments: u32) {
        let mut st = self.state.lock();
        for &node in nodes {
            for segment in 0..segments {
                let key = SourceKey { node, segment };
                st.sources.insert(
                    key,
                    SourceState {
                        next_page: 0,
                        done: false,
                    },
                );
                if let PageBuffer::PerSource(queues) = &mut st.buffer {
                    queues.insert(key, VecDeque::new());
                }
            }
        }
    }

    pub(crate) fn sources(&self) -> Vec<SourceKey> {
        self.state.lock().sources.keys().copied().collect()
    }

    pub(crate) fn has_source_node(&self, node: NodeId) -> bool {
        self.state.lock().sources.keys().any(|k| k.node == node)
    }

    /// True once every source has delivered its last page.
    pub(crate) fn fetched_all(&self) -> bool {
        let st = self.state.lock();
        st.finished == st.sources.len()
    }

    /// True while the map side may still hold resources for this index:
    /// either not all pages arrived yet, or arrived pages were not consumed.
    pub(crate) fn has_unread(&self) -> bool {
        if !self.fetched_all() {
            return true;
        }
        let st = self.state.lock();
        match &st.buffer {
            PageBuffer::Arrival(q) => !q.is_empty(),
            PageBuffer::PerSource(queues) => queues.values().any(|q| !q.is_empty()),
        }
    }

    /// Accepts one page from the dispatcher. Pages from unknown or already
    /// finished sources are dropped.
    pub(crate) fn push_page(&self, page: ResultPage) -> PagePush {
        let mut st = self.state.lock();

        if st.failed.is_some() {
            debug!(query = self.query, "dropping page for failed merge index");
            return PagePush::Dropped;
        }

        let Some(source) = st.sources.get_mut(&page.source) else {
            warn!(
                query = self.query,
                node = %page.source.node,
                segment = page.source.segment,
                "dropping page from unknown source"
            );
            return PagePush::Dropped;
        };

        if source.done {
            warn!(
                query = self.query,
                node = %page.source.node,
                "dropping page received after the last page"
            );
            return PagePush::Dropped;
        }

        if page.page_no != source.next_page {
            warn!(
                query = self.query,
                node = %page.source.node,
                expected = source.next_page,
                got = page.page_no,
                "out-of-order page from source"
            );
        }

        let first = source.next_page == 0 && page.page_no == 0;
        source.next_page = page.page_no + 1;
        if page.last {
            source.done = true;
            st.finished += 1;
        }

        match &mut st.buffer {
            PageBuffer::Arrival(q) => q.push_back(page),
            PageBuffer::PerSource(queues) => {
                queues.entry(page.source).or_default().push_back(page);
            }
        }

        drop(st);
        self.page_ready.notify_waiters();

        PagePush::Accepted { first }
    }

    /// Fails every current and future consumer of this index.
    pub(crate) fn fail(&self, err: ReduceError) {
        {
            let mut st = self.state.lock();
            if st.failed.is_none() {
                st.failed = Some(err);
            }
        }
        self.page_ready.notify_waiters();
    }

    /// Next page in arrival order; `None` once every source finished and the
    /// buffer drained. Only valid for unsorted indexes.
    pub(crate) async fn take_page(&self) -> Result<Option<ResultPage>, ReduceError> {
        loop {
            let notified = self.page_ready.notified();
            {
                let mut st = self.state.lock();
                if let Some(e) = &st.failed {
                    return Err(e.clone());
                }
                if let PageBuffer::Arrival(q) = &mut st.buffer {
                    if let Some(page) = q.pop_front() {
                        return Ok(Some(page));
                    }
                }
                if st.finished == st.sources.len() {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Next queued page of one source; `None` once that source finished and
    /// its queue drained. Only valid for sorted indexes.
    pub(crate) async fn take_source_page(
        &self,
        key: SourceKey,
    ) -> Result<Option<ResultPage>, ReduceError> {
        loop {
            let notified = self.page_ready.notified();
            {
                let mut st = self.state.lock();
                if let Some(e) = &st.failed {
                    return Err(e.clone());
                }
                let done = st.sources.get(&key).map(|s| s.done).unwrap_or(true);
                if let PageBuffer::PerSource(queues) = &mut st.buffer {
                    if let Some(page) = queues.get_mut(&key).and_then(|q| q.pop_front()) {
                        return Ok(Some(page));
                    }
                }
                if done {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    pub(crate) fn cursor(self: Arc<Self>) -> IndexCursor {
        match self.sort.clone() {
            None => IndexCursor::Unsorted(UnsortedCursor {
                index: self,
                current: None,
            }),
            Some(sort) => IndexCursor::Sorted(SortedCursor::new(self, sort)),
        }
    }
}

/// Row-level cursor over one merge index.
pub(crate) enum IndexCursor {
    Unsorted(UnsortedCursor),
    Sorted(SortedCursor),
}

impl IndexCursor {
    pub(crate) async fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        match self {
            IndexCursor::Unsorted(c) => c.next_row().await,
            IndexCursor::Sorted(c) => c.next_row().await,
        }
    }
}

/// Drains pages in arrival order, pulling each stream's successor when its
/// current page is exhausted.
pub(crate) struct UnsortedCursor {
    index: Arc<MergeIndex>,
    current: Option<(ResultPage, usize)>,
}

impl UnsortedCursor {
    pub(crate) async fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        loop {
            if let Some((page, idx)) = &mut self.current {
                if *idx < page.rows.len() {
                    let row = mem::take(&mut page.rows[*idx]);
                    *idx += 1;
                    return Ok(Some(row));
                }
                let (page, _) = self.current.take().expect("current page checked above");
                if !page.last {
                    page.fetch_next().await?;
                }
            }

            match self.index.take_page().await? {
                Some(page) => self.current = Some((page, 0)),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn page(
        source: SourceKey,
        page_no: u32,
        values: Vec<i32>,
        last: bool,
    ) -> ResultPage {
        ResultPage::new(
            0,
            source,
            page_no,
            values
                .into_iter()
                .map(|v| Row::of([Value::Int(v)]))
                .collect(),
            last,
            FetchHandle::detached(),
        )
    }

    fn ints(rows: &[Row]) -> Vec<i32> {
        rows.iter()
            .map(|r| r.column(0).and_then(Value::as_int).unwrap())
            .collect()
    }

    async fn drain(index: &Arc<MergeIndex>) -> Vec<Row> {
        let mut cursor = index.clone().cursor();
        let mut out = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            out.push(row);
        }
        out
    }

    #[tokio::test]
    async fn unsorted_keeps_arrival_order() {
        let n1 = NodeId::random();
        let n2 = NodeId::random();
        let index = Arc::new(MergeIndex::unsorted(0));
        index.set_sources(&[n1, n2], 1);

        let s1 = SourceKey { node: n1, segment: 0 };
        let s2 = SourceKey { node: n2, segment: 0 };

        assert_matches::assert_matches!(
            index.push_page(page(s1, 0, vec![1, 2], false)),
            PagePush::Accepted { first: true }
        );
        assert_matches::assert_matches!(
            index.push_page(page(s2, 0, vec![3], true)),
            PagePush::Accepted { first: true }
        );
        assert_matches::assert_matches!(
            index.push_page(page(s1, 1, vec![4], true)),
            PagePush::Accepted { first: false }
        );

        assert!(index.fetched_all());
        assert_eq!(ints(&drain(&index).await), vec![1, 2, 3, 4]);
        assert!(!index.has_unread());
    }

    #[tokio::test]
    async fn pages_after_last_are_dropped() {
        let n1 = NodeId::random();
        let index = Arc::new(MergeIndex::unsorted(0));
        index.set_sources(&[n1], 1);
        let s1 = SourceKey { node: n1, segment: 0 };

        index.push_page(page(s1, 0, vec![1], true));
        assert_matches::assert_matches!(
            index.push_page(page(s1, 1, vec![2], true)),
            PagePush::Dropped
        );
        assert_eq!(ints(&drain(&index).await), vec![1]);
    }

    #[tokio::test]
    async fn pages_from_unknown_sources_are_dropped() {
        let index = Arc::new(MergeIndex::unsorted(0));
        index.set_sources(&[NodeId::random()], 1);

        let stranger = SourceKey {
            node: NodeId::random(),
            segment: 0,
        };
        assert_matches::assert_matches!(
            index.push_page(page(stranger, 0, vec![1], true)),
            PagePush::Dropped
        );
        assert!(!index.fetched_all());
    }

    #[tokio::test]
    async fn failing_the_index_wakes_consumers() {
        let n1 = NodeId::random();
        let index = Arc::new(MergeIndex::unsorted(0));
        index.set_sources(&[n1], 1);

        let reader = index.clone();
        let handle = tokio::spawn(async move { reader.take_page().await });

        index.fail(ReduceError::Cancelled);
        assert_matches::assert_matches!(
            handle.await.unwrap(),
            Err(ReduceError::Cancelled)
        );
    }

    #[tokio::test]
    async fn consumer_blocks_until_next_page_arrives() {
        let n1 = NodeId::random();
        let index = Arc::new(MergeIndex::unsorted(0));
        index.set_sources(&[n1], 1);
        let s1 = SourceKey { node: n1, segment: 0 };

        index.push_page(page(s1, 0, vec![1], false));

        let reader = index.clone();
        let handle = tokio::spawn(async move { drain(&reader).await });

        tokio::task::yield_now().await;
        index.push_page(page(s1, 1, vec![2], true));

        assert_eq!(ints(&handle.await.unwrap()), vec![1, 2]);
    }
}
