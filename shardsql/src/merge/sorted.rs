use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::mem;
use std::sync::Arc;

use crate::row::{cmp_rows, Row};
use crate::statement::SortColumn;
use crate::transport::errors::ReduceError;
use crate::transport::messages::SourceKey;

use super::index::{MergeIndex, ResultPage};

/// Head row of one source stream, ordered for the min-heap.
struct HeapEntry {
    row: Row,
    source: SourceKey,
    sort: Arc<Vec<SortColumn>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest row first.
        cmp_rows(&other.row, &self.row, &self.sort)
    }
}

/// K-way merge over the per-source page streams of a sorted index.
///
/// Each source keeps exactly one materialized head row in the heap; when a
/// source's current page runs out, its successor is requested and the merge
/// waits on that source alone. Equal keys pop in no particular source order.
pub(crate) struct SortedCursor {
    index: Arc<MergeIndex>,
    sort: Arc<Vec<SortColumn>>,
    heap: BinaryHeap<HeapEntry>,
    cursors: HashMap<SourceKey, (ResultPage, usize)>,
    primed: bool,
}

impl SortedCursor {
    pub(crate) fn new(index: Arc<MergeIndex>, sort: Arc<Vec<SortColumn>>) -> SortedCursor {
        SortedCursor {
            index,
            sort,
            heap: BinaryHeap::new(),
            cursors: HashMap::new(),
            primed: false,
        }
    }

    /// Next row of `key`'s stream, pulling pages as needed. `None` once the
    /// source delivered and drained its last page.
    async fn advance(&mut self, key: SourceKey) -> Result<Option<Row>, ReduceError> {
        loop {
            if let Some((page, idx)) = self.cursors.get_mut(&key) {
                if *idx < page.rows.len() {
                    let row = mem::take(&mut page.rows[*idx]);
                    *idx += 1;
                    return Ok(Some(row));
                }
                let (page, _) = self.cursors.remove(&key).expect("cursor checked above");
                if page.last {
                    return Ok(None);
                }
                page.fetch_next().await?;
            }

            match self.index.take_source_page(key).await? {
                Some(page) => {
                    self.cursors.insert(key, (page, 0));
                }
                None => return Ok(None),
            }
        }
    }

    async fn prime(&mut self) -> Result<(), ReduceError> {
        for key in self.index.sources() {
            if let Some(row) = self.advance(key).await? {
                self.heap.push(HeapEntry {
                    row,
                    source: key,
                    sort: self.sort.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        if !self.primed {
            self.primed = true;
            self.prime().await?;
        }

        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };

        if let Some(next) = self.advance(entry.source).await? {
            self.heap.push(HeapEntry {
                row: next,
                source: entry.source,
                sort: self.sort.clone(),
            });
        }

        Ok(Some(entry.row))
    }
}
