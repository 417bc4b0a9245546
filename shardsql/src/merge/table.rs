use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::engine::RowCursor;
use crate::row::{ColumnMeta, Row};
use crate::transport::errors::ReduceError;

use super::index::{IndexCursor, MergeIndex};

/// Canonical name of the merge table backing map query `ordinal`.
pub fn merge_table_name(ordinal: usize) -> String {
    format!("T___{ordinal}")
}

/// Reducer-local table over one merge index, visible to the reduce SQL
/// statement. A sorted table carries the declared sort order and also
/// advertises a plain scan index so the local planner can choose either.
pub struct MergeTable {
    name: String,
    columns: Vec<ColumnMeta>,
    index: Arc<MergeIndex>,
    scan_index: bool,
}

impl MergeTable {
    pub(crate) fn new(
        ordinal: usize,
        columns: Vec<ColumnMeta>,
        index: Arc<MergeIndex>,
    ) -> MergeTable {
        let scan_index = index.is_sorted();
        MergeTable {
            name: merge_table_name(ordinal),
            columns,
            index,
            scan_index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn sorted(&self) -> bool {
        self.index.is_sorted()
    }

    pub fn has_scan_index(&self) -> bool {
        self.scan_index
    }

    pub(crate) fn index(&self) -> &Arc<MergeIndex> {
        &self.index
    }

    /// Opens a cursor over the table rows; sorted tables yield merge order.
    pub fn cursor(&self) -> MergeTableCursor {
        MergeTableCursor {
            inner: self.index.clone().cursor(),
        }
    }
}

/// Streaming cursor the local SQL engine scans a merge table with.
pub struct MergeTableCursor {
    inner: IndexCursor,
}

#[async_trait]
impl RowCursor for MergeTableCursor {
    async fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        self.inner.next_row().await
    }
}

struct TableSlot {
    name: String,
    inner: RwLock<Option<Arc<MergeTable>>>,
}

/// Process-wide list of merge-table shells the SQL engine resolves by
/// canonical name. Slot `i` holds the merge table of the `i`-th map query of
/// the run currently bound to the reducer connection.
///
/// Reads are lock-free over a copy-on-write list; slots are created lazily
/// under a mutex and never removed, only their inner table is swapped.
pub struct MergeTableRegistry {
    slots: ArcSwap<Vec<Arc<TableSlot>>>,
    grow_lock: Mutex<()>,
}

impl Default for MergeTableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeTableRegistry {
    pub fn new() -> MergeTableRegistry {
        MergeTableRegistry {
            slots: ArcSwap::from_pointee(Vec::new()),
            grow_lock: Mutex::new(()),
        }
    }

    fn slot(&self, ordinal: usize) -> Arc<TableSlot> {
        let slots = self.slots.load();
        if let Some(slot) = slots.get(ordinal) {
            return slot.clone();
        }

        let _grow = self.grow_lock.lock();
        let slots = self.slots.load_full();
        if let Some(slot) = slots.get(ordinal) {
            return slot.clone();
        }

        let mut grown = (*slots).clone();
        for i in grown.len()..=ordinal {
            debug!(ordinal = i, "creating merge table slot");
            grown.push(Arc::new(TableSlot {
                name: merge_table_name(i),
                inner: RwLock::new(None),
            }));
        }
        let slot = grown[ordinal].clone();
        self.slots.store(Arc::new(grown));
        slot
    }

    /// Binds a merge table into its slot for the duration of a run.
    pub(crate) fn bind(&self, ordinal: usize, table: Arc<MergeTable>) {
        *self.slot(ordinal).inner.write() = Some(table);
    }

    /// Resets the first `count` slots; the shells stay for reuse.
    pub(crate) fn unbind(&self, count: usize) {
        let slots = self.slots.load();
        for slot in slots.iter().take(count) {
            *slot.inner.write() = None;
        }
    }

    /// Resolves a bound merge table by canonical name.
    pub fn resolve(&self, name: &str) -> Option<Arc<MergeTable>> {
        let slots = self.slots.load();
        slots
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.inner.read().clone())
    }
}
