use crate::row::ColumnMeta;
use crate::transport::cluster::CacheId;

/// One sort key of a map query's declared ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortColumn {
    /// Column ordinal within the map query's output row.
    pub column: usize,
    pub descending: bool,
}

/// A SQL fragment executed on every data-owning node over its local shard.
#[derive(Clone, Debug)]
pub struct MapQuery {
    pub sql: String,
    /// False for map queries that only touch replicated caches; those run on
    /// a single node.
    pub partitioned: bool,
    /// Declared ordering; empty means the merge keeps arrival order.
    pub sort_columns: Vec<SortColumn>,
    pub columns: Vec<ColumnMeta>,
}

impl MapQuery {
    pub fn new(sql: impl Into<String>, columns: Vec<ColumnMeta>) -> MapQuery {
        MapQuery {
            sql: sql.into(),
            partitioned: true,
            sort_columns: Vec::new(),
            columns,
        }
    }

    pub fn sorted(&self) -> bool {
        !self.sort_columns.is_empty()
    }
}

/// The two-step plan produced by the splitter: map queries to fan out plus
/// the reduce query combining their partial results.
#[derive(Clone, Debug)]
pub struct SplitQuery {
    pub map_queries: Vec<MapQuery>,
    pub reduce_query: String,
    /// Caches the query touches; the first one drives segment parallelism.
    pub cache_ids: Vec<CacheId>,
    /// Table list forwarded to the map side for distributed joins.
    pub tables: Option<Vec<String>>,
    pub local: bool,
    pub replicated_only: bool,
    pub explain: bool,
    pub distributed_joins: bool,
    /// Single-map-query fast path: stream map results straight through
    /// without a reduce step.
    pub skip_merge_table: bool,
    pub for_update: bool,
}

impl SplitQuery {
    pub fn new(reduce_query: impl Into<String>, map_queries: Vec<MapQuery>) -> SplitQuery {
        SplitQuery {
            map_queries,
            reduce_query: reduce_query.into(),
            cache_ids: Vec::new(),
            tables: None,
            local: false,
            replicated_only: false,
            explain: false,
            distributed_joins: false,
            skip_merge_table: false,
            for_update: false,
        }
    }

    pub(crate) fn partitioned_map_queries(&self) -> usize {
        self.map_queries.iter().filter(|q| q.partitioned).count()
    }

    pub(crate) fn replicated_map_queries(&self) -> usize {
        self.map_queries.len() - self.partitioned_map_queries()
    }
}
