use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{MvccTracker, ReduceContext, ReduceEngine, RowCursor};
use crate::merge::index::{FetchHandle, MergeIndex, PageFetch, PagePush, ResultPage};
use crate::merge::table::{merge_table_name, MergeTable, MergeTableRegistry};
use crate::row::{ColumnMeta, Row};
use crate::statement::{QueryCancel, QueryOptions, SplitQuery};
use crate::transport::adapter::{MapExecutor, MessageAdapter, Transport};
use crate::transport::cluster::{
    ClusterView, MappingRequest, NodeId, PartitionMapper, PartitionMapping, MIN_SERVER_DML_VERSION,
};
use crate::transport::errors::ReduceError;
use crate::transport::messages::{
    DmlRequest, DmlResponse, FailCode, FailResponse, InboundMessage, NextPageRequest,
    NextPageResponse, OutboundMessage, QueryCancelRequest, QueryFlags, QueryRequest, SourceKey,
    TxRequestMeta,
};
use crate::transport::metrics::{MetricsView, ReducerMetrics};

use super::run::{ForUpdateFuture, QueryRun, RunState};
use super::stream::{ReleaseGuard, RowStream};
use super::update::{UpdateResult, UpdateRun};

/// Environment variable overriding the default retry timeout, milliseconds.
pub const RETRY_TIMEOUT_ENV: &str = "SHARDSQL_RETRY_TIMEOUT";

const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: usize = 1024;
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration of the reduce coordinator.
pub struct ReducerConfig {
    /// Rows per response page requested from the map side.
    pub page_size: usize,
    /// Budget of the topology retry loop when the query has no timeout.
    pub retry_timeout: Duration,
    /// Liveness poll interval while waiting for first pages.
    pub poll_interval: Duration,
}

impl ReducerConfig {
    /// Defaults: 1024-row pages, 30 s retry budget (overridable through
    /// [`RETRY_TIMEOUT_ENV`]), 500 ms liveness polling.
    pub fn new() -> ReducerConfig {
        ReducerConfig {
            page_size: DEFAULT_PAGE_SIZE,
            retry_timeout: retry_timeout_from_env(),
            poll_interval: REPLY_POLL_INTERVAL,
        }
    }

    /// Sets the number of rows requested per response page.
    /// # Example
    /// ```
    /// # use shardsql::ReducerConfig;
    /// let mut config = ReducerConfig::new();
    /// config.set_page_size(512);
    /// ```
    pub fn set_page_size(&mut self, page_size: usize) {
        assert!(page_size > 0, "page size must be larger than 0");
        self.page_size = page_size;
    }

    /// Sets the retry budget used when a query carries no timeout of its
    /// own.
    /// # Example
    /// ```
    /// # use std::time::Duration;
    /// # use shardsql::ReducerConfig;
    /// let mut config = ReducerConfig::new();
    /// config.set_retry_timeout(Duration::from_secs(5));
    /// ```
    pub fn set_retry_timeout(&mut self, retry_timeout: Duration) {
        self.retry_timeout = retry_timeout;
    }

    /// Sets how often a waiting run rechecks cancellation and the liveness
    /// of its mapped nodes.
    pub fn set_poll_interval(&mut self, poll_interval: Duration) {
        self.poll_interval = poll_interval;
    }
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_timeout_from_env() -> Duration {
    std::env::var(RETRY_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_RETRY_TIMEOUT)
}

/// The reduce-side coordinator of the two-step SQL engine.
///
/// `query` fans map queries out to the data-owning nodes, feeds the paged
/// partial results into merge indexes, and returns a streaming iterator over
/// either the raw merge (skip-merge-table) or the locally executed reduce
/// query. `update` is the DML counterpart without merge tables.
pub struct Reducer {
    inner: Arc<ReducerInner>,
}

pub(crate) struct ReducerInner {
    cfg: ReducerConfig,
    pub(crate) adapter: MessageAdapter,
    cluster: Arc<dyn ClusterView>,
    mapper: Arc<dyn PartitionMapper>,
    engine: Arc<dyn ReduceEngine>,
    tables: MergeTableRegistry,
    runs: Mutex<HashMap<u64, Arc<QueryRun>>>,
    upd_runs: Mutex<HashMap<u64, Arc<UpdateRun>>>,
    qry_id_gen: AtomicU64,
    /// Busy lock serializing message dispatch with shutdown; `true` once the
    /// coordinator stopped.
    stopped: RwLock<bool>,
    metrics: Arc<ReducerMetrics>,
}

impl Reducer {
    pub fn new(
        cfg: ReducerConfig,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn ClusterView>,
        mapper: Arc<dyn PartitionMapper>,
        engine: Arc<dyn ReduceEngine>,
    ) -> Reducer {
        let adapter = MessageAdapter::new(transport, cluster.local_node());
        Reducer {
            inner: Arc::new(ReducerInner {
                cfg,
                adapter,
                cluster,
                mapper,
                engine,
                tables: MergeTableRegistry::new(),
                runs: Mutex::new(HashMap::new()),
                upd_runs: Mutex::new(HashMap::new()),
                qry_id_gen: AtomicU64::new(0),
                stopped: RwLock::new(false),
                metrics: Arc::new(ReducerMetrics::new()),
            }),
        }
    }

    /// Registers the in-process map executor; requests addressed to the
    /// local node then bypass the network.
    pub fn set_local_map_executor(&self, executor: Arc<dyn MapExecutor>) {
        self.inner.adapter.set_local_handler(executor);
    }

    pub fn metrics(&self) -> MetricsView {
        MetricsView::new(self.inner.metrics.clone())
    }

    /// Merge-table shells the local SQL engine resolves `T___<i>` against.
    pub fn tables(&self) -> &MergeTableRegistry {
        &self.inner.tables
    }

    /// Stops message dispatch. Waits for in-flight handlers to drain; any
    /// message arriving afterwards is skipped.
    pub fn stop(&self) {
        *self.inner.stopped.write() = true;
    }

    #[cfg(test)]
    pub(crate) fn active_runs(&self) -> usize {
        self.inner.runs.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn active_update_runs(&self) -> usize {
        self.inner.upd_runs.lock().len()
    }

    /// Inbound demultiplexer for map-side messages.
    pub fn on_message(&self, source: NodeId, msg: InboundMessage) {
        let busy = self.inner.stopped.read();
        if *busy {
            return;
        }

        if !self.inner.cluster.is_alive(source) {
            debug!(node = %source, "dropping message from departed node");
            return;
        }

        match msg {
            InboundMessage::NextPage(m) => self.on_next_page(source, m),
            InboundMessage::Fail(m) => self.on_fail(source, m),
            InboundMessage::Dml(m) => self.on_dml_response(source, m),
        }
    }

    fn on_next_page(&self, source: NodeId, m: NextPageResponse) {
        let run = self.inner.runs.lock().get(&m.req_id).cloned();
        let Some(run) = run else {
            debug!(req_id = m.req_id, "page response for unknown request id");
            return;
        };

        self.inner.metrics.inc_pages_received();

        if let Some(retry) = m.retry {
            debug!(req_id = m.req_id, node = %source, cause = %retry.cause, "map node requested retry");
            run.set_retry(retry.topology, Some(source), retry.cause);
            run.latch.count_down();
            return;
        }

        let Some(index) = run.indexes.get(m.query) else {
            warn!(req_id = m.req_id, query = m.query, "page for unknown map query");
            return;
        };

        if let Some(all_rows) = m.all_rows {
            if let Some(for_update) = &run.for_update {
                for_update.record(source, all_rows, m.remove_mapping);
            }
        }

        let fetch = FetchHandle::new(
            Arc::downgrade(&(self.inner.clone() as Arc<dyn PageFetch>)),
            m.req_id,
        );
        let page = ResultPage::new(
            m.query,
            SourceKey {
                node: source,
                segment: m.segment,
            },
            m.page_no,
            m.rows,
            m.last,
            fetch,
        );

        if let PagePush::Accepted { first: true } = index.push_page(page) {
            run.latch.count_down();
        }
    }

    fn on_fail(&self, source: NodeId, m: FailResponse) {
        let run = self.inner.runs.lock().get(&m.req_id).cloned();
        let Some(run) = run else {
            debug!(req_id = m.req_id, "fail response for unknown request id");
            return;
        };

        let err = match m.code {
            FailCode::CancelledByOriginator => ReduceError::Cancelled,
            FailCode::General => ReduceError::MapNodeFailed {
                node: source,
                message: m.message,
            },
        };
        run.fail(err);
    }

    fn on_dml_response(&self, source: NodeId, m: DmlResponse) {
        let run = self.inner.upd_runs.lock().get(&m.req_id).cloned();
        let Some(run) = run else {
            debug!(req_id = m.req_id, "DML response for unknown request id");
            return;
        };
        run.on_response(source, m.affected, m.error);
    }

    /// Node-left / node-failed discovery event: every reduce run sourcing
    /// from the node retries, every DML run settles or fails.
    pub fn on_node_left(&self, node: NodeId) {
        let runs: Vec<_> = self.inner.runs.lock().values().cloned().collect();
        for run in runs {
            self.inner.handle_node_left(&run, node);
        }

        let upd_runs: Vec<_> = self.inner.upd_runs.lock().values().cloned().collect();
        for run in upd_runs {
            run.on_node_left(node);
        }
    }

    pub fn on_node_failed(&self, node: NodeId) {
        self.on_node_left(node);
    }

    /// Client-disconnect event: fails every active run.
    pub fn on_disconnected(&self) {
        let runs: Vec<_> = self.inner.runs.lock().values().cloned().collect();
        for run in runs {
            run.disconnect();
        }

        let upd_runs: Vec<_> = self.inner.upd_runs.lock().values().cloned().collect();
        for run in upd_runs {
            run.fail(ReduceError::Disconnected);
        }
    }

    /// Idempotent cleanup of a run's local and remote resources.
    pub async fn release_remote_resources(
        &self,
        nodes: &[NodeId],
        req_id: u64,
        distributed_joins: bool,
        mvcc: Option<Arc<dyn MvccTracker>>,
    ) {
        self.inner
            .release_run(req_id, nodes, distributed_joins, mvcc)
            .await;
    }

    /// Executes a split query and returns the streaming result.
    pub async fn query(
        &self,
        schema: &str,
        split: &SplitQuery,
        opts: QueryOptions,
    ) -> Result<RowStream, ReduceError> {
        self.inner.metrics.inc_queries();

        if split.map_queries.is_empty() {
            return Err(ReduceError::Planning("split query has no map queries".into()));
        }
        if split.skip_merge_table && split.explain {
            return Err(ReduceError::Planning(
                "EXPLAIN cannot be combined with the merge table skip".into(),
            ));
        }
        if split.replicated_only && opts.partitions.is_some() {
            return Err(ReduceError::ReplicatedWithPartitions);
        }

        let local = self.inner.adapter.local_node();
        let page_size = self.inner.cfg.page_size;
        let retry_timeout = match opts.timeout {
            Some(t) if !t.is_zero() => t,
            _ => self.inner.cfg.retry_timeout,
        };

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut last_node: Option<NodeId> = None;
        let mut last_cause = String::from("timeout");

        loop {
            if attempt > 0 {
                if started.elapsed() >= retry_timeout {
                    self.inner.metrics.inc_failed_queries();
                    return Err(ReduceError::RetryExhausted {
                        node: last_node,
                        cause: last_cause,
                    });
                }
                sleep(Duration::from_millis(attempt as u64 * 10)).await;
                self.inner.metrics.inc_query_retries();
            }

            // Topology snapshot; a locked transactional topology that moved
            // forces a rollback instead of a retry.
            let (topology, client_first) = match &opts.tx {
                Some(tx) => {
                    if let Some(locked) = tx.locked_topology {
                        if self.inner.cluster.ready_topology() != locked {
                            self.inner.metrics.inc_failed_queries();
                            return Err(ReduceError::TransactionTopologyChanged);
                        }
                    }
                    (tx.topology_version, tx.client_first)
                }
                None => (self.inner.cluster.ready_topology(), false),
            };

            let mapping = if split.local {
                PartitionMapping::local(local)
            } else {
                let req = MappingRequest {
                    caches: &split.cache_ids,
                    topology,
                    partitions: opts.partitions.as_deref(),
                    replicated_only: split.replicated_only,
                };
                match self.inner.mapper.map(&req) {
                    Some(m) if !m.nodes.is_empty() => m,
                    _ => {
                        last_node = None;
                        last_cause =
                            "partition mapping is not stable on the current topology".into();
                        attempt += 1;
                        continue;
                    }
                }
            };

            let mut nodes = mapping.nodes.clone();
            if split.replicated_only || split.explain {
                // Single node suffices; prefer the local one.
                let pick = if nodes.contains(&local) {
                    local
                } else {
                    *nodes
                        .choose(&mut rand::thread_rng())
                        .expect("mapping produced no nodes")
                };
                nodes = vec![pick];
            }

            let segments: u32 = if split.replicated_only || split.explain {
                1
            } else {
                split
                    .cache_ids
                    .first()
                    .map(|c| self.inner.cluster.cache_parallelism(*c) as u32)
                    .unwrap_or(1)
                    .max(1)
            };

            let req_id = self.inner.qry_id_gen.fetch_add(1, Ordering::SeqCst) + 1;

            let mut indexes: Vec<Arc<MergeIndex>> = Vec::with_capacity(split.map_queries.len());
            let mut bound_tables: Vec<Arc<MergeTable>> = Vec::new();
            for (i, map) in split.map_queries.iter().enumerate() {
                let index = if map.sorted() && !split.skip_merge_table {
                    Arc::new(MergeIndex::sorted(i, map.sort_columns.clone()))
                } else {
                    Arc::new(MergeIndex::unsorted(i))
                };

                if map.partitioned {
                    index.set_sources(&nodes, segments);
                } else {
                    // A purely replicated map query runs on one node only.
                    let pick = *nodes
                        .choose(&mut rand::thread_rng())
                        .expect("mapping produced no nodes");
                    index.set_sources(&[pick], 1);
                }

                if !split.skip_merge_table {
                    let columns = if split.explain {
                        vec![ColumnMeta::plan()]
                    } else {
                        map.columns.clone()
                    };
                    let table = Arc::new(MergeTable::new(i, columns, index.clone()));
                    self.inner.tables.bind(i, table.clone());
                    bound_tables.push(table);
                }

                indexes.push(index);
            }

            let latch_count = if split.replicated_only {
                1
            } else {
                split.partitioned_map_queries() * nodes.len() * segments as usize
                    + split.replicated_map_queries()
            };

            let conn = match self.inner.engine.connection(schema) {
                Ok(conn) => conn,
                Err(e) => {
                    self.inner.tables.unbind(split.map_queries.len());
                    self.inner.metrics.inc_failed_queries();
                    return Err(e);
                }
            };

            let for_update = split
                .for_update
                .then(|| Arc::new(ForUpdateFuture::new()));

            let run = Arc::new(QueryRun::new(
                req_id,
                page_size,
                opts.data_page_scan,
                nodes.clone(),
                indexes.clone(),
                latch_count,
                conn,
                for_update.clone(),
            ));
            self.inner.runs.lock().insert(req_id, run.clone());

            // Cancel handler: fails the run and broadcasts one cancel
            // request to the mapped node set.
            {
                let inner = self.inner.clone();
                let cancel = opts.cancel.clone();
                run.attach_watcher(tokio::spawn(async move {
                    cancel.cancelled().await;
                    inner.cancel_run(req_id).await;
                }));
            }

            let queries: Vec<String> = split
                .map_queries
                .iter()
                .map(|q| {
                    if split.explain {
                        format!("EXPLAIN {}", q.sql)
                    } else {
                        q.sql.clone()
                    }
                })
                .collect();

            let mvcc_snapshot = opts
                .tx
                .as_ref()
                .and_then(|tx| tx.snapshot)
                .or_else(|| opts.mvcc.as_ref().map(|t| t.snapshot()));

            let base = QueryRequest {
                req_id,
                topology,
                page_size,
                cache_ids: split.cache_ids.clone(),
                tables: split
                    .distributed_joins
                    .then(|| split.tables.clone())
                    .flatten(),
                queries,
                params: opts.params.clone(),
                partitions: None,
                flags: QueryFlags {
                    // Forced on the map side so its join order never depends
                    // on per-node statistics.
                    enforce_join_order: true,
                    distributed_joins: split.distributed_joins,
                    local: split.local,
                    explain: split.explain,
                    replicated: split.replicated_only,
                    lazy: opts.lazy && split.map_queries.len() == 1,
                },
                timeout: opts.timeout,
                schema: schema.to_owned(),
                mvcc: mvcc_snapshot,
                tx: None,
            };

            let tx_meta = if split.for_update { opts.tx.clone() } else { None };
            let node_partitions: HashMap<NodeId, Vec<u32>> = if mapping.query_partitions.is_empty()
            {
                mapping.partitions.clone()
            } else {
                mapping.query_partitions.clone()
            };
            let for_update_ref = for_update.clone();
            let specialize = move |node: NodeId, msg: &OutboundMessage| -> OutboundMessage {
                let OutboundMessage::Query(base) = msg else {
                    return msg.clone();
                };
                let mut m = base.clone();
                m.partitions = node_partitions.get(&node).cloned();
                if let (Some(tx), Some(for_update)) = (&tx_meta, &for_update_ref) {
                    m.tx = Some(TxRequestMeta {
                        xid: tx.xid,
                        request_id: Uuid::new_v4(),
                        order: for_update.next_order(),
                        thread_id: tx.thread_id,
                        subject: tx.subject,
                        task_name_hash: tx.task_name_hash,
                        client_first,
                        remaining: tx.remaining,
                    });
                }
                OutboundMessage::Query(m)
            };

            let sent = self
                .inner
                .adapter
                .send_to(&nodes, &OutboundMessage::Query(base), Some(&specialize), true)
                .await;

            if sent {
                self.await_replies(&run, &opts.cancel).await;
            } else {
                run.set_retry(topology, nodes.first().copied(), "failed to send map query request");
                run.latch.force_zero();
            }

            match run.state() {
                RunState::Running => {}
                RunState::Retry {
                    topology: retry_at,
                    node,
                    cause,
                } => {
                    debug!(req_id, ?node, %cause, "retrying reduce query on a newer topology");
                    last_node = node;
                    last_cause = cause;
                    self.inner
                        .release_run(req_id, &nodes, split.distributed_joins, None)
                        .await;
                    self.inner.cluster.await_topology(retry_at).await;
                    attempt += 1;
                    continue;
                }
                RunState::Failed(err) => {
                    self.inner
                        .release_run(req_id, &nodes, split.distributed_joins, opts.mvcc.clone())
                        .await;
                    self.inner.metrics.inc_failed_queries();
                    if let Some(for_update) = &for_update {
                        for_update.fail(err.clone());
                    }
                    return Err(err);
                }
                RunState::Disconnected => {
                    self.inner
                        .release_run(req_id, &nodes, split.distributed_joins, opts.mvcc.clone())
                        .await;
                    self.inner.metrics.inc_failed_queries();
                    if let Some(for_update) = &for_update {
                        for_update.fail(ReduceError::Disconnected);
                    }
                    return Err(ReduceError::Disconnected);
                }
            }

            if let Some(for_update) = &for_update {
                for_update.complete();
            }

            let delivery: Result<RowStream, ReduceError> = async {
                // A run that turned terminal while we were not looking must
                // not hand out an iterator.
                if let RunState::Failed(err) = run.state() {
                    return Err(err);
                }

                if split.skip_merge_table {
                    let guard = ReleaseGuard::new(
                        Arc::downgrade(&self.inner),
                        req_id,
                        nodes.clone(),
                        split.distributed_joins,
                        opts.mvcc.clone(),
                    );
                    return Ok(RowStream::direct(indexes.clone(), guard));
                }

                let mut conn = run
                    .take_connection()
                    .ok_or_else(|| ReduceError::Engine("reducer connection already taken".into()))?;
                conn.set_enforce_join_order(opts.enforce_join_order);

                let ctx = ReduceContext {
                    request_id: req_id,
                    tables: bound_tables.clone(),
                    timeout: opts.timeout,
                    data_page_scan: opts.data_page_scan,
                };

                if split.explain {
                    let mut rows = Vec::new();
                    for i in 0..split.map_queries.len() {
                        let sql = format!("SELECT PLAN FROM {}", merge_table_name(i));
                        let cursor = conn.query(&sql, &[], &ctx).await?;
                        drain_cursor(cursor, &mut rows).await?;
                    }
                    let sql = format!("EXPLAIN {}", split.reduce_query);
                    let cursor = conn.query(&sql, &opts.params, &ctx).await?;
                    drain_cursor(cursor, &mut rows).await?;

                    self.inner
                        .release_run(req_id, &nodes, split.distributed_joins, opts.mvcc.clone())
                        .await;
                    return Ok(RowStream::of_rows(rows));
                }

                let cursor = conn.query(&split.reduce_query, &opts.params, &ctx).await?;
                let guard = ReleaseGuard::new(
                    Arc::downgrade(&self.inner),
                    req_id,
                    nodes.clone(),
                    split.distributed_joins,
                    opts.mvcc.clone(),
                );
                Ok(RowStream::from_cursor(cursor, guard))
            }
            .await;

            return match delivery {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    // The engine error may just be the surface of a run that
                    // failed or went into retry underneath it.
                    let err = match run.state() {
                        RunState::Failed(err) => err,
                        RunState::Retry { node, cause, .. } => {
                            ReduceError::RetryNeeded { node, cause }
                        }
                        RunState::Disconnected => ReduceError::Disconnected,
                        RunState::Running => e,
                    };
                    self.inner
                        .release_run(req_id, &nodes, split.distributed_joins, opts.mvcc.clone())
                        .await;
                    self.inner.metrics.inc_failed_queries();
                    Err(err)
                }
            };
        }
    }

    /// Blocks on the reply latch, polling for cancellation and for the
    /// liveness of every mapped node.
    async fn await_replies(&self, run: &Arc<QueryRun>, cancel: &QueryCancel) {
        let poll = self.inner.cfg.poll_interval;
        loop {
            if timeout(poll, run.latch.wait()).await.is_ok() {
                return;
            }

            if cancel.is_cancelled() {
                self.inner.cancel_run(run.req_id).await;
                return;
            }

            for node in run.nodes.clone() {
                if !self.inner.cluster.is_alive(node) {
                    self.inner.handle_node_left(run, node);
                }
            }
        }
    }

    /// Executes a distributed DML statement. Returns `Ok(None)` when some
    /// mapped node cannot run server-side DML and the caller has to fall
    /// back to the client-side path.
    pub async fn update(
        &self,
        schema: &str,
        split: &SplitQuery,
        opts: QueryOptions,
    ) -> Result<Option<UpdateResult>, ReduceError> {
        self.inner.metrics.inc_updates();

        let local = self.inner.adapter.local_node();
        let topology = self.inner.cluster.ready_topology();

        let mapping = if split.local {
            PartitionMapping::local(local)
        } else {
            let req = MappingRequest {
                caches: &split.cache_ids,
                topology,
                partitions: opts.partitions.as_deref(),
                replicated_only: split.replicated_only,
            };
            match self.inner.mapper.map(&req) {
                Some(m) if !m.nodes.is_empty() => m,
                _ => {
                    self.inner.metrics.inc_failed_updates();
                    return Err(ReduceError::MappingFailed(
                        "partition mapping is not stable on the current topology".into(),
                    ));
                }
            }
        };

        let mut nodes = mapping.nodes.clone();
        if split.replicated_only {
            let pick = if nodes.contains(&local) {
                local
            } else {
                *nodes
                    .choose(&mut rand::thread_rng())
                    .expect("mapping produced no nodes")
            };
            nodes = vec![pick];
        }

        for &node in &nodes {
            let supported = self
                .inner
                .cluster
                .node_version(node)
                .is_some_and(|v| v >= MIN_SERVER_DML_VERSION);
            if !supported {
                warn!(
                    node = %node,
                    "server-side DML not supported by mapped node, falling back to client-side update"
                );
                return Ok(None);
            }
        }

        let req_id = self.inner.qry_id_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let run = Arc::new(UpdateRun::new(req_id, nodes.clone()));
        self.inner.upd_runs.lock().insert(req_id, run.clone());

        let watcher = {
            let inner = self.inner.clone();
            let cancel = opts.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                inner.cancel_update(req_id).await;
            })
        };

        let base = DmlRequest {
            req_id,
            topology,
            cache_ids: split.cache_ids.clone(),
            schema: schema.to_owned(),
            statement: split.reduce_query.clone(),
            params: opts.params.clone(),
            partitions: None,
            flags: QueryFlags {
                enforce_join_order: opts.enforce_join_order,
                distributed_joins: split.distributed_joins,
                local: split.local,
                explain: false,
                replicated: split.replicated_only,
                lazy: false,
            },
            timeout: opts.timeout,
        };

        let node_partitions = if mapping.query_partitions.is_empty() {
            mapping.partitions.clone()
        } else {
            mapping.query_partitions.clone()
        };
        let specialize = move |node: NodeId, msg: &OutboundMessage| -> OutboundMessage {
            let OutboundMessage::Dml(base) = msg else {
                return msg.clone();
            };
            let mut m = base.clone();
            m.partitions = node_partitions.get(&node).cloned();
            OutboundMessage::Dml(m)
        };

        let sent = self
            .inner
            .adapter
            .send_to(&nodes, &OutboundMessage::Dml(base), Some(&specialize), true)
            .await;
        if !sent {
            run.fail(ReduceError::SendFailed(
                "DML request delivery failed".into(),
            ));
        }

        let result = run.wait().await;

        watcher.abort();
        if self.inner.upd_runs.lock().remove(&req_id).is_none() {
            warn!(req_id, "update run already removed");
        }

        match result {
            Ok(affected) => Ok(Some(UpdateResult {
                affected_rows: affected,
            })),
            Err(e) => {
                self.inner.metrics.inc_failed_updates();
                Err(e)
            }
        }
    }
}

impl ReducerInner {
    /// Fails the run with a cancellation error and broadcasts one cancel
    /// request to its mapped node set.
    pub(crate) async fn cancel_run(&self, req_id: u64) {
        let run = self.runs.lock().get(&req_id).cloned();
        let Some(run) = run else {
            return;
        };

        run.fail(ReduceError::Cancelled);
        if run.begin_cancel_broadcast() {
            self.broadcast_cancel(&run.nodes, req_id).await;
        }
    }

    pub(crate) async fn cancel_update(&self, req_id: u64) {
        let run = self.upd_runs.lock().get(&req_id).cloned();
        let Some(run) = run else {
            return;
        };

        run.fail(ReduceError::Cancelled);
        if run.begin_cancel_broadcast() {
            self.broadcast_cancel(&run.nodes, req_id).await;
        }
    }

    pub(crate) async fn broadcast_cancel(&self, nodes: &[NodeId], req_id: u64) {
        self.adapter
            .send_to(
                nodes,
                &OutboundMessage::Cancel(QueryCancelRequest { req_id }),
                None,
                false,
            )
            .await;
    }

    /// Local half of the release: unregisters the run, resets its merge
    /// table slots and reports whether unread remote data remains.
    pub(crate) fn finish_run(&self, req_id: u64) -> Option<(Arc<QueryRun>, bool)> {
        let run = self.runs.lock().remove(&req_id);
        let Some(run) = run else {
            warn!(req_id, "query run already released");
            return None;
        };

        run.abort_watcher();
        self.tables.unbind(run.indexes.len());
        let unread = run.indexes.iter().any(|i| i.has_unread());
        Some((run, unread))
    }

    /// Idempotent full release: local cleanup, optional cancel broadcast to
    /// the mapped nodes, MVCC tracker completion. A run is released at most
    /// once; repeated calls for the same request id do nothing, the tracker
    /// included.
    pub(crate) async fn release_run(
        &self,
        req_id: u64,
        nodes: &[NodeId],
        distributed_joins: bool,
        mvcc: Option<Arc<dyn MvccTracker>>,
    ) {
        if let Some((run, unread)) = self.finish_run(req_id) {
            if (distributed_joins || unread) && run.begin_cancel_broadcast() {
                self.broadcast_cancel(nodes, req_id).await;
            }
            if let Some(tracker) = mvcc {
                tracker.on_done();
            }
        }
    }

    /// Moves a run into retry because `node` left, and wakes both the latch
    /// waiter and any consumer blocked on a page from that node.
    pub(crate) fn handle_node_left(&self, run: &Arc<QueryRun>, node: NodeId) {
        let relevant =
            run.nodes.contains(&node) || run.indexes.iter().any(|i| i.has_source_node(node));
        if !relevant {
            return;
        }

        let cause = format!("node left the cluster: {node}");
        if run.set_retry(self.cluster.ready_topology(), Some(node), cause.clone()) {
            warn!(
                req_id = run.req_id,
                node = %node,
                awaited = run.latch.count(),
                "map node left, retrying reduce query"
            );
        }
        run.latch.force_zero();

        for index in run.indexes.iter().filter(|i| i.has_source_node(node)) {
            index.fail(ReduceError::RetryNeeded {
                node: Some(node),
                cause: cause.clone(),
            });
        }
    }
}

#[async_trait]
impl PageFetch for ReducerInner {
    /// Issues the next-page request for one stream; no-op once the run is
    /// gone, error once it is retrying or terminal.
    async fn fetch_next_page(
        &self,
        req_id: u64,
        query: usize,
        source: SourceKey,
    ) -> Result<(), ReduceError> {
        let run = self.runs.lock().get(&req_id).cloned();
        let Some(run) = run else {
            return Ok(());
        };

        match run.state() {
            RunState::Running => {}
            RunState::Retry { node, cause, .. } => {
                return Err(ReduceError::RetryNeeded { node, cause });
            }
            RunState::Failed(err) => return Err(err),
            RunState::Disconnected => return Err(ReduceError::Disconnected),
        }

        let msg = OutboundMessage::NextPage(NextPageRequest {
            req_id,
            query,
            segment: source.segment,
            page_size: run.page_size,
            data_page_scan: run.data_page_scan,
        });

        if self.adapter.send_to(&[source.node], &msg, None, true).await {
            Ok(())
        } else {
            Err(ReduceError::SendFailed(format!(
                "next-page request to node {}",
                source.node
            )))
        }
    }
}

async fn drain_cursor(
    mut cursor: Box<dyn RowCursor>,
    out: &mut Vec<Row>,
) -> Result<(), ReduceError> {
    while let Some(row) = cursor.next_row().await? {
        out.push(row);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_setters_override_defaults() {
        let mut config = ReducerConfig::new();
        config.set_page_size(64);
        config.set_retry_timeout(Duration::from_millis(250));
        config.set_poll_interval(Duration::from_millis(50));

        assert_eq!(config.page_size, 64);
        assert_eq!(config.retry_timeout, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn retry_timeout_env_override_parses_milliseconds() {
        std::env::set_var(RETRY_TIMEOUT_ENV, "1500");
        assert_eq!(
            ReducerConfig::new().retry_timeout,
            Duration::from_millis(1500)
        );

        std::env::set_var(RETRY_TIMEOUT_ENV, "not-a-number");
        assert_eq!(ReducerConfig::new().retry_timeout, DEFAULT_RETRY_TIMEOUT);

        std::env::remove_var(RETRY_TIMEOUT_ENV);
        assert_eq!(ReducerConfig::new().retry_timeout, DEFAULT_RETRY_TIMEOUT);
    }
}
