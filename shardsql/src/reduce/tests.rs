//! Scenario coverage for the reduce coordinator, driven through in-process
//! fakes of the cluster view, partition mapper, transport and SQL engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::engine::{
    MvccSnapshot, MvccTracker, ReduceConnection, ReduceContext, ReduceEngine, RowCursor,
};
use crate::row::{ColumnMeta, DataType, Row, Value};
use crate::statement::{ActiveTx, MapQuery, QueryCancel, QueryOptions, SplitQuery};
use crate::transport::cluster::{
    CacheId, ClusterView, MappingRequest, NodeId, NodeVersion, PartitionMapper, PartitionMapping,
    TopologyVersion,
};
use crate::transport::errors::{ReduceError, SendError};
use crate::transport::messages::{
    DmlResponse, InboundMessage, NextPageResponse, OutboundMessage, RetryRequest,
};
use crate::transport::Transport;

use super::executor::{Reducer, ReducerConfig};

pub(crate) mod support {
    use super::*;

    /// Connection stub for unit tests that never reach the reduce phase.
    pub(crate) struct NullConnection;

    #[async_trait]
    impl ReduceConnection for NullConnection {
        fn set_enforce_join_order(&mut self, _enabled: bool) {}

        async fn query(
            &mut self,
            _sql: &str,
            _params: &[Value],
            _ctx: &ReduceContext,
        ) -> Result<Box<dyn RowCursor>, ReduceError> {
            Err(ReduceError::Engine("null connection".into()))
        }
    }
}

struct FakeCluster {
    local: NodeId,
    alive: Mutex<HashMap<NodeId, bool>>,
    versions: Mutex<HashMap<NodeId, NodeVersion>>,
    topology: AtomicU64,
    bumped: Notify,
}

impl FakeCluster {
    fn new(local: NodeId, nodes: &[NodeId]) -> FakeCluster {
        let mut alive = HashMap::new();
        let mut versions = HashMap::new();
        alive.insert(local, true);
        versions.insert(local, NodeVersion::new(2, 7, 0));
        for &node in nodes {
            alive.insert(node, true);
            versions.insert(node, NodeVersion::new(2, 7, 0));
        }
        FakeCluster {
            local,
            alive: Mutex::new(alive),
            versions: Mutex::new(versions),
            topology: AtomicU64::new(1),
            bumped: Notify::new(),
        }
    }

    fn set_alive(&self, node: NodeId, alive: bool) {
        self.alive.lock().insert(node, alive);
    }

    fn set_version(&self, node: NodeId, version: NodeVersion) {
        self.versions.lock().insert(node, version);
    }
}

#[async_trait]
impl ClusterView for FakeCluster {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.alive.lock().get(&node).copied().unwrap_or(false)
    }

    fn node_version(&self, node: NodeId) -> Option<NodeVersion> {
        self.versions.lock().get(&node).copied()
    }

    fn ready_topology(&self) -> TopologyVersion {
        TopologyVersion(self.topology.load(Ordering::SeqCst))
    }

    async fn await_topology(&self, at_least: TopologyVersion) {
        loop {
            let notified = self.bumped.notified();
            if self.ready_topology() >= at_least {
                return;
            }
            notified.await;
        }
    }
}

struct FakeMapper {
    script: Mutex<VecDeque<Option<PartitionMapping>>>,
    fallback: Mutex<Option<PartitionMapping>>,
    calls: AtomicUsize,
}

impl FakeMapper {
    fn new(fallback: Option<PartitionMapping>) -> FakeMapper {
        FakeMapper {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
        }
    }

    fn push_script(&self, mapping: Option<PartitionMapping>) {
        self.script.lock().push_back(mapping);
    }

    fn set_unstable(&self) {
        *self.fallback.lock() = None;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PartitionMapper for FakeMapper {
    fn map(&self, _req: &MappingRequest<'_>) -> Option<PartitionMapping> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }
        self.fallback.lock().clone()
    }
}

struct ChannelTransport {
    tx: mpsc::UnboundedSender<(NodeId, OutboundMessage)>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, node: NodeId, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.send((node, msg)).map_err(|_| SendError {
            node,
            reason: "transport closed".into(),
        })
    }
}

struct StaticCursor {
    rows: VecDeque<Row>,
}

#[async_trait]
impl RowCursor for StaticCursor {
    async fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        Ok(self.rows.pop_front())
    }
}

/// Minimal engine: table references resolve against the reduce context and
/// EXPLAIN statements echo themselves as a one-row plan.
struct PassthroughEngine;

impl ReduceEngine for PassthroughEngine {
    fn connection(&self, _schema: &str) -> Result<Box<dyn ReduceConnection>, ReduceError> {
        Ok(Box::new(PassthroughConnection))
    }
}

struct PassthroughConnection;

#[async_trait]
impl ReduceConnection for PassthroughConnection {
    fn set_enforce_join_order(&mut self, _enabled: bool) {}

    async fn query(
        &mut self,
        sql: &str,
        _params: &[Value],
        ctx: &ReduceContext,
    ) -> Result<Box<dyn RowCursor>, ReduceError> {
        if sql.starts_with("EXPLAIN ") {
            return Ok(Box::new(StaticCursor {
                rows: VecDeque::from([Row::of([Value::Text(sql.to_owned())])]),
            }));
        }
        for table in &ctx.tables {
            if sql.contains(table.name()) {
                return Ok(Box::new(table.cursor()));
            }
        }
        Err(ReduceError::Engine(format!("unknown table in `{sql}`")))
    }
}

struct Rig {
    reducer: Arc<Reducer>,
    cluster: Arc<FakeCluster>,
    mapper: Arc<FakeMapper>,
    pages: Arc<Mutex<HashMap<NodeId, VecDeque<NextPageResponse>>>>,
    dml: Arc<Mutex<HashMap<NodeId, VecDeque<DmlResponse>>>>,
    record: Arc<Mutex<Vec<(NodeId, OutboundMessage)>>>,
}

impl Rig {
    fn new(nodes: &[NodeId]) -> Rig {
        let local = NodeId::random();
        let cluster = Arc::new(FakeCluster::new(local, nodes));
        let mapper = Arc::new(FakeMapper::new(Some(mapping(nodes))));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut cfg = ReducerConfig::new();
        cfg.set_page_size(2);
        cfg.set_retry_timeout(Duration::from_secs(30));
        cfg.set_poll_interval(Duration::from_millis(500));
        let reducer = Arc::new(Reducer::new(
            cfg,
            Arc::new(ChannelTransport { tx }),
            cluster.clone(),
            mapper.clone(),
            Arc::new(PassthroughEngine),
        ));

        let pages: Arc<Mutex<HashMap<NodeId, VecDeque<NextPageResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let dml: Arc<Mutex<HashMap<NodeId, VecDeque<DmlResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let record: Arc<Mutex<Vec<(NodeId, OutboundMessage)>>> = Arc::new(Mutex::new(Vec::new()));

        // Map side: answers query and next-page requests from the per-node
        // scripts, stamping the current request id.
        {
            let reducer = reducer.clone();
            let pages = pages.clone();
            let dml = dml.clone();
            let record = record.clone();
            tokio::spawn(async move {
                while let Some((node, msg)) = rx.recv().await {
                    record.lock().push((node, msg.clone()));
                    match msg {
                        OutboundMessage::Query(q) => {
                            let next = pages.lock().get_mut(&node).and_then(|s| s.pop_front());
                            if let Some(mut resp) = next {
                                resp.req_id = q.req_id;
                                reducer.on_message(node, InboundMessage::NextPage(resp));
                            }
                        }
                        OutboundMessage::NextPage(q) => {
                            let next = pages.lock().get_mut(&node).and_then(|s| s.pop_front());
                            if let Some(mut resp) = next {
                                resp.req_id = q.req_id;
                                reducer.on_message(node, InboundMessage::NextPage(resp));
                            }
                        }
                        OutboundMessage::Dml(q) => {
                            let next = dml.lock().get_mut(&node).and_then(|s| s.pop_front());
                            if let Some(mut resp) = next {
                                resp.req_id = q.req_id;
                                reducer.on_message(node, InboundMessage::Dml(resp));
                            }
                        }
                        OutboundMessage::Cancel(_) => {}
                    }
                }
            });
        }

        Rig {
            reducer,
            cluster,
            mapper,
            pages,
            dml,
            record,
        }
    }

    fn script(&self, node: NodeId, responses: Vec<NextPageResponse>) {
        self.pages.lock().insert(node, responses.into());
    }

    fn script_dml(&self, node: NodeId, affected: u64) {
        self.dml.lock().entry(node).or_default().push_back(DmlResponse {
            req_id: 0,
            affected,
            error: None,
        });
    }

    fn cancel_count(&self) -> usize {
        self.record
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::Cancel(_)))
            .count()
    }

    fn dml_sent(&self) -> usize {
        self.record
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m, OutboundMessage::Dml(_)))
            .count()
    }

    fn total_sent(&self) -> usize {
        self.record.lock().len()
    }

    fn query_requests(&self) -> Vec<(NodeId, crate::transport::messages::QueryRequest)> {
        self.record
            .lock()
            .iter()
            .filter_map(|(n, m)| match m {
                OutboundMessage::Query(q) => Some((*n, q.clone())),
                _ => None,
            })
            .collect()
    }
}

fn mapping(nodes: &[NodeId]) -> PartitionMapping {
    PartitionMapping {
        nodes: nodes.to_vec(),
        partitions: HashMap::new(),
        query_partitions: HashMap::new(),
    }
}

fn page(query: usize, page_no: u32, values: &[i32], last: bool) -> NextPageResponse {
    NextPageResponse {
        req_id: 0,
        query,
        segment: 0,
        page_no,
        rows: values.iter().map(|&v| Row::of([Value::Int(v)])).collect(),
        last,
        retry: None,
        all_rows: None,
        remove_mapping: false,
    }
}

fn plan_page(text: &str) -> NextPageResponse {
    NextPageResponse {
        rows: vec![Row::of([Value::Text(text.to_owned())])],
        ..page(0, 0, &[], true)
    }
}

fn one_map_split() -> SplitQuery {
    let mut split = SplitQuery::new(
        "SELECT * FROM T___0",
        vec![MapQuery::new(
            "SELECT V FROM DATA",
            vec![ColumnMeta::new("V", DataType::Int)],
        )],
    );
    split.cache_ids = vec![CacheId(1)];
    split
}

fn int0(row: &Row) -> i32 {
    row.column(0).and_then(Value::as_int).expect("int column")
}

#[tokio::test]
async fn happy_path_streams_pages_from_two_nodes() {
    let n1 = NodeId::random();
    let n2 = NodeId::random();
    let rig = Rig::new(&[n1, n2]);

    rig.script(n1, vec![page(0, 0, &[1, 2], false), page(0, 1, &[5], true)]);
    rig.script(n2, vec![page(0, 0, &[3, 4], false), page(0, 1, &[6], true)]);

    let stream = rig
        .reducer
        .query("PUBLIC", &one_map_split(), QueryOptions::new())
        .await
        .unwrap();
    let rows = stream.try_collect().await.unwrap();
    let values: Vec<i32> = rows.iter().map(int0).collect();

    let mut sorted = values.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6]);

    // Cross-source order is free, intra-source order is FIFO.
    let pos = |v: i32| values.iter().position(|&x| x == v).unwrap();
    assert!(pos(1) < pos(2) && pos(2) < pos(5));
    assert!(pos(3) < pos(4) && pos(4) < pos(6));

    assert_eq!(rig.reducer.active_runs(), 0);
    assert_eq!(rig.reducer.metrics().queries(), 1);
    assert_eq!(rig.reducer.metrics().failed_queries(), 0);
}

#[tokio::test]
async fn mapper_instability_retries_until_mapping_succeeds() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    rig.mapper.push_script(None);
    rig.mapper.push_script(None);
    rig.script(n1, vec![page(0, 0, &[1], true)]);

    let rows = rig
        .reducer
        .query("PUBLIC", &one_map_split(), QueryOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rig.mapper.calls(), 3);
    assert_eq!(rig.reducer.metrics().query_retries(), 2);
}

#[tokio::test]
async fn retry_budget_exhaustion_cites_the_last_cause() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    rig.mapper.set_unstable();

    let err = rig
        .reducer
        .query(
            "PUBLIC",
            &one_map_split(),
            QueryOptions::new().with_timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ReduceError::RetryExhausted { cause, .. } if cause.contains("mapping")
    );
    assert_eq!(rig.total_sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn node_leaving_mid_query_forces_retry() {
    let n1 = NodeId::random();
    let n2 = NodeId::random();
    let rig = Rig::new(&[n1, n2]);

    // First mapping still names the dead node; the liveness poll catches it.
    rig.cluster.set_alive(n1, false);
    rig.mapper.push_script(Some(mapping(&[n1, n2])));
    rig.mapper.push_script(Some(mapping(&[n2])));
    rig.script(n2, vec![page(0, 0, &[7], true), page(0, 0, &[42], true)]);

    let rows = rig
        .reducer
        .query("PUBLIC", &one_map_split(), QueryOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(rows.iter().map(int0).collect::<Vec<_>>(), vec![42]);
    assert!(rig.reducer.metrics().query_retries() >= 1);
    assert_eq!(rig.reducer.active_runs(), 0);
}

#[tokio::test]
async fn cancellation_broadcasts_once_and_fails_the_consumer() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    // One non-final page, then the source goes quiet.
    rig.script(n1, vec![page(0, 0, &[1, 2], false)]);

    let cancel = QueryCancel::new();
    let mut stream = rig
        .reducer
        .query(
            "PUBLIC",
            &one_map_split(),
            QueryOptions::new().with_cancel(cancel.clone()),
        )
        .await
        .unwrap();

    assert_eq!(int0(&stream.next_row().await.unwrap().unwrap()), 1);
    assert_eq!(int0(&stream.next_row().await.unwrap().unwrap()), 2);

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = stream.next_row().await.unwrap().unwrap_err();
    assert_matches!(err, ReduceError::Cancelled);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.cancel_count(), 1);
    assert_eq!(rig.reducer.active_runs(), 0);
}

#[tokio::test]
async fn explicit_partitions_over_replicated_plan_are_rejected() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    let mut split = one_map_split();
    split.replicated_only = true;
    split.map_queries[0].partitioned = false;

    let mut opts = QueryOptions::new();
    opts.partitions = Some(vec![1, 2]);

    let err = rig.reducer.query("PUBLIC", &split, opts).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Partitions are not supported for replicated caches"
    );
    assert_eq!(rig.total_sent(), 0);
}

#[tokio::test]
async fn old_node_version_falls_back_to_client_side_dml() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    rig.cluster.set_version(n1, NodeVersion::new(2, 1, 0));

    let mut split = SplitQuery::new("UPDATE DATA SET V = 0", Vec::new());
    split.cache_ids = vec![CacheId(1)];

    let result = rig
        .reducer
        .update("PUBLIC", &split, QueryOptions::new())
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(rig.dml_sent(), 0);
}

#[tokio::test]
async fn dml_aggregates_affected_rows_across_nodes() {
    let n1 = NodeId::random();
    let n2 = NodeId::random();
    let rig = Rig::new(&[n1, n2]);
    rig.script_dml(n1, 3);
    rig.script_dml(n2, 4);

    let mut split = SplitQuery::new("UPDATE DATA SET V = 0", Vec::new());
    split.cache_ids = vec![CacheId(1)];

    let result = rig
        .reducer
        .update("PUBLIC", &split, QueryOptions::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.affected_rows, 7);
    assert_eq!(rig.dml_sent(), 2);
    assert_eq!(rig.reducer.active_update_runs(), 0);
}

#[tokio::test]
async fn explain_concatenates_map_and_reduce_plans() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    rig.script(n1, vec![plan_page("map plan")]);

    let mut split = one_map_split();
    split.explain = true;

    let rows = rig
        .reducer
        .query("PUBLIC", &split, QueryOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let texts: Vec<&str> = rows
        .iter()
        .map(|r| r.column(0).and_then(Value::as_text).unwrap())
        .collect();
    assert_eq!(texts, vec!["map plan", "EXPLAIN SELECT * FROM T___0"]);
    assert_eq!(rig.reducer.active_runs(), 0);

    // The outbound map queries were EXPLAIN-wrapped.
    let requests = rig.query_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.queries, vec!["EXPLAIN SELECT V FROM DATA"]);
}

#[tokio::test]
async fn skip_merge_table_streams_map_results_directly() {
    let n1 = NodeId::random();
    let n2 = NodeId::random();
    let rig = Rig::new(&[n1, n2]);
    rig.script(n1, vec![page(0, 0, &[1, 2], true)]);
    rig.script(n2, vec![page(0, 0, &[3], true)]);

    let mut split = one_map_split();
    split.skip_merge_table = true;

    let rows = rig
        .reducer
        .query("PUBLIC", &split, QueryOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let mut values: Vec<i32> = rows.iter().map(int0).collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn skip_merge_table_with_explain_is_rejected_at_planning() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    let mut split = one_map_split();
    split.skip_merge_table = true;
    split.explain = true;

    let err = rig
        .reducer
        .query("PUBLIC", &split, QueryOptions::new())
        .await
        .unwrap_err();
    assert_matches!(err, ReduceError::Planning(_));
    assert_eq!(rig.total_sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_active_runs() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    // No scripted pages: the run stays parked on its latch.

    let reducer = rig.reducer.clone();
    let handle = tokio::spawn(async move {
        reducer
            .query("PUBLIC", &one_map_split(), QueryOptions::new())
            .await
    });

    while rig.reducer.active_runs() == 0 {
        tokio::task::yield_now().await;
    }
    rig.reducer.on_disconnected();

    let err = handle.await.unwrap().unwrap_err();
    assert_matches!(err, ReduceError::Disconnected);
    assert_eq!(rig.reducer.active_runs(), 0);
}

#[tokio::test]
async fn for_update_requests_carry_per_node_tx_details() {
    let n1 = NodeId::random();
    let n2 = NodeId::random();
    let rig = Rig::new(&[n1, n2]);

    let mut first = page(0, 0, &[1], true);
    first.all_rows = Some(1);
    let mut second = page(0, 0, &[2], true);
    second.all_rows = Some(1);
    rig.script(n1, vec![first]);
    rig.script(n2, vec![second]);

    let mut split = one_map_split();
    split.for_update = true;

    let mut opts = QueryOptions::new();
    opts.tx = Some(ActiveTx {
        xid: uuid::Uuid::new_v4(),
        thread_id: 7,
        subject: uuid::Uuid::new_v4(),
        task_name_hash: 13,
        topology_version: TopologyVersion(1),
        client_first: true,
        locked_topology: None,
        remaining: Some(Duration::from_secs(5)),
        snapshot: None,
    });

    let rows = rig
        .reducer
        .query("PUBLIC", &split, opts)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let requests = rig.query_requests();
    assert_eq!(requests.len(), 2);
    let tx0 = requests[0].1.tx.as_ref().expect("tx details");
    let tx1 = requests[1].1.tx.as_ref().expect("tx details");
    assert_ne!(tx0.request_id, tx1.request_id);
    let mut orders = vec![tx0.order, tx1.order];
    orders.sort_unstable();
    assert_eq!(orders, vec![0, 1]);
    assert!(tx0.client_first && tx1.client_first);
}

#[tokio::test]
async fn mvcc_tracker_is_signalled_once_on_release() {
    struct CountingTracker(AtomicUsize);
    impl MvccTracker for CountingTracker {
        fn snapshot(&self) -> MvccSnapshot {
            MvccSnapshot {
                coordinator_version: 1,
                counter: 1,
            }
        }
        fn on_done(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    rig.script(n1, vec![page(0, 0, &[1], true)]);

    let tracker = Arc::new(CountingTracker(AtomicUsize::new(0)));
    let mut opts = QueryOptions::new();
    opts.mvcc = Some(tracker.clone());

    let rows = rig
        .reducer
        .query("PUBLIC", &one_map_split(), opts)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(tracker.0.load(Ordering::SeqCst), 1);

    // Releasing again is a no-op, for the run registry and the tracker both.
    rig.reducer
        .release_remote_resources(&[n1], 1, false, Some(tracker.clone()))
        .await;
    assert_eq!(tracker.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn map_node_retry_response_restarts_the_attempt() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    let mut retry = page(0, 0, &[], false);
    retry.retry = Some(RetryRequest {
        topology: TopologyVersion(1),
        cause: "partition state changed".into(),
    });
    rig.script(n1, vec![retry, page(0, 0, &[11], true)]);

    let rows = rig
        .reducer
        .query("PUBLIC", &one_map_split(), QueryOptions::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(rows.iter().map(int0).collect::<Vec<_>>(), vec![11]);
    assert!(rig.reducer.metrics().query_retries() >= 1);
}

#[tokio::test]
async fn unknown_request_ids_and_stopped_dispatch_are_noops() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);

    let mut orphan = page(0, 0, &[1], true);
    orphan.req_id = 999;
    rig.reducer
        .on_message(n1, InboundMessage::NextPage(orphan.clone()));
    assert_eq!(rig.reducer.active_runs(), 0);

    rig.reducer.stop();
    rig.reducer.on_message(n1, InboundMessage::NextPage(orphan));
}

#[tokio::test]
async fn map_failure_names_the_failing_node() {
    let n1 = NodeId::random();
    let rig = Rig::new(&[n1]);
    // The pump never responds; the failure comes in by hand.

    let reducer = rig.reducer.clone();
    let handle = tokio::spawn(async move {
        reducer
            .query("PUBLIC", &one_map_split(), QueryOptions::new())
            .await
    });

    while rig.reducer.active_runs() == 0 {
        tokio::task::yield_now().await;
    }
    rig.reducer.on_message(
        n1,
        InboundMessage::Fail(crate::transport::messages::FailResponse {
            req_id: 1,
            code: crate::transport::messages::FailCode::General,
            message: "table not found".into(),
        }),
    );

    let err = handle.await.unwrap().unwrap_err();
    assert_matches!(err, ReduceError::MapNodeFailed { node, .. } if node == n1);
    assert_eq!(rig.reducer.metrics().failed_queries(), 1);
}
