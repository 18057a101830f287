//! The push engine: owns the per-shard schedulers, the remote-consumer
//! registry the receive path dispatches on, the DAG builder, and the DDL
//! operations (create/drop source, create/drop materialized view).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use rill_common::codec::{decode_rows, encode_rows, increment_bytes};
use rill_common::{Error, Result, Rows, RowsBatch, RowsEntry};
use rill_store::keys;
use rill_store::{
    Cluster, QueryExecutionInfo, RemoteQueryCallback, ShardListener, ShardListenerFactory,
};

use crate::exec::agg::Aggregator;
use crate::exec::project::Projection;
use crate::exec::scan::Scan;
use crate::exec::select::Selection;
use crate::exec::table::TableExecutor;
use crate::exec::union::UnionAll;
use crate::exec::{ExecutionContext, PushExecutor};
use crate::forward::{decode_row_payload, Forwarder, RemoteRowHandler, PAYLOAD_UPSERT, RECEIVE_BATCH_SIZE};
use crate::meta::{SourceInfo, TableInfo};
use crate::plan::PhysicalPlan;
use crate::sched::ShardScheduler;
use crate::source::broker::MessageProvider;
use crate::source::Source;

const SCHEMA_LOCK_PREFIX: &str = "schema";
const SCHEMA_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub poll_timeout: Duration,
    pub max_poll_messages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            max_poll_messages: 1000,
        }
    }
}

/// Everything the receive path can hand a bundle of transferred rows to.
enum RemoteConsumer {
    /// A source (or view) table fed row payloads.
    Table { exec: Arc<TableExecutor> },
    /// The full stage of an aggregation fed partial-state pairs.
    Agg { agg: Arc<Aggregator> },
}

struct MvHandle {
    table: TableInfo,
    table_exec: Arc<TableExecutor>,
    /// Names of the tables whose executors feed this view.
    feeding_tables: Vec<String>,
    /// Partial/full aggregation tables owned by the view's DAG.
    internal_table_ids: Vec<u64>,
    /// Consumer registrations owned by the view's DAG.
    agg_consumer_ids: Vec<u64>,
}

pub struct PushEngine {
    cluster: Arc<dyn Cluster>,
    forwarder: Arc<Forwarder>,
    cfg: EngineConfig,
    schedulers: RwLock<HashMap<u64, Arc<ShardScheduler>>>,
    remote_consumers: RwLock<HashMap<u64, Arc<RemoteConsumer>>>,
    tables_by_id: RwLock<HashMap<u64, TableInfo>>,
    sources: RwLock<HashMap<String, Arc<Source>>>,
    mvs: RwLock<HashMap<String, MvHandle>>,
}

impl PushEngine {
    /// Create the engine and register its hooks with the cluster. Must be
    /// called before `Cluster::start`.
    pub fn new(cluster: Arc<dyn Cluster>, cfg: EngineConfig) -> Arc<Self> {
        let forwarder = Forwarder::new(cluster.clone());
        let engine = Arc::new(Self {
            cluster: cluster.clone(),
            forwarder,
            cfg,
            schedulers: RwLock::new(HashMap::new()),
            remote_consumers: RwLock::new(HashMap::new()),
            tables_by_id: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            mvs: RwLock::new(HashMap::new()),
        });
        cluster.register_shard_listener_factory(Arc::new(EngineListenerFactory {
            engine: Arc::downgrade(&engine),
        }));
        cluster.register_remote_query_callback(Arc::new(EngineQueryCallback {
            engine: Arc::downgrade(&engine),
        }));
        engine
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Start shard schedulers, finish crashed fills, and restart any
    /// in-flight transfers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut schedulers = self.schedulers.write().expect("schedulers lock poisoned");
            for shard_id in self.cluster.local_shard_ids() {
                schedulers.insert(shard_id, ShardScheduler::new(shard_id));
            }
        }

        // A fill that died mid-flight left its transient table registered;
        // wipe it before anything consumes stale rows.
        for prefix in self.cluster.prefixes_to_delete()? {
            if prefix.len() < 8 {
                continue;
            }
            let shard_id = keys::shard_of_key(&prefix);
            let suffix = prefix[8..].to_vec();
            tracing::info!(shard = shard_id, "deleting data under crashed fill prefix");
            self.cluster
                .delete_all_data_in_range_for_shard(shard_id, &suffix, &increment_bytes(&suffix))
                .await?;
            self.cluster.unregister_prefix_to_delete(&prefix)?;
        }

        // Rows may be sitting in forwarder or receiver queues from before
        // the restart; both paths are idempotent, and both reschedule
        // themselves until their queues drain.
        for (shard_id, scheduler) in self.processor_schedulers() {
            self.forwarder.schedule_transfer(&scheduler, shard_id);
            let engine = self.clone();
            scheduler.schedule_fire_and_forget(async move {
                engine.process_received(shard_id).await
            });
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let sources: Vec<Arc<Source>> = self
            .sources
            .read()
            .expect("sources lock poisoned")
            .values()
            .cloned()
            .collect();
        for source in sources {
            source.stop_ingest().await?;
        }
        self.schedulers
            .write()
            .expect("schedulers lock poisoned")
            .clear();
        Ok(())
    }

    fn scheduler_for(&self, shard_id: u64) -> Option<Arc<ShardScheduler>> {
        self.schedulers
            .read()
            .expect("schedulers lock poisoned")
            .get(&shard_id)
            .cloned()
    }

    /// Schedulers for the shards this node processes. Fills and transfer
    /// recovery run against these only; other replicas apply the same
    /// writes through their state machines without re-driving the DAG.
    fn processor_schedulers(&self) -> HashMap<u64, Arc<ShardScheduler>> {
        let processor_shards = self.cluster.processor_shard_ids();
        self.schedulers
            .read()
            .expect("schedulers lock poisoned")
            .iter()
            .filter(|(shard_id, _)| processor_shards.contains(shard_id))
            .map(|(shard_id, scheduler)| (*shard_id, scheduler.clone()))
            .collect()
    }

    /// Receive-path entry point; invoked through the shard listener when a
    /// forward-write commits, and on startup. Idempotent.
    fn trigger_receive(self: &Arc<Self>, shard_id: u64) {
        let Some(scheduler) = self.scheduler_for(shard_id) else {
            return;
        };
        let engine = self.clone();
        scheduler.schedule_fire_and_forget(async move {
            engine.process_received(shard_id).await
        });
    }

    async fn process_received(self: &Arc<Self>, shard_id: u64) -> Result<()> {
        let handler = EngineRowHandler {
            engine: self.clone(),
        };
        let processed = self
            .forwarder
            .handle_received_rows(shard_id, &handler)
            .await?;
        if processed as i64 == RECEIVE_BATCH_SIZE {
            // More may be queued than one pass consumes.
            self.trigger_receive(shard_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DDL.
    // ------------------------------------------------------------------

    async fn acquire_schema_lock(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.cluster.get_lock(SCHEMA_LOCK_PREFIX).await? {
                return Ok(());
            }
            if start.elapsed() >= SCHEMA_LOCK_TIMEOUT {
                return Err(Error::Timeout("acquiring schema lock".into()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn release_schema_lock(&self) {
        if let Err(err) = self.cluster.release_lock(SCHEMA_LOCK_PREFIX).await {
            tracing::warn!(error = %err, "failed to release schema lock");
        }
    }

    /// Create a source table fed from `provider`. The table id in `info`
    /// is assigned here.
    pub async fn create_source(
        self: &Arc<Self>,
        mut info: SourceInfo,
        provider: Arc<dyn MessageProvider>,
    ) -> Result<()> {
        self.acquire_schema_lock().await?;
        let result = self.create_source_locked(&mut info, provider).await;
        self.release_schema_lock().await;
        result
    }

    async fn create_source_locked(
        self: &Arc<Self>,
        info: &mut SourceInfo,
        provider: Arc<dyn MessageProvider>,
    ) -> Result<()> {
        if self.lookup_table(&info.table.name).is_some() {
            return Err(Error::user(format!(
                "table {} already exists",
                info.table.name
            )));
        }
        // An external catalog coordinating DDL across nodes passes a
        // preassigned id; otherwise allocate one.
        if info.table.id == 0 {
            info.table.id =
                keys::USER_TABLE_BASE + self.cluster.generate_cluster_sequence("table").await?;
        }

        let table_exec = TableExecutor::new(info.table.clone(), self.cluster.clone());
        self.remote_consumers
            .write()
            .expect("consumers lock poisoned")
            .insert(
                info.table.id,
                Arc::new(RemoteConsumer::Table {
                    exec: table_exec.clone(),
                }),
            );

        // Deterministic choice: ingest for this source runs on the lowest
        // shard this node processes.
        let scheduler = self
            .processor_schedulers()
            .into_iter()
            .min_by_key(|(shard_id, _)| *shard_id)
            .map(|(_, scheduler)| scheduler)
            .ok_or_else(|| Error::user("node processes no shards"))?;
        let source = Source::new(
            info.clone(),
            table_exec,
            self.cluster.clone(),
            self.forwarder.clone(),
            self.cluster.all_shard_ids(),
            scheduler,
        );
        source
            .start_ingest(provider, self.cfg.poll_timeout, self.cfg.max_poll_messages)
            .await?;

        self.tables_by_id
            .write()
            .expect("tables lock poisoned")
            .insert(info.table.id, info.table.clone());
        self.sources
            .write()
            .expect("sources lock poisoned")
            .insert(info.table.name.clone(), source);
        tracing::info!(source = %info.table.name, table_id = info.table.id, "source created");
        Ok(())
    }

    /// Create a materialized view from a physical plan, filling it from
    /// its feeding tables before it goes live.
    pub async fn create_materialized_view(
        self: &Arc<Self>,
        name: &str,
        plan: &PhysicalPlan,
    ) -> Result<()> {
        self.acquire_schema_lock().await?;
        let result = self.create_mv_locked(name, plan).await;
        self.release_schema_lock().await;
        result
    }

    async fn create_mv_locked(self: &Arc<Self>, name: &str, plan: &PhysicalPlan) -> Result<()> {
        if self.lookup_table(name).is_some() {
            return Err(Error::user(format!("table {name} already exists")));
        }

        let mut build = DagBuild::default();
        let top = self.build_node(plan, &mut build).await?;

        let mv_table_id =
            keys::USER_TABLE_BASE + self.cluster.generate_cluster_sequence("table").await?;
        let mv_table = TableInfo {
            id: mv_table_id,
            name: name.to_string(),
            column_names: top.col_names().to_vec(),
            column_types: top.col_types().to_vec(),
            pk_cols: top.key_cols().to_vec(),
        };
        if mv_table.pk_cols.is_empty() {
            return Err(Error::user(
                "materialized view output has no key columns",
            ));
        }
        let table_exec = TableExecutor::new(mv_table.clone(), self.cluster.clone());
        top.set_parent(table_exec.clone());

        // Register the aggregation consumers before any fill starts; the
        // fill forwards partial rows through them.
        for (consumer_id, agg) in &build.aggs {
            self.remote_consumers
                .write()
                .expect("consumers lock poisoned")
                .insert(*consumer_id, Arc::new(RemoteConsumer::Agg { agg: agg.clone() }));
        }

        let schedulers = self.processor_schedulers();
        for (table_name, scan_node) in &build.leaves {
            let feeding_exec = self
                .table_executor(table_name)
                .ok_or_else(|| Error::UnknownTable(table_name.clone()))?;
            feeding_exec
                .fill_to(scan_node.clone(), name, &self.forwarder, &schedulers)
                .await?;
        }

        self.tables_by_id
            .write()
            .expect("tables lock poisoned")
            .insert(mv_table_id, mv_table.clone());
        for (_, agg) in &build.aggs {
            let partial = agg.partial_table_id();
            let full = agg.full_table_id();
            build.internal_ids.push(partial);
            build.internal_ids.push(full);
        }
        self.mvs.write().expect("mvs lock poisoned").insert(
            name.to_string(),
            MvHandle {
                table: mv_table,
                table_exec,
                feeding_tables: build.leaves.iter().map(|(n, _)| n.clone()).collect(),
                internal_table_ids: build.internal_ids,
                agg_consumer_ids: build.aggs.iter().map(|(id, _)| *id).collect(),
            },
        );
        tracing::info!(mv = name, table_id = mv_table_id, "materialized view created");
        Ok(())
    }

    pub async fn drop_materialized_view(self: &Arc<Self>, name: &str) -> Result<()> {
        self.acquire_schema_lock().await?;
        let result = self.drop_mv_locked(name).await;
        self.release_schema_lock().await;
        result
    }

    async fn drop_mv_locked(self: &Arc<Self>, name: &str) -> Result<()> {
        let handle = self
            .mvs
            .write()
            .expect("mvs lock poisoned")
            .remove(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))?;
        if !handle.table_exec.consuming_node_names().is_empty() {
            // Re-register before failing; the view still has dependents.
            let dependents = handle.table_exec.consuming_node_names().join(", ");
            self.mvs
                .write()
                .expect("mvs lock poisoned")
                .insert(name.to_string(), handle);
            return Err(Error::user(format!(
                "cannot drop {name}: consumed by {dependents}"
            )));
        }

        for feeding in &handle.feeding_tables {
            if let Some(exec) = self.table_executor(feeding) {
                exec.remove_consuming_node(name);
            }
        }
        {
            let mut consumers = self
                .remote_consumers
                .write()
                .expect("consumers lock poisoned");
            for consumer_id in &handle.agg_consumer_ids {
                consumers.remove(consumer_id);
            }
        }

        let mut table_ids = handle.internal_table_ids.clone();
        table_ids.push(handle.table.id);
        for table_id in table_ids {
            self.cluster
                .delete_all_data_in_range_for_all_shards(
                    &table_id.to_be_bytes(),
                    &(table_id + 1).to_be_bytes(),
                )
                .await?;
            self.tables_by_id
                .write()
                .expect("tables lock poisoned")
                .remove(&table_id);
        }
        tracing::info!(mv = name, "materialized view dropped");
        Ok(())
    }

    pub async fn drop_source(self: &Arc<Self>, name: &str) -> Result<()> {
        self.acquire_schema_lock().await?;
        let result = self.drop_source_locked(name).await;
        self.release_schema_lock().await;
        result
    }

    async fn drop_source_locked(self: &Arc<Self>, name: &str) -> Result<()> {
        let source = {
            let sources = self.sources.read().expect("sources lock poisoned");
            sources
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownTable(name.to_string()))?
        };
        let consumers = source.table_executor().consuming_node_names();
        if !consumers.is_empty() {
            return Err(Error::user(format!(
                "cannot drop {name}: consumed by {}",
                consumers.join(", ")
            )));
        }
        source.stop_ingest().await?;
        let table_id = source.table_executor().table_info().id;
        self.sources
            .write()
            .expect("sources lock poisoned")
            .remove(name);
        self.remote_consumers
            .write()
            .expect("consumers lock poisoned")
            .remove(&table_id);
        self.tables_by_id
            .write()
            .expect("tables lock poisoned")
            .remove(&table_id);
        self.cluster
            .delete_all_data_in_range_for_all_shards(
                &table_id.to_be_bytes(),
                &(table_id + 1).to_be_bytes(),
            )
            .await?;
        tracing::info!(source = name, "source dropped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups.
    // ------------------------------------------------------------------

    pub fn lookup_table(&self, name: &str) -> Option<TableInfo> {
        if let Some(source) = self.sources.read().expect("sources lock poisoned").get(name) {
            return Some(source.table_executor().table_info().clone());
        }
        self.mvs
            .read()
            .expect("mvs lock poisoned")
            .get(name)
            .map(|handle| handle.table.clone())
    }

    fn table_executor(&self, name: &str) -> Option<Arc<TableExecutor>> {
        if let Some(source) = self.sources.read().expect("sources lock poisoned").get(name) {
            return Some(source.table_executor().clone());
        }
        self.mvs
            .read()
            .expect("mvs lock poisoned")
            .get(name)
            .map(|handle| handle.table_exec.clone())
    }

    fn table_by_id(&self, table_id: u64) -> Option<TableInfo> {
        self.tables_by_id
            .read()
            .expect("tables lock poisoned")
            .get(&table_id)
            .cloned()
    }

    /// Scan every shard of a table through the pull-query path; the rows
    /// reflect each shard group's applied state.
    pub async fn scan_table(&self, name: &str, limit: i64) -> Result<Rows> {
        let table = self
            .lookup_table(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))?;
        let mut out = Rows::new();
        for shard_id in self.cluster.all_shard_ids() {
            let info = QueryExecutionInfo {
                shard_id,
                table_id: table.id,
                limit,
            };
            let data = self.cluster.execute_remote_pull_query(&info).await?;
            let rows = decode_rows(&data, &table.column_types)?;
            for row in rows.iter() {
                out.append(row.clone());
                if limit >= 0 && out.len() as i64 >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // DAG construction.
    // ------------------------------------------------------------------

    fn build_node<'a>(
        self: &'a Arc<Self>,
        plan: &'a PhysicalPlan,
        build: &'a mut DagBuild,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Arc<dyn PushExecutor>>> + Send + 'a>,
    > {
        Box::pin(async move {
            match plan {
                PhysicalPlan::TableScan { table_name, cols } => {
                    let table = self
                        .lookup_table(table_name)
                        .ok_or_else(|| Error::UnknownTable(table_name.clone()))?;
                    let scan: Arc<dyn PushExecutor> = Arc::new(Scan::new(&table, cols.clone())?);
                    build.leaves.push((table_name.clone(), scan.clone()));
                    Ok(scan)
                }
                PhysicalPlan::Projection { exprs, child } => {
                    let child_exec = self.build_node(child, build).await?;
                    let names = exprs
                        .iter()
                        .enumerate()
                        .map(|(idx, expr)| match expr {
                            crate::plan::Expr::ColumnRef(col) => {
                                child_exec.col_names()[*col].clone()
                            }
                            _ => format!("expr_{idx}"),
                        })
                        .collect();
                    let projection: Arc<dyn PushExecutor> = Arc::new(Projection::new(
                        exprs.clone(),
                        names,
                        child_exec.col_types(),
                        child_exec.key_cols(),
                    )?);
                    child_exec.set_parent(projection.clone());
                    Ok(projection)
                }
                PhysicalPlan::Selection { predicates, child } => {
                    let child_exec = self.build_node(child, build).await?;
                    let selection: Arc<dyn PushExecutor> = Arc::new(Selection::new(
                        predicates.clone(),
                        child_exec.col_names().to_vec(),
                        child_exec.col_types().to_vec(),
                        child_exec.key_cols().to_vec(),
                    ));
                    child_exec.set_parent(selection.clone());
                    Ok(selection)
                }
                PhysicalPlan::HashAgg {
                    group_by,
                    aggs,
                    child,
                } => {
                    let child_exec = self.build_node(child, build).await?;
                    let partial_table_id = keys::USER_TABLE_BASE
                        + self.cluster.generate_cluster_sequence("table").await?;
                    let full_table_id = keys::USER_TABLE_BASE
                        + self.cluster.generate_cluster_sequence("table").await?;
                    let agg = Aggregator::new(
                        child_exec.col_names(),
                        child_exec.col_types(),
                        group_by.clone(),
                        aggs.clone(),
                        partial_table_id,
                        full_table_id,
                        self.cluster.all_shard_ids(),
                    )?;
                    child_exec.set_parent(agg.clone());
                    build.aggs.push((agg.consumer_id(), agg.clone()));
                    Ok(agg as Arc<dyn PushExecutor>)
                }
                PhysicalPlan::UnionAll { children } => {
                    if children.is_empty() {
                        return Err(Error::user("union requires at least one input"));
                    }
                    let mut child_execs = Vec::with_capacity(children.len());
                    for child in children {
                        child_execs.push(self.build_node(child, build).await?);
                    }
                    {
                        let refs: Vec<&dyn PushExecutor> =
                            child_execs.iter().map(|c| c.as_ref()).collect();
                        UnionAll::validate_children(&refs)?;
                    }
                    let first = &child_execs[0];
                    let union = UnionAll::new(
                        first.col_names().to_vec(),
                        first.col_types().to_vec(),
                        first.key_cols().to_vec(),
                    );
                    let tag_base = self.cluster.generate_cluster_sequence("unionall").await?;
                    for (idx, child_exec) in child_execs.iter().enumerate() {
                        let branch = union.branch(tag_base, idx);
                        child_exec.set_parent(branch);
                    }
                    Ok(union as Arc<dyn PushExecutor>)
                }
            }
        })
    }
}

#[derive(Default)]
struct DagBuild {
    /// `(feeding table name, scan node)` per leaf; each leaf gets filled
    /// from its feeding table.
    leaves: Vec<(String, Arc<dyn PushExecutor>)>,
    internal_ids: Vec<u64>,
    aggs: Vec<(u64, Arc<Aggregator>)>,
}

// ---------------------------------------------------------------------------
// Cluster hook adapters. Weak references: the cluster outlives no engine,
// but the registration cycle must not keep the engine alive.
// ---------------------------------------------------------------------------

struct EngineListenerFactory {
    engine: Weak<PushEngine>,
}

impl ShardListenerFactory for EngineListenerFactory {
    fn create_shard_listener(&self, shard_id: u64) -> Box<dyn ShardListener> {
        Box::new(EngineShardListener {
            engine: self.engine.clone(),
            shard_id,
        })
    }
}

struct EngineShardListener {
    engine: Weak<PushEngine>,
    shard_id: u64,
}

impl ShardListener for EngineShardListener {
    fn remote_write_occurred(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.trigger_receive(self.shard_id);
        }
    }

    fn close(&self) {}
}

struct EngineQueryCallback {
    engine: Weak<PushEngine>,
}

impl RemoteQueryCallback for EngineQueryCallback {
    fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> Result<Vec<u8>> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| Error::Transient("engine stopped".into()))?;
        let table = engine
            .table_by_id(info.table_id)
            .ok_or_else(|| Error::UnknownTable(format!("table id {}", info.table_id)))?;
        let lower = keys::table_prefix(info.shard_id, info.table_id);
        let upper = keys::table_prefix(info.shard_id, info.table_id + 1);
        let pairs = engine.cluster.local_scan(&lower, &upper, info.limit)?;
        let mut rows = Rows::with_capacity(pairs.len());
        for pair in &pairs {
            let mut offset = 0usize;
            rows.append(rill_common::codec::decode_row(
                &pair.value,
                &table.column_types,
                &mut offset,
            )?);
        }
        encode_rows(&rows, &table.column_types)
    }
}

struct EngineRowHandler {
    engine: Arc<PushEngine>,
}

#[async_trait]
impl RemoteRowHandler for EngineRowHandler {
    async fn handle_remote_rows(
        &self,
        rows_by_consumer: BTreeMap<u64, Vec<Vec<u8>>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for (consumer_id, payloads) in rows_by_consumer {
            let consumer = {
                let consumers = self
                    .engine
                    .remote_consumers
                    .read()
                    .expect("consumers lock poisoned");
                consumers.get(&consumer_id).cloned()
            };
            let Some(consumer) = consumer else {
                // The consumer was dropped while rows were in flight; the
                // entries are deleted with the batch either way.
                tracing::warn!(consumer_id, "dropping rows for unknown remote consumer");
                continue;
            };
            match consumer.as_ref() {
                RemoteConsumer::Table { exec } => {
                    let col_types = exec.table_info().column_types.clone();
                    let mut rows = Rows::with_capacity(payloads.len());
                    let mut entries = Vec::with_capacity(payloads.len());
                    for payload in &payloads {
                        let (kind, row) = decode_row_payload(payload, &col_types)?;
                        rows.append(row);
                        let idx = rows.len() - 1;
                        if kind == PAYLOAD_UPSERT {
                            entries.push(RowsEntry::new(None, Some(idx)));
                        } else {
                            entries.push(RowsEntry::new(Some(idx), None));
                        }
                    }
                    exec.handle_rows(RowsBatch::new(rows, entries), ctx).await?;
                }
                RemoteConsumer::Agg { agg } => {
                    agg.handle_remote_rows(payloads, ctx).await?;
                }
            }
        }
        Ok(())
    }
}
