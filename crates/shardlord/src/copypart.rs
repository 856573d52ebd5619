//! Copy-partition state machine.
//!
//! Moving or replicating a partition is implemented over logical
//! replication: start the initial tablesync, wait for it to finish, make the
//! source read-only, then wait until the destination has received the
//! source's WAL position captured at that moment. The machine advances
//! through strictly monotonic stages and every stage entry idempotently
//! repeats its preconditions, so a coordinator that reboots mid-copy can
//! rerun the whole task from the start without residue: all channel names
//! are derived from (partition, src, dst) and every create is preceded by a
//! drop-if-exists.
//!
//! Managing the replication channels through catalog triggers would be
//! handier, but a replication slot cannot be created in a transaction that
//! already performed writes, and a subscription pointing at a crashed
//! publisher fails to create. So the machine manages the copy channel
//! manually and leaves only the teardown of obsolete channels to the
//! metadata-update triggers: new channels are built first, metadata is
//! updated last, and old channels die inside that update.

use std::time::Duration;

use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

use crate::executor::TaskCtx;
use crate::meta::MetaStore;
use crate::remote::{Connector, NodeSession};
use crate::{NodeId, META_SUB_NAME};

/// Stages of one partition copy, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    StartTablesync,
    StartFinalsync,
    Finalize,
    Done,
}

/// Overall task verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskResult {
    InProgress,
    Success,
    Failed,
}

/// What one step of a task decided.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StepOutcome {
    /// Precondition satisfied, fall through to the next step.
    Advance,
    /// Transient trouble; re-dispatch after the delay.
    Retry(Duration),
    /// Unrecoverable; the task ends as failed.
    Fail(String),
}

/// Name of the one-shot copy channel: used as the publication, subscription
/// and replication-slot name, and derivable from the task key alone so a
/// restarted task can clean up after its predecessor.
pub fn copy_channel_name(part: &str, src: NodeId, dst: NodeId) -> String {
    format!("copy_{part}_{src}_{dst}")
}

/// Name of the steady-state data-channel slot from `pub_node` to `sub_node`.
pub fn data_channel_name(part: &str, pub_node: NodeId, sub_node: NodeId) -> String {
    format!("data_{part}_{pub_node}_{sub_node}")
}

fn received_lsn_sql(subname: &str) -> String {
    format!("select received_lsn from pg_stat_subscription where subname = '{subname}'")
}

/// Per-relation sync state of a subscription ('r' means tablesync is done).
pub(crate) fn substate_sql(subname: &str) -> String {
    format!(
        "select srel.srsubstate from pg_subscription_rel srel \
         join pg_subscription sub on srel.srsubid = sub.oid \
         where sub.subname = '{subname}'"
    )
}

/// Shared state of one partition copy src -> dst.
pub struct CopyPart {
    pub part_name: String,
    pub relation: String,
    pub src_node: NodeId,
    pub dst_node: NodeId,
    pub logname: String,
    pub src: NodeSession,
    pub dst: NodeSession,
    pub stage: Stage,
    /// Source WAL position captured when the source became read-only; the
    /// destination is caught up once its received position passes this.
    pub sync_point: Option<PgLsn>,
    pub result: TaskResult,
    /// Earliest moment this task wants to be dispatched again.
    pub wake_at: Instant,
    /// Catalog rewrite applied after the copy and topology work succeed;
    /// filled in by the task type that owns this copy.
    pub update_metadata_sql: String,

    dst_drop_sub_sql: String,
    src_create_pub_and_slot_sql: String,
    dst_create_tab_and_sub_sql: String,
    substate_sql: String,
    readonly_sql: String,
}

impl CopyPart {
    /// Validate a copy against the catalog and build its statement bundles.
    /// Returns `None` (with the reason logged) when the copy must not start;
    /// a rejected copy has issued no remote SQL.
    pub async fn admit(
        meta: &dyn MetaStore,
        part_name: &str,
        src_node: NodeId,
        dst_node: NodeId,
    ) -> anyhow::Result<Option<CopyPart>> {
        if src_node == dst_node {
            tracing::warn!(
                part = part_name,
                node = src_node,
                "source and destination are the same node, not copying"
            );
            return Ok(None);
        }
        let workers = meta.active_workers().await?;
        if !workers.contains(&src_node) || !workers.contains(&dst_node) {
            tracing::warn!(
                part = part_name,
                src = src_node,
                dst = dst_node,
                "source or destination is not an active worker, not copying"
            );
            return Ok(None);
        }
        if meta.partition_on_node(part_name, dst_node).await?.is_some() {
            tracing::warn!(
                part = part_name,
                src = src_node,
                dst = dst_node,
                "partition already exists on destination, not copying"
            );
            return Ok(None);
        }
        let Some(relation) = meta.partition_relation(part_name).await? else {
            tracing::warn!(part = part_name, "partition is not in the catalog, not copying");
            return Ok(None);
        };
        let Some(src_connstr) = meta.node_connstring(src_node).await? else {
            tracing::warn!(part = part_name, node = src_node, "no connstring for source node");
            return Ok(None);
        };
        let Some(dst_connstr) = meta.node_connstring(dst_node).await? else {
            tracing::warn!(part = part_name, node = dst_node, "no connstring for destination node");
            return Ok(None);
        };

        let logname = copy_channel_name(part_name, src_node, dst_node);
        let dst_drop_sub_sql = format!("drop subscription if exists {logname} cascade;");
        // Statements run in separate transactions: the slot creation cannot
        // share a transaction with the preceding writes.
        let src_create_pub_and_slot_sql = format!(
            "drop publication if exists {logname} cascade; \
             create publication {logname} for table {part_name}; \
             select shardlord.drop_repslot('{logname}'); \
             select pg_create_logical_replication_slot('{logname}', 'pgoutput');"
        );
        // The subscription is asynchronous: a synchronous one would block the
        // source table for the whole copy. The price is locking the source
        // once the initial sync is done.
        let dst_create_tab_and_sub_sql = format!(
            "drop table if exists {part_name} cascade; \
             create table {part_name} (like {relation} including defaults \
             including indexes including storage); \
             drop subscription if exists {logname} cascade; \
             create subscription {logname} connection '{src_connstr}' publication {logname} \
             with (create_slot = false, slot_name = '{logname}', synchronous_commit = local);"
        );

        Ok(Some(CopyPart {
            substate_sql: substate_sql(&logname),
            readonly_sql: format!("select shardlord.readonly_table_on('{part_name}')"),
            part_name: part_name.to_string(),
            relation,
            src_node,
            dst_node,
            logname,
            src: NodeSession::new(src_connstr),
            dst: NodeSession::new(dst_connstr),
            stage: Stage::StartTablesync,
            sync_point: None,
            result: TaskResult::InProgress,
            wake_at: Instant::now(),
            update_metadata_sql: String::new(),
            dst_drop_sub_sql,
            src_create_pub_and_slot_sql,
            dst_create_tab_and_sub_sql,
        }))
    }

    /// Run as many stages as currently possible. `Advance` means the copy is
    /// complete (`stage == Done`); the outer handler proceeds to topology
    /// work. The stage never moves backward.
    pub(crate) async fn drive(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        if self.stage == Stage::StartTablesync {
            match self.start_tablesync(ctx).await {
                StepOutcome::Advance => {
                    self.stage = Stage::StartFinalsync;
                    tracing::debug!(part = %self.part_name, "tablesync started");
                }
                other => return other,
            }
        }
        if self.stage == Stage::StartFinalsync {
            match self.start_finalsync(ctx).await {
                StepOutcome::Advance => {
                    self.stage = Stage::Finalize;
                    tracing::debug!(part = %self.part_name, "final sync started");
                }
                other => return other,
            }
        }
        if self.stage == Stage::Finalize {
            match self.finalize(ctx).await {
                StepOutcome::Advance => {
                    self.stage = Stage::Done;
                    tracing::debug!(
                        part = %self.part_name,
                        src = self.src_node,
                        dst = self.dst_node,
                        "partition successfully copied"
                    );
                }
                other => return other,
            }
        }
        StepOutcome::Advance
    }

    pub(crate) fn retry(&self, delay: Duration) -> StepOutcome {
        tracing::debug!(
            part = %self.part_name,
            delay_ms = delay.as_millis() as u64,
            "sleeping and retrying"
        );
        StepOutcome::Retry(delay)
    }

    /// Set up the copy channel and kick off the initial sync.
    async fn start_tablesync(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        let naptime = ctx.config.cmd_retry_naptime;
        let lord_lsn = match ctx.meta.current_lsn().await {
            Ok(lsn) => lsn,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read coordinator wal position");
                return self.retry(naptime);
            }
        };

        if let Err(err) = self.src.ensure(ctx.connector).await {
            tracing::warn!(part = %self.part_name, error = %err, "source connection failed");
            return self.retry(naptime);
        }
        if let Err(err) = self.dst.ensure(ctx.connector).await {
            tracing::warn!(part = %self.part_name, error = %err, "destination connection failed");
            return self.retry(naptime);
        }

        // Both workers must have received all committed metadata up to our
        // current position before we touch them. Acting on stale metadata is
        // subtly dangerous: move a partition x -> y and immediately copy it
        // back, and the copy can drop the real table on x before the row
        // about the move has reached x. The coordinator is single-threaded,
        // so positions past lord_lsn are someone else's writes and harmless.
        match check_sub_sync(&mut self.src, ctx.connector, META_SUB_NAME, lord_lsn, "meta sub on src")
            .await
        {
            Ok(true) => {}
            Ok(false) | Err(_) => return self.retry(naptime),
        }
        match check_sub_sync(&mut self.dst, ctx.connector, META_SUB_NAME, lord_lsn, "meta sub on dst")
            .await
        {
            Ok(true) => {}
            Ok(false) | Err(_) => return self.retry(naptime),
        }

        // Drop the destination subscription first, otherwise the slot on the
        // source cannot be dropped.
        if let Err(err) = self.dst.exec_batch(ctx.connector, &self.dst_drop_sub_sql).await {
            tracing::warn!(part = %self.part_name, error = %err, "dropping stale subscription on dst failed");
            return self.retry(naptime);
        }
        tracing::debug!(part = %self.part_name, "subscription on dst dropped, if any");

        if let Err(err) = self
            .src
            .exec_batch(ctx.connector, &self.src_create_pub_and_slot_sql)
            .await
        {
            tracing::warn!(part = %self.part_name, error = %err, "recreating publication and slot on src failed");
            return self.retry(naptime);
        }
        tracing::debug!(part = %self.part_name, "publication and slot recreated on src");

        if let Err(err) = self
            .dst
            .exec_batch(ctx.connector, &self.dst_create_tab_and_sub_sql)
            .await
        {
            tracing::warn!(part = %self.part_name, error = %err, "creating table and subscription on dst failed");
            return self.retry(naptime);
        }
        tracing::debug!(part = %self.part_name, "table and subscription created on dst, tablesync started");

        StepOutcome::Advance
    }

    /// Wait out the initial sync, then freeze the source and capture the
    /// synchronization point.
    async fn start_finalsync(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        let naptime = ctx.config.cmd_retry_naptime;

        if let Err(err) = self.src.ensure(ctx.connector).await {
            tracing::warn!(part = %self.part_name, error = %err, "source connection failed");
            return self.retry(naptime);
        }
        if let Err(err) = self.dst.ensure(ctx.connector).await {
            tracing::warn!(part = %self.part_name, error = %err, "destination connection failed");
            return self.retry(naptime);
        }

        let rows = match self.dst.query_rows(ctx.connector, &self.substate_sql).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(part = %self.part_name, error = %err, "failed to learn subscription state on dst");
                return self.retry(naptime);
            }
        };
        if rows.len() != 1 {
            // Exactly one relation belongs to this subscription, yet the
            // state view transiently disagrees every now and then; nobody
            // has explained why. Poll again.
            tracing::warn!(
                part = %self.part_name,
                sub = %self.logname,
                rows = rows.len(),
                "subscription state query returned unexpected row count"
            );
            return self.retry(ctx.config.poll_interval);
        }
        let state = rows[0].first().cloned().flatten().unwrap_or_default();
        if state != "r" {
            tracing::debug!(part = %self.part_name, state = %state, "initial sync not yet finished");
            return self.retry(ctx.config.poll_interval);
        }
        tracing::debug!(part = %self.part_name, "initial sync finished");

        if let Err(err) = self.src.exec_batch(ctx.connector, &self.readonly_sql).await {
            tracing::warn!(part = %self.part_name, error = %err, "failed to make source table read only");
            return self.retry(naptime);
        }
        tracing::debug!(part = %self.part_name, "source table made read only");

        let rows = match self
            .src
            .query_rows(ctx.connector, "select pg_current_wal_lsn()")
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(part = %self.part_name, error = %err, "failed to read source wal position");
                return self.retry(naptime);
            }
        };
        let lsn = rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .and_then(|text| text.parse::<PgLsn>().ok());
        let Some(sync_point) = lsn else {
            tracing::warn!(part = %self.part_name, "source returned an unusable wal position");
            return self.retry(naptime);
        };
        tracing::debug!(part = %self.part_name, sync_point = %sync_point, "sync point captured");
        self.sync_point = Some(sync_point);

        StepOutcome::Advance
    }

    /// Wait until the destination has applied up to the sync point.
    async fn finalize(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        if let Err(err) = self.dst.ensure(ctx.connector).await {
            tracing::warn!(part = %self.part_name, error = %err, "destination connection failed");
            return self.retry(ctx.config.cmd_retry_naptime);
        }
        let Some(sync_point) = self.sync_point else {
            // Stages never regress, so reaching here without a sync point is
            // a bug; by policy it still only costs a retry.
            tracing::warn!(part = %self.part_name, "finalize entered without a sync point");
            return self.retry(ctx.config.cmd_retry_naptime);
        };
        let logname = self.logname.clone();
        match check_sub_sync(&mut self.dst, ctx.connector, &logname, sync_point, "copy channel").await
        {
            Ok(true) => StepOutcome::Advance,
            Ok(false) | Err(_) => self.retry(ctx.config.poll_interval),
        }
    }

    /// Drop all remote sessions; terminal tasks must not hold connections.
    pub fn release_connections(&mut self) {
        self.src.reset();
        self.dst.reset();
    }
}

/// Ask the node behind `session` for the last received LSN of `subname` and
/// compare it to `ref_lsn`. `Ok(true)` means caught up; `Ok(false)` means
/// lagging or an anomalous answer (logged); `Err` means the statement itself
/// failed and the session was discarded.
pub(crate) async fn check_sub_sync(
    session: &mut NodeSession,
    connector: &dyn Connector,
    subname: &str,
    ref_lsn: PgLsn,
    what: &str,
) -> anyhow::Result<bool> {
    let rows = match session.query_rows(connector, &received_lsn_sql(subname)).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(sub = subname, what, error = %err, "failed to learn subscription lsn");
            return Err(err);
        }
    };
    if rows.len() != 1 {
        tracing::warn!(
            sub = subname,
            what,
            rows = rows.len(),
            "subscription lsn query returned unexpected row count"
        );
        return Ok(false);
    }
    let Some(text) = rows[0].first().cloned().flatten() else {
        tracing::warn!(sub = subname, what, "subscription lsn is null");
        return Ok(false);
    };
    let Ok(received) = text.parse::<PgLsn>() else {
        tracing::warn!(sub = subname, what, lsn = %text, "subscription lsn did not parse");
        return Ok(false);
    };
    if received < ref_lsn {
        tracing::debug!(
            sub = subname,
            what,
            received = %received,
            waiting_for = %ref_lsn,
            "subscription not yet synced"
        );
        return Ok(false);
    }
    Ok(true)
}
