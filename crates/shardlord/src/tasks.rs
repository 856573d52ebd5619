//! Task types: move a partition, create a replica.
//!
//! Both wrap the copy-partition state machine and, once the copy is done,
//! rewire the replication topology around the destination. Remote
//! side-effects run in a fixed order so that a subscription is never created
//! before its publication exists and a publication is never dropped before
//! its subscription is gone. Old channels are only destroyed by the catalog
//! triggers that observe the final metadata update, never by the task.

use anyhow::Context;
use tokio::time::Instant;

use crate::copypart::{data_channel_name, CopyPart, Stage, StepOutcome, TaskResult};
use crate::executor::{ExecHint, TaskCtx};
use crate::meta::MetaStore;
use crate::remote::NodeSession;
use crate::{Config, NodeId, INVALID_NODE_ID};

/// A unit of work the executor can drive. Dispatch is by tag; the shared
/// copy state lives inline in each case.
pub enum Task {
    MovePart(MovePart),
    CreateReplica(CreateReplica),
}

impl Task {
    pub fn cp(&self) -> &CopyPart {
        match self {
            Task::MovePart(task) => &task.cp,
            Task::CreateReplica(task) => &task.cp,
        }
    }

    pub fn cp_mut(&mut self) -> &mut CopyPart {
        match self {
            Task::MovePart(task) => &mut task.cp,
            Task::CreateReplica(task) => &mut task.cp,
        }
    }

    /// One dispatch of this task. `Err` means the coordinator itself is
    /// broken (the local metadata transaction failed); everything remote is
    /// handled inside and surfaces as a reschedule.
    pub async fn exec(&mut self, ctx: &TaskCtx<'_>) -> anyhow::Result<ExecHint> {
        match self {
            Task::MovePart(task) => task.exec(ctx).await,
            Task::CreateReplica(task) => task.exec(ctx).await,
        }
    }

    /// Readiness handle for `WaitOnSocket` registration: the destination is
    /// the interesting side during sync waits.
    pub fn wakeup_handle(&self) -> Option<std::sync::Arc<tokio::sync::Notify>> {
        let cp = self.cp();
        cp.dst.wakeups().or_else(|| cp.src.wakeups())
    }

    pub fn release_connections(&mut self) {
        match self {
            Task::MovePart(task) => {
                task.cp.release_connections();
                if let Some(prev) = task.prev.as_mut() {
                    prev.reset();
                }
                if let Some(next) = task.next.as_mut() {
                    next.reset();
                }
            }
            Task::CreateReplica(task) => task.cp.release_connections(),
        }
    }
}

/// Move one partition copy to another node, then relink the replica chain
/// through the destination. Up to four nodes are involved: the previous hop
/// (or nothing, for a primary), the vacated source, the destination, and the
/// next hop.
pub struct MovePart {
    pub cp: CopyPart,
    pub prev_node: Option<NodeId>,
    pub next_node: Option<NodeId>,
    prev: Option<NodeSession>,
    next: Option<NodeSession>,
    prev_sql: Option<String>,
    sync_standby_prev_sql: Option<String>,
    dst_sql: String,
    next_sql: Option<String>,
    sync_standby_dst_sql: Option<String>,
}

impl MovePart {
    /// Validate the move and precompute its statement bundles. With no
    /// explicit source, the primary copy is the one being moved. `None`
    /// (reason logged) means the command must record failure; nothing was
    /// sent anywhere.
    pub async fn admit(
        meta: &dyn MetaStore,
        config: &Config,
        part_name: &str,
        src_node: Option<NodeId>,
        dst_node: NodeId,
    ) -> anyhow::Result<Option<MovePart>> {
        let src_node = match src_node {
            Some(node) => node,
            None => match meta.primary_owner(part_name).await? {
                Some(node) => node,
                None => {
                    tracing::warn!(part = part_name, "partition does not exist, not moving it");
                    return Ok(None);
                }
            },
        };
        let Some(moved) = meta.partition_on_node(part_name, src_node).await? else {
            tracing::warn!(
                part = part_name,
                node = src_node,
                "no such partition on source node, not moving it"
            );
            return Ok(None);
        };

        let Some(mut cp) = CopyPart::admit(meta, part_name, src_node, dst_node).await? else {
            return Ok(None);
        };

        let mut prev = None;
        if let Some(prev_node) = moved.prv {
            let Some(connstring) = meta.node_connstring(prev_node).await? else {
                tracing::warn!(part = part_name, node = prev_node, "no connstring for previous hop");
                return Ok(None);
            };
            prev = Some(NodeSession::new(connstring));
        }
        let mut next = None;
        if let Some(next_node) = moved.nxt {
            // The moved copy feeds a replica; its channel must be rebuilt to
            // originate from the destination.
            let Some(connstring) = meta.node_connstring(next_node).await? else {
                tracing::warn!(part = part_name, node = next_node, "no connstring for next hop");
                return Ok(None);
            };
            next = Some(NodeSession::new(connstring));
        }

        cp.update_metadata_sql = format!(
            "update shardlord.partitions set owner = {dst_node} \
             where part_name = '{part_name}' and owner = {src_node}; \
             update shardlord.partitions set nxt = {dst_node} \
             where part_name = '{part_name}' and nxt = {src_node}; \
             update shardlord.partitions set prv = {dst_node} \
             where part_name = '{part_name}' and prv = {src_node};"
        );

        let mut prev_sql = None;
        let mut sync_standby_prev_sql = None;
        if moved.prv.is_some() {
            // The slot lives on prev but is named from the coordinator's
            // own id (the reserved sentinel when it has none).
            let my_id = config.my_id.unwrap_or(INVALID_NODE_ID);
            let prev_dst_lname = data_channel_name(part_name, my_id, dst_node);
            prev_sql = Some(format!(
                "select shardlord.part_moved_prev('{part_name}', {src_node}, {dst_node}); \
                 select pg_create_logical_replication_slot('{prev_dst_lname}', 'pgoutput');"
            ));
            sync_standby_prev_sql = Some(format!(
                "select shardlord.ensure_sync_standby('{prev_dst_lname}');"
            ));
        }
        let mut dst_sql = format!(
            "select shardlord.part_moved_dst('{part_name}', {src_node}, {dst_node});"
        );
        let mut next_sql = None;
        let mut sync_standby_dst_sql = None;
        if let Some(next_node) = moved.nxt {
            let dst_next_lname = data_channel_name(part_name, dst_node, next_node);
            dst_sql = format!(
                "{dst_sql} select pg_create_logical_replication_slot('{dst_next_lname}', 'pgoutput');"
            );
            // Unsettled: whether the subscriber on next needs a `refresh
            // publication` after this reshape; no case requiring it has been
            // observed, so none is issued.
            next_sql = Some(format!(
                "select shardlord.part_moved_next('{part_name}', {src_node}, {dst_node});"
            ));
            sync_standby_dst_sql = Some(format!(
                "select shardlord.ensure_sync_standby('{dst_next_lname}');"
            ));
        }

        Ok(Some(MovePart {
            cp,
            prev_node: moved.prv,
            next_node: moved.nxt,
            prev,
            next,
            prev_sql,
            sync_standby_prev_sql,
            dst_sql,
            next_sql,
            sync_standby_dst_sql,
        }))
    }

    async fn exec(&mut self, ctx: &TaskCtx<'_>) -> anyhow::Result<ExecHint> {
        match self.cp.drive(ctx).await {
            StepOutcome::Advance => {}
            StepOutcome::Retry(delay) => {
                self.cp.wake_at = Instant::now() + delay;
                return Ok(ExecHint::WakeMeAt);
            }
            StepOutcome::Fail(reason) => {
                tracing::warn!(part = %self.cp.part_name, reason = %reason, "partition move failed");
                self.cp.result = TaskResult::Failed;
                return Ok(ExecHint::Done);
            }
        }
        debug_assert_eq!(self.cp.stage, Stage::Done);

        if self.prev_node.is_some() || self.next_node.is_some() {
            match self.rebuild_lr(ctx).await {
                StepOutcome::Advance => {}
                StepOutcome::Retry(delay) => {
                    self.cp.wake_at = Instant::now() + delay;
                    return Ok(ExecHint::WakeMeAt);
                }
                StepOutcome::Fail(reason) => {
                    tracing::warn!(part = %self.cp.part_name, reason = %reason, "partition move failed");
                    self.cp.result = TaskResult::Failed;
                    return Ok(ExecHint::Done);
                }
            }
        }

        // All new channels exist; now flip the catalog in one transaction.
        // Its triggers drop the old channels, the copy channel included.
        ctx.meta
            .update_metadata(&self.cp.update_metadata_sql)
            .await
            .context("metadata update for partition move")?;
        tracing::info!(
            part = %self.cp.part_name,
            src = self.cp.src_node,
            dst = self.cp.dst_node,
            "partition move successfully done"
        );
        self.cp.result = TaskResult::Success;
        Ok(ExecHint::Done)
    }

    /// Rebuild the replication channels around the destination: prev feeds
    /// dst, dst feeds next. Executed on nodes in the order prev, dst, next,
    /// so every subscription finds its publication already present. The
    /// whole sequence is idempotent and reruns from the top on retry.
    async fn rebuild_lr(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        let naptime = ctx.config.cmd_retry_naptime;

        if let (Some(prev), Some(prev_sql)) = (self.prev.as_mut(), self.prev_sql.as_deref()) {
            if let Err(err) = prev.ensure(ctx.connector).await {
                tracing::warn!(part = %self.cp.part_name, error = %err, "previous hop connection failed");
                return self.cp.retry(naptime);
            }
            if let Err(err) = prev.exec_batch(ctx.connector, prev_sql).await {
                tracing::warn!(part = %self.cp.part_name, error = %err, "replication setup on prev failed");
                return self.cp.retry(naptime);
            }
            tracing::debug!(part = %self.cp.part_name, "replication configured on prev");
        }

        if let Err(err) = self.cp.dst.ensure(ctx.connector).await {
            tracing::warn!(part = %self.cp.part_name, error = %err, "destination connection failed");
            return self.cp.retry(naptime);
        }
        if let Err(err) = self.cp.dst.exec_batch(ctx.connector, &self.dst_sql).await {
            tracing::warn!(part = %self.cp.part_name, error = %err, "replication setup on dst failed");
            return self.cp.retry(naptime);
        }
        tracing::debug!(part = %self.cp.part_name, "replication configured on dst");

        if ctx.config.sync_replicas {
            if let (Some(prev), Some(sql)) =
                (self.prev.as_mut(), self.sync_standby_prev_sql.as_deref())
            {
                if let Err(err) = prev.exec_batch(ctx.connector, sql).await {
                    tracing::warn!(part = %self.cp.part_name, error = %err, "installing sync standby on prev failed");
                    return self.cp.retry(naptime);
                }
                tracing::debug!(part = %self.cp.part_name, "destination made a sync standby of prev");
            }
        }

        if let (Some(next), Some(next_sql)) = (self.next.as_mut(), self.next_sql.as_deref()) {
            if let Err(err) = next.ensure(ctx.connector).await {
                tracing::warn!(part = %self.cp.part_name, error = %err, "next hop connection failed");
                return self.cp.retry(naptime);
            }
            if let Err(err) = next.exec_batch(ctx.connector, next_sql).await {
                tracing::warn!(part = %self.cp.part_name, error = %err, "replication setup on next failed");
                return self.cp.retry(naptime);
            }
            tracing::debug!(part = %self.cp.part_name, "replication configured on next");

            if ctx.config.sync_replicas {
                if let Some(sql) = self.sync_standby_dst_sql.as_deref() {
                    if let Err(err) = self.cp.dst.exec_batch(ctx.connector, sql).await {
                        tracing::warn!(part = %self.cp.part_name, error = %err, "installing sync standby on dst failed");
                        return self.cp.retry(naptime);
                    }
                    tracing::debug!(part = %self.cp.part_name, "next made a sync standby of dst");
                }
            }
        }

        StepOutcome::Advance
    }
}

/// Extend the replica chain of a partition: copy the current tail to a new
/// node, then turn the one-shot copy channel into a permanent data channel.
pub struct CreateReplica {
    pub cp: CopyPart,
    drop_cp_sub_sql: String,
    create_data_pub_sql: String,
    create_data_sub_sql: String,
    sync_standby_sql: String,
}

impl CreateReplica {
    /// Validate replica creation; the source is the current tail of the
    /// replica chain.
    pub async fn admit(
        meta: &dyn MetaStore,
        part_name: &str,
        dst_node: NodeId,
    ) -> anyhow::Result<Option<CreateReplica>> {
        let Some(src_node) = meta.reptail_owner(part_name).await? else {
            tracing::warn!(part = part_name, "partition does not exist, not creating a replica");
            return Ok(None);
        };
        let Some(mut cp) = CopyPart::admit(meta, part_name, src_node, dst_node).await? else {
            return Ok(None);
        };

        let relation = cp.relation.clone();
        cp.update_metadata_sql = format!(
            "insert into shardlord.partitions (part_name, owner, prv, nxt, relation) \
             values ('{part_name}', {dst_node}, {src_node}, null, '{relation}'); \
             update shardlord.partitions set nxt = {dst_node} \
             where part_name = '{part_name}' and owner = {src_node};"
        );

        let data_lname = data_channel_name(part_name, src_node, dst_node);
        Ok(Some(CreateReplica {
            cp,
            drop_cp_sub_sql: format!(
                "select shardlord.replica_created_drop_cp_sub('{part_name}', {src_node}, {dst_node});"
            ),
            create_data_pub_sql: format!(
                "select shardlord.replica_created_create_data_pub('{part_name}', {src_node}, {dst_node}); \
                 select pg_create_logical_replication_slot('{data_lname}', 'pgoutput');"
            ),
            create_data_sub_sql: format!(
                "select shardlord.replica_created_create_data_sub('{part_name}', {src_node}, {dst_node});"
            ),
            sync_standby_sql: format!(
                "select shardlord.ensure_sync_standby('{data_lname}'); \
                 select shardlord.readonly_table_off('{part_name}');"
            ),
        }))
    }

    async fn exec(&mut self, ctx: &TaskCtx<'_>) -> anyhow::Result<ExecHint> {
        match self.cp.drive(ctx).await {
            StepOutcome::Advance => {}
            StepOutcome::Retry(delay) => {
                self.cp.wake_at = Instant::now() + delay;
                return Ok(ExecHint::WakeMeAt);
            }
            StepOutcome::Fail(reason) => {
                tracing::warn!(part = %self.cp.part_name, reason = %reason, "replica creation failed");
                self.cp.result = TaskResult::Failed;
                return Ok(ExecHint::Done);
            }
        }
        debug_assert_eq!(self.cp.stage, Stage::Done);

        match self.rebuild_lr(ctx).await {
            StepOutcome::Advance => {}
            StepOutcome::Retry(delay) => {
                self.cp.wake_at = Instant::now() + delay;
                return Ok(ExecHint::WakeMeAt);
            }
            StepOutcome::Fail(reason) => {
                tracing::warn!(part = %self.cp.part_name, reason = %reason, "replica creation failed");
                self.cp.result = TaskResult::Failed;
                return Ok(ExecHint::Done);
            }
        }

        ctx.meta
            .update_metadata(&self.cp.update_metadata_sql)
            .await
            .context("metadata update for replica creation")?;
        tracing::info!(
            part = %self.cp.part_name,
            node = self.cp.dst_node,
            "replica successfully created"
        );
        self.cp.result = TaskResult::Success;
        Ok(ExecHint::Done)
    }

    /// Convert the copy channel into the permanent data channel: drop the
    /// copy subscription, publish on the source, subscribe on the new tail.
    async fn rebuild_lr(&mut self, ctx: &TaskCtx<'_>) -> StepOutcome {
        let naptime = ctx.config.cmd_retry_naptime;

        if let Err(err) = self.cp.src.ensure(ctx.connector).await {
            tracing::warn!(part = %self.cp.part_name, error = %err, "source connection failed");
            return self.cp.retry(naptime);
        }
        if let Err(err) = self.cp.dst.ensure(ctx.connector).await {
            tracing::warn!(part = %self.cp.part_name, error = %err, "destination connection failed");
            return self.cp.retry(naptime);
        }

        if let Err(err) = self
            .cp
            .dst
            .exec_batch(ctx.connector, &self.drop_cp_sub_sql)
            .await
        {
            tracing::warn!(part = %self.cp.part_name, error = %err, "dropping copy subscription failed");
            return self.cp.retry(naptime);
        }
        tracing::debug!(part = %self.cp.part_name, "copy subscription dropped");

        if let Err(err) = self
            .cp
            .src
            .exec_batch(ctx.connector, &self.create_data_pub_sql)
            .await
        {
            tracing::warn!(part = %self.cp.part_name, error = %err, "creating data publication failed");
            return self.cp.retry(naptime);
        }
        tracing::debug!(part = %self.cp.part_name, "data publication created");

        if let Err(err) = self
            .cp
            .dst
            .exec_batch(ctx.connector, &self.create_data_sub_sql)
            .await
        {
            tracing::warn!(part = %self.cp.part_name, error = %err, "creating data subscription failed");
            return self.cp.retry(naptime);
        }
        tracing::debug!(part = %self.cp.part_name, "data subscription created");

        if ctx.config.sync_replicas {
            if let Err(err) = self
                .cp
                .src
                .exec_batch(ctx.connector, &self.sync_standby_sql)
                .await
            {
                tracing::warn!(part = %self.cp.part_name, error = %err, "installing sync standby failed");
                return self.cp.retry(naptime);
            }
            tracing::debug!(part = %self.cp.part_name, "new tail made a sync standby");
        }

        StepOutcome::Advance
    }
}
