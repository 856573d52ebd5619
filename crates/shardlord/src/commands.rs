//! Command handlers.
//!
//! Each handler validates a command against the catalog, decomposes it into
//! tasks, and drives them through the executor. Membership commands
//! (add/remove node) run their own retry loop instead: they touch a single
//! worker and the catalog, with no copy phase to interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::copypart::substate_sql;
use crate::executor::{self, TaskCtx};
use crate::meta::{CmdRecord, PartitionCopy};
use crate::remote::NodeSession;
use crate::signal::Signals;
use crate::tasks::{CreateReplica, MovePart, Task};
use crate::{NodeId, META_SUB_NAME};

/// How a command ended. `Recorded` means the handler already wrote the
/// final status itself, atomically with its last metadata change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdOutcome {
    Success,
    Failed,
    Canceled,
    Recorded,
}

#[derive(Deserialize)]
struct MovePartOpts {
    part: String,
    dst: NodeId,
    #[serde(default)]
    src: Option<NodeId>,
}

#[derive(Deserialize)]
struct CreateReplicaOpts {
    part: String,
    dst: NodeId,
}

#[derive(Deserialize)]
struct RebalanceOpts {
    relation: String,
}

#[derive(Deserialize)]
struct SetReplevelOpts {
    relation: String,
    level: i64,
}

#[derive(Deserialize)]
struct AddNodeOpts {
    connstring: String,
}

#[derive(Deserialize)]
struct RmNodeOpts {
    node: NodeId,
    #[serde(default)]
    force: bool,
}

fn parse_opts<T: DeserializeOwned>(cmd: &CmdRecord) -> Option<T> {
    match serde_json::from_value(cmd.opts.clone()) {
        Ok(opts) => Some(opts),
        Err(err) => {
            tracing::warn!(id = cmd.id, kind = %cmd.kind, error = %err, "malformed command options");
            None
        }
    }
}

/// Run one command from the log.
pub async fn dispatch(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    cmd: &CmdRecord,
) -> anyhow::Result<CmdOutcome> {
    match cmd.kind.as_str() {
        "move_part" => {
            let Some(opts) = parse_opts::<MovePartOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            move_part(ctx, signals, &opts.part, opts.src, opts.dst).await
        }
        "create_replica" => {
            let Some(opts) = parse_opts::<CreateReplicaOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            create_replica(ctx, signals, &opts.part, opts.dst).await
        }
        "rebalance" => {
            let Some(opts) = parse_opts::<RebalanceOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            rebalance(ctx, signals, &opts.relation).await
        }
        "set_replevel" => {
            let Some(opts) = parse_opts::<SetReplevelOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            set_replevel(ctx, signals, &opts.relation, opts.level).await
        }
        "add_node" => {
            let Some(opts) = parse_opts::<AddNodeOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            add_node(ctx, signals, cmd.id, &opts.connstring).await
        }
        "rm_node" => {
            let Some(opts) = parse_opts::<RmNodeOpts>(cmd) else {
                return Ok(CmdOutcome::Failed);
            };
            rm_node(ctx, signals, cmd.id, opts.node, opts.force).await
        }
        other => {
            tracing::warn!(id = cmd.id, kind = other, "unknown command type");
            Ok(CmdOutcome::Failed)
        }
    }
}

fn outcome_of(tasks: &[Task], signals: &Signals) -> CmdOutcome {
    if signals.cancel_pending() {
        CmdOutcome::Canceled
    } else if executor::all_succeeded(tasks) {
        CmdOutcome::Success
    } else {
        CmdOutcome::Failed
    }
}

/// Move one partition copy to `dst`. Without an explicit source the primary
/// copy is moved.
pub async fn move_part(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    part: &str,
    src: Option<NodeId>,
    dst: NodeId,
) -> anyhow::Result<CmdOutcome> {
    let Some(task) = MovePart::admit(ctx.meta, ctx.config, part, src, dst).await? else {
        return Ok(CmdOutcome::Failed);
    };
    let mut tasks = [Task::MovePart(task)];
    executor::exec_tasks(&mut tasks, ctx, signals).await?;
    Ok(outcome_of(&tasks, signals))
}

/// Append a replica of `part` on `dst` to the replica chain.
pub async fn create_replica(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    part: &str,
    dst: NodeId,
) -> anyhow::Result<CmdOutcome> {
    let Some(task) = CreateReplica::admit(ctx.meta, part, dst).await? else {
        return Ok(CmdOutcome::Failed);
    };
    let mut tasks = [Task::CreateReplica(task)];
    executor::exec_tasks(&mut tasks, ctx, signals).await?;
    Ok(outcome_of(&tasks, signals))
}

/// One planned partition move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedMove {
    pub part_name: String,
    pub from: NodeId,
    pub to: NodeId,
}

/// Plan moves that even out the partition count of `relation` across the
/// active workers, one copy at a time from the most to the least loaded
/// node. A node never receives a second copy of the same partition, and no
/// partition is moved twice in one plan.
pub fn plan_rebalance_moves(parts: &[PartitionCopy], workers: &[NodeId]) -> Vec<PlannedMove> {
    let mut counts: BTreeMap<NodeId, i64> = workers.iter().map(|id| (*id, 0)).collect();
    for copy in parts {
        if let Some(count) = counts.get_mut(&copy.owner) {
            *count += 1;
        }
    }
    let mut holders: BTreeMap<&str, BTreeSet<NodeId>> = BTreeMap::new();
    for copy in parts {
        holders
            .entry(copy.part_name.as_str())
            .or_default()
            .insert(copy.owner);
    }

    let mut moved: BTreeSet<&str> = BTreeSet::new();
    let mut planned = Vec::new();
    loop {
        let Some((donor, most)) = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(id, count)| (*id, *count))
        else {
            break;
        };
        let Some((receiver, least)) = counts
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(id, count)| (*id, *count))
        else {
            break;
        };
        if most <= least + 1 {
            break;
        }
        let candidate = parts.iter().find(|copy| {
            copy.owner == donor
                && !moved.contains(copy.part_name.as_str())
                && holders
                    .get(copy.part_name.as_str())
                    .map_or(true, |held_by| !held_by.contains(&receiver))
        });
        let Some(copy) = candidate else {
            break;
        };
        moved.insert(copy.part_name.as_str());
        if let Some(held_by) = holders.get_mut(copy.part_name.as_str()) {
            held_by.remove(&donor);
            held_by.insert(receiver);
        }
        *counts.entry(donor).or_insert(0) -= 1;
        *counts.entry(receiver).or_insert(0) += 1;
        planned.push(PlannedMove {
            part_name: copy.part_name.clone(),
            from: donor,
            to: receiver,
        });
    }
    planned
}

/// Even out the partition copies of `relation` across the active workers,
/// running all planned moves as one concurrent task batch.
pub async fn rebalance(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    relation: &str,
) -> anyhow::Result<CmdOutcome> {
    let parts = ctx.meta.parts_of_relation(relation).await?;
    if parts.is_empty() {
        tracing::warn!(relation, "relation has no partitions, nothing to rebalance");
        return Ok(CmdOutcome::Failed);
    }
    let workers = ctx.meta.active_workers().await?;
    if workers.is_empty() {
        tracing::warn!(relation, "no active workers, nothing to rebalance");
        return Ok(CmdOutcome::Failed);
    }

    let moves = plan_rebalance_moves(&parts, &workers);
    if moves.is_empty() {
        tracing::info!(relation, "partitions already balanced");
        return Ok(CmdOutcome::Success);
    }
    tracing::info!(relation, moves = moves.len(), "rebalancing");

    let mut tasks = Vec::with_capacity(moves.len());
    for planned in &moves {
        match MovePart::admit(ctx.meta, ctx.config, &planned.part_name, Some(planned.from), planned.to)
            .await?
        {
            Some(task) => tasks.push(Task::MovePart(task)),
            None => return Ok(CmdOutcome::Failed),
        }
    }
    executor::exec_tasks(&mut tasks, ctx, signals).await?;
    Ok(outcome_of(&tasks, signals))
}

/// Bring every partition of `relation` up to `level` replicas, one wave of
/// replica creations per deficit round.
pub async fn set_replevel(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    relation: &str,
    level: i64,
) -> anyhow::Result<CmdOutcome> {
    if level < 0 {
        tracing::warn!(relation, level, "replication level cannot be negative");
        return Ok(CmdOutcome::Failed);
    }
    loop {
        let counts = ctx.meta.replica_counts(relation).await?;
        if counts.is_empty() {
            tracing::warn!(relation, "relation has no partitions");
            return Ok(CmdOutcome::Failed);
        }
        let under: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count < level)
            .map(|(part, _)| part)
            .collect();
        if under.is_empty() {
            tracing::info!(relation, level, "replication level reached");
            return Ok(CmdOutcome::Success);
        }

        let workers = ctx.meta.active_workers().await?;
        let mut tasks = Vec::with_capacity(under.len());
        for part in &under {
            let mut candidates = Vec::new();
            for worker in &workers {
                if ctx.meta.partition_on_node(part, *worker).await?.is_none() {
                    candidates.push(*worker);
                }
            }
            // Placement is random; rebalance exists to even out skew later.
            let Some(dst) = candidates.choose(&mut rand::thread_rng()).copied() else {
                tracing::warn!(
                    part = %part,
                    relation,
                    level,
                    "not enough active workers for the requested replication level"
                );
                return Ok(CmdOutcome::Failed);
            };
            match CreateReplica::admit(ctx.meta, part, dst).await? {
                Some(task) => tasks.push(Task::CreateReplica(task)),
                None => return Ok(CmdOutcome::Failed),
            }
        }
        executor::exec_tasks(&mut tasks, ctx, signals).await?;
        if signals.any_pending() {
            return Ok(outcome_of(&tasks, signals));
        }
        if !executor::all_succeeded(&tasks) {
            return Ok(CmdOutcome::Failed);
        }
    }
}

/// Interruptible sleep; false when a signal cut it short.
async fn nap(signals: &Signals, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = signals.wait() => false,
    }
}

enum AddNodeAttempt {
    Done,
    AlreadyInCluster(NodeId),
    Interrupted,
}

/// Register a new worker. Retries the whole idempotent sequence until it
/// succeeds or is canceled.
pub async fn add_node(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    cmd_id: i64,
    connstring: &str,
) -> anyhow::Result<CmdOutcome> {
    tracing::info!(connstring, "adding node");
    // The id is generated before the worker learns it; safe because the
    // coordinator is single-threaded.
    let node_id = ctx.meta.next_node_id().await?;
    let mut worker = NodeSession::new(connstring);
    loop {
        match add_node_attempt(ctx, signals, &mut worker, node_id, connstring, cmd_id).await {
            Ok(AddNodeAttempt::Done) => {
                tracing::info!(connstring, node = node_id, "node successfully added");
                return Ok(CmdOutcome::Recorded);
            }
            Ok(AddNodeAttempt::AlreadyInCluster(existing)) => {
                tracing::warn!(
                    connstring,
                    node = existing,
                    "node is already in the cluster, won't add it"
                );
                return Ok(CmdOutcome::Failed);
            }
            Ok(AddNodeAttempt::Interrupted) => return Ok(CmdOutcome::Canceled),
            Err(err) => {
                tracing::warn!(connstring, error = %err, "add_node attempt failed, sleeping and retrying");
                worker.reset();
                if !nap(signals, ctx.config.cmd_retry_naptime).await || signals.any_pending() {
                    return Ok(CmdOutcome::Canceled);
                }
            }
        }
    }
}

async fn add_node_attempt(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    worker: &mut NodeSession,
    node_id: NodeId,
    connstring: &str,
    cmd_id: i64,
) -> anyhow::Result<AddNodeAttempt> {
    worker.ensure(ctx.connector).await?;

    // A worker that already carries an id belonged to some cluster; refuse
    // only when it is a live member of ours.
    let rows = worker
        .query_rows(ctx.connector, "select shardlord.my_id()")
        .await?;
    if let Some(existing) = rows.first().and_then(|row| row.first().cloned().flatten()) {
        if let Ok(existing) = existing.parse::<NodeId>() {
            if ctx.meta.node_in_cluster(existing).await? {
                return Ok(AddNodeAttempt::AlreadyInCluster(existing));
            }
        }
    }

    // Reinstall the extension to reset whatever state the node kept.
    worker
        .exec_batch(
            ctx.connector,
            "drop extension if exists shardlord cascade; create extension shardlord;",
        )
        .await?;

    // Recreate this worker's metadata slot on the coordinator.
    ctx.meta
        .update_metadata(&format!(
            "select shardlord.create_repslot('{META_SUB_NAME}_{node_id}');"
        ))
        .await?;

    let lord_connstring = &ctx.config.shardlord_connstring;
    worker
        .exec_batch(
            ctx.connector,
            &format!(
                "create subscription {META_SUB_NAME} connection '{lord_connstring}' \
                 publication shardlord_meta_pub with (create_slot = false, \
                 slot_name = '{META_SUB_NAME}_{node_id}'); \
                 select shardlord.set_my_id({node_id});"
            ),
        )
        .await?;
    // alter system refuses to ride in a multi-statement string.
    worker
        .exec_batch(
            ctx.connector,
            &format!("alter system set shardlord.my_id to {node_id};"),
        )
        .await?;
    worker
        .query_rows(ctx.connector, "select pg_reload_conf()")
        .await?;

    // The node must have fully synced the metadata tables before it goes
    // active: an update missed here means its triggers never fire for it
    // and its catalog stays inconsistent forever.
    let state_sql = substate_sql(META_SUB_NAME);
    loop {
        let rows = worker.query_rows(ctx.connector, &state_sql).await?;
        if rows
            .iter()
            .all(|row| row.first().cloned().flatten().as_deref() == Some("r"))
        {
            break;
        }
        tracing::debug!(connstring, "metadata tablesync not yet finished");
        if !nap(signals, ctx.config.poll_interval).await {
            return Ok(AddNodeAttempt::Interrupted);
        }
    }
    worker.reset();

    // Going active and recording success happen in one transaction: seen
    // half-done after a crash, a rerun would refuse to re-add the node.
    ctx.meta
        .update_metadata(&format!(
            "insert into shardlord.nodes (id, connstring, worker_status, shardlord) \
             values ({node_id}, '{connstring}', 'active', false); \
             update shardlord.cmd_log set status = 'success' where id = {cmd_id};"
        ))
        .await?;
    Ok(AddNodeAttempt::Done)
}

/// Remove a worker, losing whatever data is on it. Refuses while the node
/// still owns partitions unless forced.
pub async fn rm_node(
    ctx: &TaskCtx<'_>,
    signals: &Signals,
    cmd_id: i64,
    node: NodeId,
    force: bool,
) -> anyhow::Result<CmdOutcome> {
    if force {
        ctx.meta
            .update_metadata(&format!(
                "delete from shardlord.partitions where owner = {node};"
            ))
            .await?;
    } else {
        let parts = ctx.meta.partitions_on_node(node).await?;
        if parts != 0 {
            tracing::warn!(
                node,
                parts,
                "cannot remove a node holding partitions; use force to drop them"
            );
            return Ok(CmdOutcome::Failed);
        }
    }
    if !ctx.meta.node_in_cluster(node).await? {
        tracing::warn!(node, "node not in cluster, won't remove it");
        return Ok(CmdOutcome::Failed);
    }

    tracing::info!(node, "removing node");
    ctx.meta
        .update_metadata(&format!(
            "update shardlord.nodes set worker_status = 'rm_in_progress' where id = {node};"
        ))
        .await?;
    // Give the worker a moment to observe the status change and drop its
    // subscription: the metadata slot cannot be dropped while its walsender
    // is still connected.
    nap(signals, Duration::from_secs(2)).await;
    ctx.meta
        .update_metadata(&format!(
            "select shardlord.drop_repslot('{META_SUB_NAME}_{node}', true); \
             update shardlord.nodes set worker_status = 'removed' where id = {node}; \
             update shardlord.cmd_log set status = 'success' where id = {cmd_id};"
        ))
        .await?;
    tracing::info!(node, "node successfully removed");
    Ok(CmdOutcome::Recorded)
}
