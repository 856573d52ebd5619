//! Shared helpers for integration tests: an in-memory simulated cluster.
//!
//! The simulation implements the connector and metadata-store seams the
//! coordinator core consumes. Each fake worker tracks the catalog objects
//! the coordinator manipulates (tables, publications, subscriptions,
//! replication slots, read-only marks, sync standbys) and answers the exact
//! statement shapes the core generates. Metadata updates run through a
//! small interpreter that also simulates the catalog triggers dropping
//! obsolete replication channels.

// Each test binary uses its own slice of the harness.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_postgres::types::PgLsn;

use shardlord::meta::{CmdRecord, CmdStatus, MetaStore, PartitionCopy};
use shardlord::remote::{Connector, RemoteConn, Row};
use shardlord::{NodeId, META_SUB_NAME};

pub fn lsn_text(value: u64) -> String {
    format!("{:X}/{:X}", value >> 32, value & 0xffff_ffff)
}

#[derive(Clone, Debug)]
pub struct FakeSub {
    pub publisher_connstring: String,
}

#[derive(Debug)]
pub struct FakeNode {
    pub connstring: String,
    pub status: String,
    pub reachable: bool,
    pub wal_lsn: u64,
    pub tables: BTreeSet<String>,
    pub publications: BTreeSet<String>,
    pub slots: BTreeSet<String>,
    pub subscriptions: BTreeMap<String, FakeSub>,
    pub readonly: BTreeSet<String>,
    pub sync_standbys: BTreeSet<String>,
    /// Raw statements this node executed, in order.
    pub log: Vec<String>,
    /// Tablesync progresses one state query at a time.
    substate_queries: BTreeMap<String, u32>,
}

impl FakeNode {
    fn new(id: NodeId) -> Self {
        Self {
            connstring: format!("host=w{id}"),
            status: "active".to_string(),
            reachable: true,
            wal_lsn: 0x2000 + id as u64,
            tables: BTreeSet::new(),
            publications: BTreeSet::new(),
            slots: BTreeSet::new(),
            subscriptions: BTreeMap::new(),
            readonly: BTreeSet::new(),
            sync_standbys: BTreeSet::new(),
            log: Vec::new(),
            substate_queries: BTreeMap::new(),
        }
    }
}

pub struct ClusterInner {
    pub nodes: BTreeMap<NodeId, FakeNode>,
    pub partitions: Vec<PartitionCopy>,
    pub lord_lsn: u64,
    /// Substate queries a subscription answers with "not ready" before it
    /// reports ready; models the initial tablesync taking a poll or two.
    pub sub_ready_after: u32,
    pub cmd_statuses: Vec<(i64, String)>,
    pub connects: usize,
}

/// Handle to the simulated cluster; clones share state.
#[derive(Clone)]
pub struct FakeCluster {
    inner: Arc<Mutex<ClusterInner>>,
}

impl FakeCluster {
    pub fn new(node_ids: &[NodeId]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClusterInner {
                nodes: node_ids.iter().map(|id| (*id, FakeNode::new(*id))).collect(),
                partitions: Vec::new(),
                lord_lsn: 0x10,
                sub_ready_after: 1,
                cmd_statuses: Vec::new(),
                connects: 0,
            })),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn meta(&self) -> FakeMeta {
        FakeMeta {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn add_partition(
        &self,
        part_name: &str,
        relation: &str,
        owner: NodeId,
        prv: Option<NodeId>,
        nxt: Option<NodeId>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&owner) {
            node.tables.insert(part_name.to_string());
        }
        inner.partitions.push(PartitionCopy {
            part_name: part_name.to_string(),
            relation: relation.to_string(),
            owner,
            prv,
            nxt,
        });
    }

    /// Seed the debris of an interrupted copy: publication, slot and
    /// subscription of the copy channel left behind by a dead coordinator.
    pub fn seed_stale_copy_channel(&self, part: &str, src: NodeId, dst: NodeId) {
        let name = format!("copy_{part}_{src}_{dst}");
        let mut inner = self.inner.lock().unwrap();
        let src_connstring = inner.nodes[&src].connstring.clone();
        if let Some(node) = inner.nodes.get_mut(&src) {
            node.publications.insert(name.clone());
            node.slots.insert(name.clone());
        }
        if let Some(node) = inner.nodes.get_mut(&dst) {
            node.tables.insert(part.to_string());
            node.subscriptions.insert(
                name,
                FakeSub {
                    publisher_connstring: src_connstring,
                },
            );
        }
    }

    /// Seed an existing steady-state data channel from `a` to `b`.
    pub fn add_data_channel(&self, part: &str, a: NodeId, b: NodeId) {
        let name = format!("data_{part}_{a}_{b}");
        let mut inner = self.inner.lock().unwrap();
        let a_connstring = inner.nodes[&a].connstring.clone();
        if let Some(node) = inner.nodes.get_mut(&a) {
            node.publications.insert(name.clone());
            node.slots.insert(name.clone());
        }
        if let Some(node) = inner.nodes.get_mut(&b) {
            node.subscriptions.insert(
                name,
                FakeSub {
                    publisher_connstring: a_connstring,
                },
            );
        }
    }

    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&node) {
            node.reachable = reachable;
        }
    }

    pub fn with_inner<T>(&self, f: impl FnOnce(&ClusterInner) -> T) -> T {
        f(&self.inner.lock().unwrap())
    }

    pub fn partitions_of(&self, part: &str) -> Vec<PartitionCopy> {
        self.with_inner(|inner| {
            inner
                .partitions
                .iter()
                .filter(|copy| copy.part_name == part)
                .cloned()
                .collect()
        })
    }

    pub fn owners_of(&self, part: &str) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = self
            .partitions_of(part)
            .iter()
            .map(|copy| copy.owner)
            .collect();
        owners.sort_unstable();
        owners
    }

    /// Any publication, subscription or slot on `node` whose name contains
    /// `needle`.
    pub fn channel_objects_on(&self, node: NodeId, needle: &str) -> Vec<String> {
        self.with_inner(|inner| {
            let node = &inner.nodes[&node];
            node.publications
                .iter()
                .chain(node.slots.iter())
                .chain(node.subscriptions.keys())
                .filter(|name| name.contains(needle))
                .cloned()
                .collect()
        })
    }

    pub fn has_slot(&self, node: NodeId, name: &str) -> bool {
        self.with_inner(|inner| inner.nodes[&node].slots.contains(name))
    }

    pub fn has_subscription(&self, node: NodeId, name: &str) -> bool {
        self.with_inner(|inner| inner.nodes[&node].subscriptions.contains_key(name))
    }

    pub fn has_table(&self, node: NodeId, name: &str) -> bool {
        self.with_inner(|inner| inner.nodes[&node].tables.contains(name))
    }

    pub fn statements_of(&self, node: NodeId) -> Vec<String> {
        self.with_inner(|inner| inner.nodes[&node].log.clone())
    }

    pub fn connects(&self) -> usize {
        self.with_inner(|inner| inner.connects)
    }
}

/// Pull the n-th `'quoted'` literal out of a statement.
fn quoted(stmt: &str, index: usize) -> Option<String> {
    let mut literals = Vec::new();
    let mut rest = stmt;
    while let Some(start) = rest.find('\'') {
        let tail = &rest[start + 1..];
        let end = tail.find('\'')?;
        literals.push(tail[..end].to_string());
        rest = &tail[end + 1..];
    }
    literals.get(index).cloned()
}

/// Word following `prefix` in `stmt`, trimmed of trailing punctuation.
fn word_after<'a>(stmt: &'a str, prefix: &str) -> Option<&'a str> {
    let tail = stmt.strip_prefix(prefix)?;
    let word = tail.split_whitespace().next()?;
    Some(word.trim_end_matches([';', ',', ')']))
}

/// Arguments of `select shardlord.<func>('part', src, dst)`.
fn shardlord_func_args(stmt: &str) -> Option<(String, NodeId, NodeId)> {
    let open = stmt.find('(')?;
    let close = stmt.rfind(')')?;
    let args: Vec<&str> = stmt[open + 1..close].split(',').map(str::trim).collect();
    if args.len() != 3 {
        return None;
    }
    let part = args[0].trim_matches('\'').to_string();
    Some((part, args[1].parse().ok()?, args[2].parse().ok()?))
}

/// Endpoints of a channel name `<prefix>_<part>_<a>_<b>`.
fn channel_endpoints(name: &str) -> Option<(NodeId, NodeId)> {
    let mut it = name.rsplitn(3, '_');
    let b = it.next()?.parse().ok()?;
    let a = it.next()?.parse().ok()?;
    Some((a, b))
}

pub struct FakeConnector {
    inner: Arc<Mutex<ClusterInner>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, connstring: &str) -> anyhow::Result<Box<dyn RemoteConn>> {
        let mut inner = self.inner.lock().unwrap();
        let node_id = inner
            .nodes
            .iter()
            .find(|(_, node)| node.connstring == connstring)
            .map(|(id, _)| *id)
            .ok_or_else(|| anyhow::anyhow!("unknown node {connstring}"))?;
        if !inner.nodes[&node_id].reachable {
            anyhow::bail!("connection to {connstring} refused");
        }
        inner.connects += 1;
        Ok(Box::new(FakeConn {
            inner: Arc::clone(&self.inner),
            node_id,
            wakeups: Arc::new(Notify::new()),
        }))
    }
}

pub struct FakeConn {
    inner: Arc<Mutex<ClusterInner>>,
    node_id: NodeId,
    wakeups: Arc<Notify>,
}

#[async_trait]
impl RemoteConn for FakeConn {
    async fn exec(&mut self, stmt: &str) -> anyhow::Result<Vec<Row>> {
        let mut inner = self.inner.lock().unwrap();
        let lord_lsn = inner.lord_lsn;
        let sub_ready_after = inner.sub_ready_after;

        // A node that went down mid-session fails like a broken socket.
        if !inner.nodes[&self.node_id].reachable {
            anyhow::bail!("connection to node {} lost", self.node_id);
        }

        // Subscription lsn polls need a peek at the publisher.
        if stmt.starts_with("select received_lsn from pg_stat_subscription") {
            inner.nodes.get_mut(&self.node_id).unwrap().log.push(stmt.to_string());
            let subname = quoted(stmt, 0).unwrap_or_default();
            if subname == META_SUB_NAME {
                return Ok(vec![vec![Some(lsn_text(lord_lsn))]]);
            }
            let Some(sub) = inner.nodes[&self.node_id].subscriptions.get(&subname).cloned()
            else {
                return Ok(Vec::new());
            };
            let publisher = inner
                .nodes
                .values()
                .find(|node| node.connstring == sub.publisher_connstring);
            let received = match publisher {
                Some(node)
                    if node.reachable
                        && node.publications.contains(&subname)
                        && node.slots.contains(&subname) =>
                {
                    node.wal_lsn
                }
                _ => 0,
            };
            return Ok(vec![vec![Some(lsn_text(received))]]);
        }

        let node = inner.nodes.get_mut(&self.node_id).unwrap();
        node.log.push(stmt.to_string());

        if stmt == "set session synchronous_commit to local" {
            return Ok(Vec::new());
        }
        if stmt.contains("srsubstate") {
            let subname = quoted(stmt, 0).unwrap_or_default();
            if !node.subscriptions.contains_key(&subname) && subname != META_SUB_NAME {
                return Ok(Vec::new());
            }
            let queries = node.substate_queries.entry(subname).or_insert(0);
            *queries += 1;
            let state = if *queries > sub_ready_after { "r" } else { "d" };
            return Ok(vec![vec![Some(state.to_string())]]);
        }
        if let Some(name) = word_after(stmt, "drop subscription if exists ") {
            node.subscriptions.remove(name);
            return Ok(Vec::new());
        }
        if let Some(name) = word_after(stmt, "drop publication if exists ") {
            node.publications.remove(name);
            return Ok(Vec::new());
        }
        if let Some(name) = word_after(stmt, "create publication ") {
            node.publications.insert(name.to_string());
            return Ok(Vec::new());
        }
        if let Some(name) = word_after(stmt, "drop table if exists ") {
            node.tables.remove(name);
            node.readonly.remove(name);
            return Ok(Vec::new());
        }
        if let Some(name) = word_after(stmt, "create table ") {
            node.tables.insert(name.to_string());
            return Ok(Vec::new());
        }
        if let Some(name) = word_after(stmt, "create subscription ") {
            let publisher_connstring = quoted(stmt, 0).unwrap_or_default();
            node.subscriptions.insert(
                name.to_string(),
                FakeSub {
                    publisher_connstring,
                },
            );
            return Ok(Vec::new());
        }
        if stmt.starts_with("select pg_create_logical_replication_slot(") {
            let name = quoted(stmt, 0).unwrap_or_default();
            if !node.slots.insert(name.clone()) {
                anyhow::bail!("replication slot {name} already exists");
            }
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.drop_repslot(") {
            let name = quoted(stmt, 0).unwrap_or_default();
            node.slots.remove(&name);
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.readonly_table_on(") {
            let name = quoted(stmt, 0).unwrap_or_default();
            node.readonly.insert(name);
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.readonly_table_off(") {
            let name = quoted(stmt, 0).unwrap_or_default();
            node.readonly.remove(&name);
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.ensure_sync_standby(") {
            let name = quoted(stmt, 0).unwrap_or_default();
            node.sync_standbys.insert(name);
            return Ok(Vec::new());
        }
        if stmt == "select pg_current_wal_lsn()" {
            let lsn = node.wal_lsn;
            return Ok(vec![vec![Some(lsn_text(lsn))]]);
        }
        if stmt.starts_with("select shardlord.replica_created_drop_cp_sub(") {
            if let Some((part, src, dst)) = shardlord_func_args(stmt) {
                node.subscriptions.remove(&format!("copy_{part}_{src}_{dst}"));
            }
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.replica_created_create_data_pub(") {
            if let Some((part, src, dst)) = shardlord_func_args(stmt) {
                node.publications.insert(format!("data_{part}_{src}_{dst}"));
            }
            return Ok(Vec::new());
        }
        if stmt.starts_with("select shardlord.replica_created_create_data_sub(") {
            if let Some((part, src, dst)) = shardlord_func_args(stmt) {
                let publisher_connstring = inner
                    .nodes
                    .get(&src)
                    .map(|node| node.connstring.clone())
                    .unwrap_or_default();
                inner.nodes.get_mut(&self.node_id).unwrap().subscriptions.insert(
                    format!("data_{part}_{src}_{dst}"),
                    FakeSub {
                        publisher_connstring,
                    },
                );
            }
            return Ok(Vec::new());
        }
        // Catalog-side reshape functions; the interesting side effects for
        // these tests are the explicit slot/sub statements around them.
        if stmt.starts_with("select shardlord.part_moved_") {
            return Ok(Vec::new());
        }
        Ok(Vec::new())
    }

    fn wakeups(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeups)
    }
}

pub struct FakeMeta {
    inner: Arc<Mutex<ClusterInner>>,
}

impl FakeMeta {
    /// Simulate the catalog triggers: once metadata says a partition left
    /// `gone`, every channel of that partition touching `gone` is dropped
    /// cluster-wide, the copy channel included.
    fn drop_channels_for_move(inner: &mut ClusterInner, part: &str, gone: NodeId, dst: NodeId) {
        let copy_name = format!("copy_{part}_{gone}_{dst}");
        let data_prefix = format!("data_{part}_");
        let stale = |name: &str| {
            if name == copy_name {
                return true;
            }
            if let Some(rest) = name.strip_prefix(&data_prefix) {
                if let Some((a, b)) = channel_endpoints(rest) {
                    return a == gone || b == gone;
                }
            }
            false
        };
        for node in inner.nodes.values_mut() {
            node.publications.retain(|name| !stale(name));
            node.slots.retain(|name| !stale(name));
            node.subscriptions.retain(|name, _| !stale(name));
        }
        // The vacated source also loses its table.
        if let Some(node) = inner.nodes.get_mut(&gone) {
            node.tables.remove(part);
            node.readonly.remove(part);
        }
    }

    fn drop_copy_channel(inner: &mut ClusterInner, part: &str, src: NodeId, dst: NodeId) {
        let copy_name = format!("copy_{part}_{src}_{dst}");
        for node in inner.nodes.values_mut() {
            node.publications.remove(&copy_name);
            node.slots.remove(&copy_name);
            node.subscriptions.remove(&copy_name);
        }
    }

    fn apply_statement(inner: &mut ClusterInner, stmt: &str) -> anyhow::Result<()> {
        if stmt.starts_with("update shardlord.partitions set owner = ") {
            let dst: NodeId = word_after(stmt, "update shardlord.partitions set owner = ")
                .and_then(|word| word.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("bad owner update: {stmt}"))?;
            let part = quoted(stmt, 0).ok_or_else(|| anyhow::anyhow!("bad owner update: {stmt}"))?;
            let src: NodeId = stmt
                .split("and owner = ")
                .nth(1)
                .and_then(|tail| tail.split_whitespace().next())
                .and_then(|word| word.trim_end_matches(';').parse().ok())
                .ok_or_else(|| anyhow::anyhow!("bad owner update: {stmt}"))?;
            for copy in inner
                .partitions
                .iter_mut()
                .filter(|copy| copy.part_name == part && copy.owner == src)
            {
                copy.owner = dst;
            }
            Self::drop_channels_for_move(inner, &part, src, dst);
            return Ok(());
        }
        for field in ["nxt", "prv"] {
            let prefix = format!("update shardlord.partitions set {field} = ");
            if let Some(tail) = stmt.strip_prefix(prefix.as_str()) {
                let dst: NodeId = tail
                    .split_whitespace()
                    .next()
                    .and_then(|word| word.parse().ok())
                    .ok_or_else(|| anyhow::anyhow!("bad {field} update: {stmt}"))?;
                let part =
                    quoted(stmt, 0).ok_or_else(|| anyhow::anyhow!("bad {field} update: {stmt}"))?;
                if let Some(src) = stmt
                    .split(&format!("and {field} = "))
                    .nth(1)
                    .and_then(|tail| tail.split_whitespace().next())
                    .and_then(|word| word.trim_end_matches(';').parse::<NodeId>().ok())
                {
                    for copy in inner.partitions.iter_mut().filter(|copy| {
                        copy.part_name == part
                            && match field {
                                "nxt" => copy.nxt == Some(src),
                                _ => copy.prv == Some(src),
                            }
                    }) {
                        match field {
                            "nxt" => copy.nxt = Some(dst),
                            _ => copy.prv = Some(dst),
                        }
                    }
                } else if let Some(owner) = stmt
                    .split("and owner = ")
                    .nth(1)
                    .and_then(|tail| tail.split_whitespace().next())
                    .and_then(|word| word.trim_end_matches(';').parse::<NodeId>().ok())
                {
                    for copy in inner
                        .partitions
                        .iter_mut()
                        .filter(|copy| copy.part_name == part && copy.owner == owner)
                    {
                        match field {
                            "nxt" => copy.nxt = Some(dst),
                            _ => copy.prv = Some(dst),
                        }
                    }
                }
                return Ok(());
            }
        }
        if stmt.starts_with("insert into shardlord.partitions ") {
            let part = quoted(stmt, 0).ok_or_else(|| anyhow::anyhow!("bad insert: {stmt}"))?;
            let relation = quoted(stmt, 1).ok_or_else(|| anyhow::anyhow!("bad insert: {stmt}"))?;
            let values = stmt
                .split("values (")
                .nth(1)
                .ok_or_else(|| anyhow::anyhow!("bad insert: {stmt}"))?;
            let fields: Vec<&str> = values.trim_end_matches([')', ';']).split(',').collect();
            let owner: NodeId = fields
                .get(1)
                .and_then(|word| word.trim().parse().ok())
                .ok_or_else(|| anyhow::anyhow!("bad insert: {stmt}"))?;
            let prv: Option<NodeId> = fields.get(2).and_then(|word| word.trim().parse().ok());
            inner.partitions.push(PartitionCopy {
                part_name: part.clone(),
                relation,
                owner,
                prv,
                nxt: None,
            });
            if let Some(src) = prv {
                Self::drop_copy_channel(inner, &part, src, owner);
            }
            return Ok(());
        }
        if stmt.starts_with("update shardlord.cmd_log set status = ") {
            let status = quoted(stmt, 0).unwrap_or_default();
            let id: i64 = stmt
                .split("where id = ")
                .nth(1)
                .and_then(|tail| tail.split_whitespace().next())
                .and_then(|word| word.trim_end_matches(';').parse().ok())
                .unwrap_or(0);
            inner.cmd_statuses.push((id, status));
            return Ok(());
        }
        // Membership statements the copy tests never reach.
        Ok(())
    }
}

#[async_trait]
impl MetaStore for FakeMeta {
    async fn node_connstring(&self, node: NodeId) -> anyhow::Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.get(&node).map(|node| node.connstring.clone()))
    }

    async fn node_in_cluster(&self, node: NodeId) -> anyhow::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nodes
            .get(&node)
            .map(|node| node.status == "active" || node.status == "rm_in_progress")
            .unwrap_or(false))
    }

    async fn active_workers(&self) -> anyhow::Result<Vec<NodeId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, node)| node.status == "active")
            .map(|(id, _)| *id)
            .collect())
    }

    async fn partition_on_node(
        &self,
        part: &str,
        node: NodeId,
    ) -> anyhow::Result<Option<PartitionCopy>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .find(|copy| copy.part_name == part && copy.owner == node)
            .cloned())
    }

    async fn primary_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .find(|copy| copy.part_name == part && copy.prv.is_none())
            .map(|copy| copy.owner))
    }

    async fn reptail_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .find(|copy| copy.part_name == part && copy.nxt.is_none())
            .map(|copy| copy.owner))
    }

    async fn partition_relation(&self, part: &str) -> anyhow::Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .find(|copy| copy.part_name == part)
            .map(|copy| copy.relation.clone()))
    }

    async fn parts_of_relation(&self, relation: &str) -> anyhow::Result<Vec<PartitionCopy>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .filter(|copy| copy.relation == relation)
            .cloned()
            .collect())
    }

    async fn replica_counts(&self, relation: &str) -> anyhow::Result<Vec<(String, i64)>> {
        let inner = self.inner.lock().unwrap();
        let mut counts: Vec<(String, i64)> = Vec::new();
        for copy in inner.partitions.iter().filter(|copy| copy.relation == relation) {
            let replica = i64::from(copy.prv.is_some());
            match counts.iter_mut().find(|(name, _)| *name == copy.part_name) {
                Some((_, count)) => *count += replica,
                None => counts.push((copy.part_name.clone(), replica)),
            }
        }
        Ok(counts)
    }

    async fn partitions_on_node(&self, node: NodeId) -> anyhow::Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .partitions
            .iter()
            .filter(|copy| copy.owner == node)
            .count() as i64)
    }

    async fn current_lsn(&self) -> anyhow::Result<PgLsn> {
        let inner = self.inner.lock().unwrap();
        Ok(lsn_text(inner.lord_lsn).parse().unwrap())
    }

    async fn update_metadata(&self, sql: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            Self::apply_statement(&mut inner, stmt)?;
        }
        Ok(())
    }

    async fn next_node_id(&self) -> anyhow::Result<NodeId> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.keys().copied().max().unwrap_or(0) + 1)
    }

    async fn next_command(&self) -> anyhow::Result<Option<CmdRecord>> {
        Ok(None)
    }

    async fn set_command_status(&self, id: i64, status: CmdStatus) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.cmd_statuses.push((id, status.as_str().to_string()));
        Ok(())
    }
}
