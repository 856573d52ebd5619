//! Metadata store: the coordinator's view of the cluster catalog.
//!
//! The catalog lives in the coordinator's own database (`shardlord.nodes`,
//! `shardlord.partitions`, `shardlord.tables`, `shardlord.cmd_log`) and is
//! replicated to workers over the metadata channel; triggers on the worker
//! side react to row changes (dropping obsolete replication channels,
//! swapping partitions for foreign tables). The core never defines that
//! schema, it only reads rows and applies the metadata transactions the
//! task handlers prepare.

use async_trait::async_trait;
use tokio_postgres::types::PgLsn;
use tokio_postgres::NoTls;

use crate::{Config, NodeId};

/// One copy of a partition: its owner plus chain linkage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionCopy {
    pub part_name: String,
    pub relation: String,
    pub owner: NodeId,
    /// Previous node in the replica chain; `None` for the primary.
    pub prv: Option<NodeId>,
    /// Next node in the replica chain; `None` for the tail.
    pub nxt: Option<NodeId>,
}

impl PartitionCopy {
    pub fn is_primary(&self) -> bool {
        self.prv.is_none()
    }
}

/// A row of the command log.
#[derive(Clone, Debug)]
pub struct CmdRecord {
    pub id: i64,
    pub kind: String,
    pub opts: serde_json::Value,
}

/// Terminal and transitional command statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdStatus {
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl CmdStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CmdStatus::InProgress => "in progress",
            CmdStatus::Success => "success",
            CmdStatus::Failed => "failed",
            CmdStatus::Canceled => "canceled",
        }
    }
}

/// Catalog access used by the task core and the command handlers.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Connstring of a worker node, `None` if the node is unknown.
    async fn node_connstring(&self, node: NodeId) -> anyhow::Result<Option<String>>;

    /// Whether the node is the coordinator, active, or being removed.
    async fn node_in_cluster(&self, node: NodeId) -> anyhow::Result<bool>;

    /// Ids of all active workers.
    async fn active_workers(&self) -> anyhow::Result<Vec<NodeId>>;

    /// The copy of `part` held by `node`, if any.
    async fn partition_on_node(
        &self,
        part: &str,
        node: NodeId,
    ) -> anyhow::Result<Option<PartitionCopy>>;

    /// Owner of the primary copy of `part`.
    async fn primary_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>>;

    /// Owner of the last copy in the replica chain of `part`.
    async fn reptail_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>>;

    /// Parent relation of `part`.
    async fn partition_relation(&self, part: &str) -> anyhow::Result<Option<String>>;

    /// Every copy of every partition of `relation`.
    async fn parts_of_relation(&self, relation: &str) -> anyhow::Result<Vec<PartitionCopy>>;

    /// Replica count per partition of `relation` (primaries excluded).
    async fn replica_counts(&self, relation: &str) -> anyhow::Result<Vec<(String, i64)>>;

    /// How many partition copies live on `node`.
    async fn partitions_on_node(&self, node: NodeId) -> anyhow::Result<i64>;

    /// The coordinator's current WAL write position.
    async fn current_lsn(&self) -> anyhow::Result<PgLsn>;

    /// Apply a prepared multi-statement metadata update in one transaction.
    /// Catalog triggers fire inside the same transaction.
    async fn update_metadata(&self, sql: &str) -> anyhow::Result<()>;

    /// Allocate the next node id.
    async fn next_node_id(&self) -> anyhow::Result<NodeId>;

    /// Oldest command that is still waiting or was interrupted in progress.
    async fn next_command(&self) -> anyhow::Result<Option<CmdRecord>>;

    async fn set_command_status(&self, id: i64, status: CmdStatus) -> anyhow::Result<()>;
}

/// Production metadata store backed by the coordinator's database.
pub struct PgMetaStore {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
}

impl PgMetaStore {
    /// Connect to the coordinator's database, honoring the dbname override.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let mut pg_config: tokio_postgres::Config = config.shardlord_connstring.parse()?;
        if !config.shardlord_dbname.is_empty() {
            pg_config.dbname(&config.shardlord_dbname);
        }
        let (client, connection) = pg_config.connect(NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "metadata store connection lost");
            }
        });
        Ok(Self { client, driver })
    }
}

impl Drop for PgMetaStore {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn partition_copy_from_row(row: &tokio_postgres::Row) -> PartitionCopy {
    PartitionCopy {
        part_name: row.get(0),
        relation: row.get(1),
        owner: row.get(2),
        prv: row.get(3),
        nxt: row.get(4),
    }
}

#[async_trait]
impl MetaStore for PgMetaStore {
    async fn node_connstring(&self, node: NodeId) -> anyhow::Result<Option<String>> {
        let row = self
            .client
            .query_opt(
                "select connstring from shardlord.nodes where id = $1 and not shardlord",
                &[&node],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn node_in_cluster(&self, node: NodeId) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_opt(
                "select 1 from shardlord.nodes where id = $1 and (shardlord \
                 or worker_status = 'active' or worker_status = 'rm_in_progress')",
                &[&node],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn active_workers(&self) -> anyhow::Result<Vec<NodeId>> {
        let rows = self
            .client
            .query(
                "select id from shardlord.nodes where worker_status = 'active' order by id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn partition_on_node(
        &self,
        part: &str,
        node: NodeId,
    ) -> anyhow::Result<Option<PartitionCopy>> {
        let row = self
            .client
            .query_opt(
                "select part_name, relation, owner, prv, nxt from shardlord.partitions \
                 where part_name = $1 and owner = $2",
                &[&part, &node],
            )
            .await?;
        Ok(row.as_ref().map(partition_copy_from_row))
    }

    async fn primary_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>> {
        let row = self
            .client
            .query_opt(
                "select owner from shardlord.partitions where part_name = $1 and prv is null",
                &[&part],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn reptail_owner(&self, part: &str) -> anyhow::Result<Option<NodeId>> {
        let row = self
            .client
            .query_opt(
                "select owner from shardlord.partitions where part_name = $1 and nxt is null",
                &[&part],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn partition_relation(&self, part: &str) -> anyhow::Result<Option<String>> {
        let row = self
            .client
            .query_opt(
                "select relation from shardlord.partitions where part_name = $1 limit 1",
                &[&part],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn parts_of_relation(&self, relation: &str) -> anyhow::Result<Vec<PartitionCopy>> {
        let rows = self
            .client
            .query(
                "select part_name, relation, owner, prv, nxt from shardlord.partitions \
                 where relation = $1 order by part_name, owner",
                &[&relation],
            )
            .await?;
        Ok(rows.iter().map(partition_copy_from_row).collect())
    }

    async fn replica_counts(&self, relation: &str) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = self
            .client
            .query(
                "select part_name, count(case when prv is not null then 1 end) \
                 from shardlord.partitions where relation = $1 group by part_name",
                &[&relation],
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    async fn partitions_on_node(&self, node: NodeId) -> anyhow::Result<i64> {
        let row = self
            .client
            .query_one(
                "select count(*) from shardlord.partitions where owner = $1",
                &[&node],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn current_lsn(&self) -> anyhow::Result<PgLsn> {
        let row = self
            .client
            .query_one("select pg_current_wal_lsn()", &[])
            .await?;
        Ok(row.get(0))
    }

    async fn update_metadata(&self, sql: &str) -> anyhow::Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn next_node_id(&self) -> anyhow::Result<NodeId> {
        let row = self
            .client
            .query_one("select nextval('shardlord.nodes_id_seq')", &[])
            .await?;
        let id: i64 = row.get(0);
        Ok(id as NodeId)
    }

    async fn next_command(&self) -> anyhow::Result<Option<CmdRecord>> {
        let row = self
            .client
            .query_opt(
                "select id, cmd, opts from shardlord.cmd_log \
                 where status in ('waiting', 'in progress') order by id limit 1",
                &[],
            )
            .await?;
        Ok(row.map(|row| CmdRecord {
            id: row.get(0),
            kind: row.get(1),
            opts: row.get(2),
        }))
    }

    async fn set_command_status(&self, id: i64, status: CmdStatus) -> anyhow::Result<()> {
        let status = status.as_str();
        self.client
            .execute(
                "update shardlord.cmd_log set status = $2 where id = $1",
                &[&id, &status],
            )
            .await?;
        Ok(())
    }
}
