//! Shardlord: the coordinator of a sharded Postgres cluster.
//!
//! The coordinator accepts administrative commands (move a partition, create
//! a replica, rebalance a relation, membership changes), decomposes them into
//! restartable tasks, and drives the tasks concurrently against the worker
//! nodes over logical replication channels.

use std::time::Duration;

pub mod commands;
pub mod copypart;
pub mod executor;
pub mod meta;
pub mod remote;
pub mod signal;
pub mod tasks;

/// Worker node identifier as stored in the catalog. Valid ids are >= 1;
/// an absent neighbor in a replica chain is `None`.
pub type NodeId = i32;

/// Reserved sentinel outside the valid id range. Stands in for the
/// coordinator itself wherever a concrete id is required, notably in
/// derived channel names when `my_id` is unset.
pub const INVALID_NODE_ID: NodeId = 0;

/// Name of the metadata subscription every worker holds against the
/// coordinator. The per-worker slot on the coordinator is this name with
/// `_<node id>` appended.
pub const META_SUB_NAME: &str = "shardlord_meta_sub";

/// Process-wide configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connstring workers (and the coordinator itself) use to reach the
    /// coordinator's database.
    pub shardlord_connstring: String,
    /// Database the coordinator's own catalog client connects to. Empty
    /// means whatever the connstring says.
    pub shardlord_dbname: String,
    /// Delay before retrying a remote statement that failed.
    pub cmd_retry_naptime: Duration,
    /// Delay between progress polls against replication state views.
    pub poll_interval: Duration,
    /// This node's id, embedded in the replication-slot names built for the
    /// previous hop during a move. The coordinator itself usually has no
    /// worker id and falls back to [`INVALID_NODE_ID`].
    pub my_id: Option<NodeId>,
    /// Whether new replicas are installed into the synchronous-standby list.
    pub sync_replicas: bool,
}

impl Config {
    /// Configuration with the catalog defaults, handy for tests.
    pub fn with_defaults(shardlord_connstring: impl Into<String>) -> Self {
        Self {
            shardlord_connstring: shardlord_connstring.into(),
            shardlord_dbname: String::new(),
            cmd_retry_naptime: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(10_000),
            my_id: None,
            sync_replicas: false,
        }
    }
}
