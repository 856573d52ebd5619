//! Remote SQL sessions against worker nodes.
//!
//! Each task keeps at most one session per involved node. Sessions are lazy:
//! they connect on first use, and any statement failure discards the session
//! so the next attempt reconnects cleanly. Batches are sequences of `;`
//! separated statements executed in separate transactions, in order.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future;
use tokio::sync::Notify;
use tokio_postgres::{NoTls, SimpleQueryMessage};

/// One result row as returned by the simple-query protocol: column values in
/// textual form, null preserved.
pub type Row = Vec<Option<String>>;

/// A live session to one node.
#[async_trait]
pub trait RemoteConn: Send {
    /// Run a single statement and return its rows.
    async fn exec(&mut self, stmt: &str) -> anyhow::Result<Vec<Row>>;

    /// Handle pinged whenever the server sends an asynchronous message on
    /// this session (notices, notifications). The multiplexer uses it as the
    /// session's readiness signal.
    fn wakeups(&self) -> Arc<Notify>;

    /// False once the underlying connection is known dead.
    fn healthy(&self) -> bool {
        true
    }
}

/// Factory for sessions; the production implementation speaks the Postgres
/// wire protocol, tests substitute a simulated cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, connstring: &str) -> anyhow::Result<Box<dyn RemoteConn>>;
}

/// tokio-postgres backed connector.
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, connstring: &str) -> anyhow::Result<Box<dyn RemoteConn>> {
        let (client, mut connection) = tokio_postgres::connect(connstring, NoTls)
            .await
            .with_context(|| format!("connect to {connstring}"))?;

        let wakeups = Arc::new(Notify::new());
        let wake = Arc::clone(&wakeups);
        let driver = tokio::spawn(async move {
            loop {
                match future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(_msg)) => wake.notify_one(),
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "remote connection closed with error");
                        wake.notify_one();
                        break;
                    }
                    None => {
                        wake.notify_one();
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PgRemoteConn {
            client,
            driver,
            wakeups,
        }))
    }
}

struct PgRemoteConn {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
    wakeups: Arc<Notify>,
}

#[async_trait]
impl RemoteConn for PgRemoteConn {
    async fn exec(&mut self, stmt: &str) -> anyhow::Result<Vec<Row>> {
        let messages = self.client.simple_query(stmt).await?;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                rows.push((0..row.len()).map(|i| row.get(i).map(str::to_owned)).collect());
            }
        }
        Ok(rows)
    }

    fn wakeups(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeups)
    }

    fn healthy(&self) -> bool {
        !self.driver.is_finished()
    }
}

impl Drop for PgRemoteConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Session directive issued right after connecting: our control statements
/// must not themselves wait for the synchronous replication they configure.
const SESSION_SETUP_SQL: &str = "set session synchronous_commit to local";

/// A lazily connected, resettable session to one node.
pub struct NodeSession {
    connstring: String,
    conn: Option<Box<dyn RemoteConn>>,
}

impl NodeSession {
    pub fn new(connstring: impl Into<String>) -> Self {
        Self {
            connstring: connstring.into(),
            conn: None,
        }
    }

    pub fn connstring(&self) -> &str {
        &self.connstring
    }

    /// Drop the session; the next use reconnects.
    pub fn reset(&mut self) {
        self.conn = None;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Readiness handle of the live session, if any.
    pub fn wakeups(&self) -> Option<Arc<Notify>> {
        self.conn.as_ref().map(|conn| conn.wakeups())
    }

    /// Make sure the session is established, replacing a dead one.
    pub async fn ensure(&mut self, connector: &dyn Connector) -> anyhow::Result<()> {
        if let Some(conn) = self.conn.as_ref() {
            if conn.healthy() {
                return Ok(());
            }
            self.reset();
        }
        let mut conn = connector.connect(&self.connstring).await?;
        if let Err(err) = conn.exec(SESSION_SETUP_SQL).await {
            return Err(err.context("session setup"));
        }
        tracing::debug!(connstring = %self.connstring, "connection established");
        self.conn = Some(conn);
        Ok(())
    }

    fn conn_mut(&mut self) -> anyhow::Result<&mut Box<dyn RemoteConn>> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("session not connected"))
    }

    /// Run one statement, returning its rows. The session is discarded on
    /// failure so the caller's retry reconnects.
    pub async fn query_rows(
        &mut self,
        connector: &dyn Connector,
        stmt: &str,
    ) -> anyhow::Result<Vec<Row>> {
        self.ensure(connector).await?;
        match self.conn_mut()?.exec(stmt).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                self.reset();
                Err(err.context(format!("statement failed: {stmt}")))
            }
        }
    }

    /// Run a `;`-separated batch, each statement in its own transaction.
    /// Separate transactions are load-bearing: a logical replication slot
    /// cannot be created in a transaction that already performed writes.
    /// The splitter assumes no semicolons inside literals, which holds for
    /// all internally generated SQL.
    pub async fn exec_batch(
        &mut self,
        connector: &dyn Connector,
        stmts: &str,
    ) -> anyhow::Result<()> {
        self.ensure(connector).await?;
        for stmt in stmts.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            if let Err(err) = self.conn_mut()?.exec(stmt).await {
                self.reset();
                return Err(err.context(format!("statement failed: {stmt}")));
            }
        }
        Ok(())
    }
}
