// Shardlord daemon entry point.
//
// Wires together the catalog client, the remote connector, signal handling,
// and the command-dispatch loop: fetch the oldest unfinished command from
// the log, run its handler, record the outcome, then sleep until a
// command-log notification or a signal arrives.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use shardlord::commands::{self, CmdOutcome};
use shardlord::executor::TaskCtx;
use shardlord::meta::{CmdStatus, MetaStore, PgMetaStore};
use shardlord::remote::{NodeSession, PgConnector};
use shardlord::signal::Signals;
use shardlord::Config;

/// NOTIFY channel fired by the trigger on command-log inserts.
const CMD_LOG_CHANNEL: &str = "shardlord_cmd_log";

/// CLI options for running the coordinator.
#[derive(Parser, Debug)]
#[command(name = "shardlord", version)]
struct Args {
    /// This process plays the coordinator role.
    #[arg(long, env = "SHARDLORD_ROLE", default_value_t = true)]
    shardlord: bool,

    /// Database the coordinator's catalog client connects to; empty defers
    /// to the connstring.
    #[arg(long, env = "SHARDLORD_DBNAME", default_value = "")]
    shardlord_dbname: String,

    /// Connstring workers use to reach the coordinator for metadata
    /// replication; also used by the coordinator to reach itself.
    #[arg(long, env = "SHARDLORD_CONNSTRING")]
    shardlord_connstring: String,

    /// Sleep (ms) before retrying a remote statement that failed.
    #[arg(long, env = "SHARDLORD_CMD_RETRY_NAPTIME_MS", default_value_t = 10_000)]
    cmd_retry_naptime_ms: u64,

    /// Some progress can only be learned by polling the target node; this
    /// is how often (ms) we poll.
    #[arg(long, env = "SHARDLORD_POLL_INTERVAL_MS", default_value_t = 10_000)]
    poll_interval_ms: u64,

    /// Node id to include in logs. Workers have theirs persisted at add
    /// time; the coordinator normally runs without one.
    #[arg(long, env = "SHARDLORD_MY_ID")]
    my_id: Option<i32>,

    /// Install new replicas into the synchronous-standby list.
    #[arg(long, env = "SHARDLORD_SYNC_REPLICAS", default_value_t = false)]
    sync_replicas: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !args.shardlord {
        tracing::info!("shardlord role is disabled on this node, exiting");
        return Ok(());
    }
    let config = Config {
        shardlord_connstring: args.shardlord_connstring,
        shardlord_dbname: args.shardlord_dbname,
        cmd_retry_naptime: Duration::from_millis(args.cmd_retry_naptime_ms),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        my_id: args.my_id,
        sync_replicas: args.sync_replicas,
    };

    let signals = Signals::new();
    signals.install()?;

    let meta = PgMetaStore::connect(&config)
        .await
        .context("connect to the catalog database")?;
    let connector = PgConnector;

    run(&config, &meta, &connector, &signals).await
}

/// The coordinator main loop.
async fn run(
    config: &Config,
    meta: &PgMetaStore,
    connector: &PgConnector,
    signals: &Signals,
) -> anyhow::Result<()> {
    tracing::info!("shardlord started");
    let ctx = TaskCtx {
        connector,
        meta,
        config,
    };

    let mut listener = NodeSession::new(&config.shardlord_connstring);
    loop {
        // (Re)arm the command-log listener. Losing it only costs wakeup
        // latency: the loop falls back to periodic polling.
        if !listener.is_connected() {
            if let Err(err) = listener
                .exec_batch(connector, &format!("listen {CMD_LOG_CHANNEL};"))
                .await
            {
                tracing::warn!(error = %err, "command-log listener unavailable, polling instead");
            }
        }

        while let Some(cmd) = meta.next_command().await? {
            if signals.terminate_pending() {
                tracing::info!("terminating, leaving current command for the next run");
                return Ok(());
            }
            meta.set_command_status(cmd.id, CmdStatus::InProgress).await?;
            tracing::info!(id = cmd.id, kind = %cmd.kind, opts = %cmd.opts, "working on command");

            let outcome = commands::dispatch(&ctx, signals, &cmd).await?;
            if signals.terminate_pending() {
                tracing::info!(id = cmd.id, "terminating, command left in progress");
                return Ok(());
            }
            if signals.take_cancel() {
                tracing::info!(id = cmd.id, "command canceled");
                meta.set_command_status(cmd.id, CmdStatus::Canceled).await?;
                continue;
            }
            match outcome {
                CmdOutcome::Recorded => {}
                CmdOutcome::Success => meta.set_command_status(cmd.id, CmdStatus::Success).await?,
                CmdOutcome::Failed => meta.set_command_status(cmd.id, CmdStatus::Failed).await?,
                CmdOutcome::Canceled => {
                    meta.set_command_status(cmd.id, CmdStatus::Canceled).await?
                }
            }
        }

        if signals.terminate_pending() {
            tracing::info!("shardlord received SIGTERM, exiting");
            return Ok(());
        }

        // Queue drained; block until an insert notifies us or a signal
        // arrives.
        match listener.wakeups() {
            Some(wakeups) => {
                tokio::select! {
                    _ = wakeups.notified() => {}
                    _ = signals.wait() => {}
                }
                // Probe the listener; a dead session resets here and gets
                // re-armed at the top of the loop.
                let _ = listener.query_rows(connector, "select 1").await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = signals.wait() => {}
                }
            }
        }
    }
}
