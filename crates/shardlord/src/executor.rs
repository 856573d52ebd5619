//! Parallel task execution.
//!
//! Tasks are driven by one cooperative loop: each iteration drains every
//! task whose wake time has elapsed, then blocks in the multiplexer until
//! the next deadline, a registered session becomes readable, or a signal
//! arrives. A handler never blocks beyond a single short remote statement;
//! long waits come back as reschedules.

use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::copypart::TaskResult;
use crate::meta::MetaStore;
use crate::remote::Connector;
use crate::signal::Signals;
use crate::tasks::Task;
use crate::Config;

/// Everything a task handler needs from the outside world.
pub struct TaskCtx<'a> {
    pub connector: &'a dyn Connector,
    pub meta: &'a dyn MetaStore,
    pub config: &'a Config,
}

/// Dispatcher directive returned by a task step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecHint {
    /// Keep the task on the time list; it has already updated its wake time.
    WakeMeAt,
    /// Park the task until its registered session becomes readable.
    WaitOnSocket,
    /// Terminal; the task is finished (successfully or not).
    Done,
}

/// Waits on the soonest of: the earliest task deadline, any registered
/// session wakeup, a signal. Registrations are one-shot — after a task
/// fires it must be registered again to be heard again. Sessions never need
/// deregistration; closing the connection is enough, since a stale entry at
/// worst causes one spurious dispatch.
pub struct Multiplexer {
    sockets: FuturesUnordered<BoxFuture<'static, usize>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            sockets: FuturesUnordered::new(),
        }
    }

    pub fn register(&mut self, id: usize, wakeups: Arc<Notify>) {
        self.sockets.push(Box::pin(async move {
            wakeups.notified().await;
            id
        }));
    }

    /// Block until something happens; `Some(id)` when a registered session
    /// fired, `None` on deadline or signal.
    pub async fn wait(&mut self, deadline: Option<Instant>, signals: &Signals) -> Option<usize> {
        tokio::select! {
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => future::pending::<()>().await,
                }
            } => None,
            Some(id) = self.sockets.next(), if !self.sockets.is_empty() => Some(id),
            _ = signals.wait() => None,
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive all tasks until every one is terminal or a signal is pending.
/// Failed tasks are never retried here — retry policy lives inside the task
/// steps and comes back as `WakeMeAt`. On return every task has released
/// its remote connections.
pub async fn exec_tasks(
    tasks: &mut [Task],
    ctx: &TaskCtx<'_>,
    signals: &Signals,
) -> anyhow::Result<()> {
    let mut mux = Multiplexer::new();
    // Every task is ready for execution right away.
    let mut time_list: Vec<usize> = (0..tasks.len()).collect();
    let mut unfinished = tasks.len();

    'outer: while unfinished > 0 && !signals.any_pending() {
        let now = Instant::now();
        let due: Vec<usize> = time_list
            .iter()
            .copied()
            .filter(|&id| tasks[id].cp().wake_at <= now)
            .collect();

        if due.is_empty() {
            let deadline = time_list.iter().map(|&id| tasks[id].cp().wake_at).min();
            if let Some(id) = mux.wait(deadline, signals).await {
                // One-shot: the session fired, make the task due now; it
                // re-registers if it wants to listen again.
                tasks[id].cp_mut().wake_at = Instant::now();
                time_list.push(id);
            }
            continue;
        }

        for id in due {
            tracing::debug!(part = %tasks[id].cp().part_name, "task is ready for exec");
            let hint = tasks[id].exec(ctx).await?;
            match hint {
                ExecHint::WakeMeAt => {}
                ExecHint::WaitOnSocket => {
                    time_list.retain(|&entry| entry != id);
                    match tasks[id].wakeup_handle() {
                        Some(wakeups) => mux.register(id, wakeups),
                        None => {
                            // No live session to wait on; degrade to an
                            // immediate timer wake instead of losing the task.
                            tasks[id].cp_mut().wake_at = Instant::now();
                            time_list.push(id);
                        }
                    }
                }
                ExecHint::Done => {
                    time_list.retain(|&entry| entry != id);
                    unfinished -= 1;
                    tasks[id].release_connections();
                }
            }
            if signals.any_pending() {
                break 'outer;
            }
        }
    }

    for task in tasks.iter_mut() {
        task.release_connections();
    }
    Ok(())
}

/// True when every task finished successfully.
pub fn all_succeeded(tasks: &[Task]) -> bool {
    tasks
        .iter()
        .all(|task| task.cp().result == TaskResult::Success)
}
