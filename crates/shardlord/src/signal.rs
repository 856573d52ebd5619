//! Process-wide signal flags.
//!
//! SIGTERM asks the coordinator to shut down; SIGUSR1 cancels the command
//! currently being worked on. Handlers only set flags; the executor and the
//! command loop observe them between task dispatches, so a signal never
//! interrupts a remote statement mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Terminate/cancel flags plus a waker for loops blocked in a select.
pub struct Signals {
    terminate: AtomicBool,
    cancel: AtomicBool,
    wake: Notify,
}

impl Signals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            terminate: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Install the unix handlers. Must run inside the runtime.
    pub fn install(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while term.recv().await.is_some() {
                tracing::info!("received SIGTERM, shutting down at next boundary");
                this.raise_terminate();
            }
        });

        let mut usr1 = signal(SignalKind::user_defined1())?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                tracing::info!("received SIGUSR1, canceling current command");
                this.raise_cancel();
            }
        });
        Ok(())
    }

    pub fn raise_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn raise_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn terminate_pending(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn cancel_pending(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// True when either flag is raised.
    pub fn any_pending(&self) -> bool {
        self.terminate_pending() || self.cancel_pending()
    }

    /// Consume a pending cancel so the next command starts clean.
    pub fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    /// Wait until some signal raises a flag.
    pub async fn wait(&self) {
        self.wake.notified().await;
    }
}
