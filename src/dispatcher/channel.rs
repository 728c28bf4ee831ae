//! Channel-backed queue for deferred triggers.

use crate::bus::{Bus, WeakBus};
use crate::event::Names;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// A trigger waiting for a later turn
pub(crate) struct Deferred {
    names: Names,
    args: Vec<Value>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Per-bus FIFO of deferred triggers.
///
/// A single worker task drains the channel and fires each trigger on the
/// bus. The worker is spawned on the current tokio runtime the first time
/// something is deferred, holds the bus weakly, and exits once the bus is
/// dropped.
#[derive(Default)]
pub(crate) struct DeferQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Deferred>>>,
    counters: Arc<Counters>,
}

impl DeferQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a trigger of `names` with `args` on `bus`.
    pub(crate) fn push(&self, bus: &Bus, names: Names, args: Vec<Value>) -> Result<()> {
        let mut job = Deferred { names, args };
        let mut sender = self.sender.lock();

        if let Some(tx) = sender.as_ref() {
            match tx.send(job) {
                Ok(()) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => {
                    debug!(bus = bus.name(), "Deferred worker gone, restarting");
                    job = returned;
                }
            }
        }

        let handle = Handle::try_current().map_err(|_| Error::NoRuntime {
            name: job.names.to_string(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(Self::process(rx, bus.downgrade(), self.counters.clone()));
        tx.send(job)
            .map_err(|_| Error::internal("Deferred channel closed"))?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        *sender = Some(tx);
        Ok(())
    }

    async fn process(
        mut receiver: mpsc::UnboundedReceiver<Deferred>,
        bus: WeakBus,
        counters: Arc<Counters>,
    ) {
        info!("Deferred trigger worker started");

        while let Some(job) = receiver.recv().await {
            let Some(bus) = bus.upgrade() else {
                break;
            };

            trace!(bus = bus.name(), event = %job.names, "Firing deferred trigger");

            match bus.trigger(job.names.clone(), &job.args) {
                Ok(_) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        bus = bus.name(),
                        event = %job.names,
                        error = %e,
                        "Deferred trigger failed"
                    );
                }
            }
        }

        info!("Deferred trigger worker stopped");
    }

    pub(crate) fn stats(&self) -> DeferStats {
        DeferStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for deferred triggers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferStats {
    /// Triggers accepted into the queue
    pub queued: u64,
    /// Triggers that fired without error
    pub delivered: u64,
    /// Triggers whose callbacks returned an error
    pub failed: u64,
}

impl DeferStats {
    /// Triggers queued but not yet fired
    pub fn in_flight(&self) -> u64 {
        self.queued.saturating_sub(self.delivered + self.failed)
    }
}

impl fmt::Display for DeferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queued, {} delivered, {} failed",
            self.queued, self.delivered, self.failed
        )
    }
}
