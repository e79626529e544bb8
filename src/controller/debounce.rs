//! Coalesces bursts of parameter changes
//!
//! Slider drags produce dozens of updates a second. The first update of a
//! burst opens a window; whatever is newest when the window closes is
//! forwarded, everything before it is dropped.

use crate::params::ParameterSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub struct Debouncer {
    tx: mpsc::UnboundedSender<ParameterSnapshot>,
    task: JoinHandle<()>,
    forwarded: Arc<AtomicU64>,
}

impl Debouncer {
    /// Spawn the debounce task on `runtime`; `sink` receives one snapshot per burst
    pub fn spawn<F>(runtime: &Handle, window: Duration, sink: F) -> Self
    where
        F: Fn(ParameterSnapshot) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ParameterSnapshot>();
        let forwarded = Arc::new(AtomicU64::new(0));
        let forwarded_clone = Arc::clone(&forwarded);

        let task = runtime.spawn(async move {
            while let Some(first) = rx.recv().await {
                let deadline = Instant::now() + window;
                let mut latest = first;
                let mut coalesced = 0u32;

                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break,
                        next = rx.recv() => match next {
                            Some(snapshot) => {
                                latest = snapshot;
                                coalesced += 1;
                            }
                            None => break,
                        },
                    }
                }

                debug!(revision = latest.revision, coalesced, "Forwarding parameters");
                forwarded_clone.fetch_add(1, Ordering::Relaxed);
                sink(latest);
            }
        });

        Self { tx, task, forwarded }
    }

    /// Hand a new snapshot to the debouncer; never blocks
    pub fn submit(&self, snapshot: ParameterSnapshot) {
        let _ = self.tx.send(snapshot);
    }

    /// Snapshots forwarded to the sink so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
