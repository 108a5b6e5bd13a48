//! Background execution of cascading merges.
//!
//! A single worker thread owned by the engine pulls cascade jobs from a
//! capacity-1 channel. The write path raises the merge flag before
//! enqueueing, so writers that reach the merge engine while a cascade is in
//! flight spin-yield until the worker clears the flag. Dropping the sender
//! ends the loop; the engine joins the worker at shutdown, which guarantees
//! the flag reads idle before tier state is torn down.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::config::MergeStrategy;
use crate::error::Result;

use super::merge;
use super::state::{LsmState, MergeFlagGuard};

/// A cascade request: how many records exceed the first tier's capacity.
struct CascadeJob {
    surplus: u64,
}

/// The engine-owned merge worker.
pub struct MergeWorker {
    tx: Option<Sender<CascadeJob>>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Spawns the worker thread. It runs until the engine drops the sender.
    pub fn spawn(state: Arc<LsmState>, strategy: MergeStrategy) -> Result<Self> {
        let (tx, rx) = bounded::<CascadeJob>(1);
        let handle = std::thread::Builder::new()
            .name("tierdb-merge".to_string())
            .spawn(move || {
                for job in rx {
                    let _clear = MergeFlagGuard::new(&state);
                    let _serialize = state
                        .merge_mutex
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err(e) = merge::cascade(&state.tiers, strategy, job.surplus) {
                        tracing::error!(error = %e, surplus = job.surplus, "background cascade failed");
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Enqueues a cascade. The caller has already raised the merge flag and
    /// waited for any prior cascade, so the slot is free.
    pub fn submit(&self, surplus: u64) {
        if let Some(tx) = &self.tx {
            if tx.send(CascadeJob { surplus }).is_err() {
                tracing::warn!("merge worker is gone; cascade dropped");
            }
        }
    }

    /// Hangs up the job channel and waits for the worker to finish its last
    /// cascade.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("merge worker panicked");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
