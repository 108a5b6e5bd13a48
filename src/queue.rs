//! Fixed-capacity work queue for fanning client operations out across
//! worker threads.
//!
//! Producers push into a bounded channel sized at `workers × per_worker`
//! slots and block while it is full. Each worker runs the supplied function
//! over items as they arrive. Dropping the queue closes the channel, which
//! lets the workers drain every queued item before they are joined.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::error::Result;
use crate::{errdata, errinput};

/// A bounded multi-producer work queue with a fixed pool of consumers.
pub struct WorkQueue<T: Send + 'static> {
    tx: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Starts `workers` consumer threads sharing `f`, with `per_worker`
    /// queue slots each. Zero counts are rejected.
    pub fn new<F>(workers: usize, per_worker: usize, f: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 {
            return errinput!("worker count must be non-zero");
        }
        if per_worker == 0 {
            return errinput!("per-worker capacity must be non-zero");
        }

        let (tx, rx) = bounded::<T>(workers * per_worker);
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let f = Arc::clone(&f);
            let handle = std::thread::Builder::new()
                .name(format!("tierdb-queue-{i}"))
                .spawn(move || {
                    for item in rx {
                        f(item);
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    /// Enqueues one item, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<()> {
        let Some(tx) = &self.tx else {
            return errdata!("work queue is shut down");
        };
        if tx.send(item).is_err() {
            return errdata!("work queue is shut down");
        }
        Ok(())
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Hang up the channel; workers drain the backlog and exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("work queue consumer panicked");
            }
        }
    }
}
