//! Bounded worker pool for mailbox runs.
//!
//! A pool is a tokio [`Semaphore`]: a mailbox run claims one [`Worker`] slot
//! before it touches its queue. The slot is handed back while the run awaits
//! I/O ([`Worker::suspend`]), so a slow store or publisher only holds up the
//! aggregate waiting on it. Each mailbox kind gets its own pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for a free slot; `None` once the pool is closed.
    pub async fn worker(&self) -> Option<Worker> {
        let permit = self.acquire().await?;
        Some(Worker {
            pool: self.clone(),
            permit: Some(permit),
        })
    }

    /// Refuse new runs; runs already holding a slot finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

/// The slot one mailbox run executes on.
#[derive(Debug)]
pub struct Worker {
    pool: WorkerPool,
    permit: Option<OwnedSemaphorePermit>,
}

impl Worker {
    pub fn pool_name(&self) -> &'static str {
        self.pool.name
    }

    /// Await `io` with the slot released, then claim a slot again.
    ///
    /// A closed pool hands out no new slot; the run finishes without one.
    pub async fn suspend<F: Future>(&mut self, io: F) -> F::Output {
        self.permit = None;
        let output = io.await;
        self.permit = self.pool.acquire().await;
        output
    }
}
