//! Retry protocol for I/O steps.
//!
//! Two modes:
//! - **bounded** ([`RetryService::execute_with_retry`]): a few in-context
//!   attempts with a fixed delay, each failure logged, then give up.
//! - **until success** ([`RetryService::execute_until_success`]): bounded
//!   first; if the last failure is still transient the action moves to a
//!   shared queue that a background loop drains every `retry_interval`. The
//!   caller awaits the outcome. Used for persistence and publication steps
//!   whose effect must not be lost.
//!
//! Only [`EngineError::TransientIo`] is retried; everything else fails fast.
//! Once the background loop has stopped nothing drains the queue any more:
//! queued jobs are dropped and new hand-overs fail with `TransientIo`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

struct RetryJob {
    name: String,
    tries: u64,
    /// Resolves to `true` once the job is finished (either way).
    attempt: Box<dyn FnMut() -> BoxFuture<'static, bool> + Send>,
}

pub struct RetryService {
    attempts: u32,
    delay: Duration,
    interval: Duration,
    queue: Mutex<VecDeque<RetryJob>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryService")
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .field("interval", &self.interval)
            .field("pending", &self.pending())
            .finish()
    }
}

impl RetryService {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            attempts: config.io_retry_attempts.max(1),
            delay: config.io_retry_delay,
            interval: config.retry_interval,
            queue: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Run `action` up to `io_retry_attempts` times.
    pub async fn execute_with_retry<T, E, F, Fut>(&self, name: &str, mut action: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        EngineError: From<E>,
    {
        self.bounded(name, &mut action).await
    }

    /// Run `action` until it succeeds or fails with a non-transient error.
    ///
    /// Requires the background loop ([`RetryService::spawn`]) once the
    /// bounded attempts are exhausted; after the loop stopped the last
    /// transient error is returned instead.
    pub async fn execute_until_success<T, E, F, Fut>(&self, name: &str, mut action: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        EngineError: From<E>,
    {
        match self.bounded(name, &mut action).await {
            Err(err) if err.is_transient() => {}
            other => return other,
        }

        let (tx, rx) = oneshot::channel::<Result<T, EngineError>>();
        let reply = Arc::new(Mutex::new(Some(tx)));
        let attempt = move || {
            let pending = action();
            let reply = reply.clone();
            async move {
                let outcome = match pending.await.map_err(EngineError::from) {
                    Err(err) if err.is_transient() => return false,
                    outcome => outcome,
                };
                if let Some(tx) = reply.lock().take() {
                    let _ = tx.send(outcome);
                }
                true
            }
            .boxed()
        };

        {
            let mut queue = self.queue.lock();
            if self.stopped.load(Ordering::SeqCst) {
                warn!(action = name, "background retry loop stopped, giving up");
                return Err(EngineError::TransientIo(format!(
                    "'{name}' failed and the background retry loop has stopped"
                )));
            }
            queue.push_back(RetryJob {
                name: name.to_string(),
                tries: 0,
                attempt: Box::new(attempt),
            });
        }
        info!(action = name, "moved to background retry queue");

        rx.await
            .unwrap_or_else(|_| Err(EngineError::TransientIo(format!("retry of '{name}' abandoned"))))
    }

    /// Jobs waiting in the background queue.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// One pass over the background queue. Returns how many jobs finished.
    pub async fn drain_once(&self) -> usize {
        let jobs: Vec<RetryJob> = self.queue.lock().drain(..).collect();
        let mut finished = 0;
        let mut requeue = Vec::new();

        for mut job in jobs {
            if (job.attempt)().await {
                debug!(action = %job.name, tries = job.tries + 1, "background retry finished");
                finished += 1;
            } else {
                job.tries += 1;
                warn!(action = %job.name, tries = job.tries, "background retry failed, requeued");
                requeue.push(job);
            }
        }

        // Keep the failed jobs ahead of the ones queued meanwhile.
        let mut queue = self.queue.lock();
        for job in requeue.into_iter().rev() {
            queue.push_front(job);
        }
        finished
    }

    /// Start the background drain loop; it stops when `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.drain_once().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            let abandoned = {
                let mut queue = service.queue.lock();
                service.stopped.store(true, Ordering::SeqCst);
                queue.drain(..).count()
            };
            if abandoned > 0 {
                warn!(abandoned, "retry loop stopped with jobs still queued");
            }
            debug!("retry loop stopped");
        })
    }

    async fn bounded<T, E, F, Fut>(&self, name: &str, action: &mut F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        EngineError: From<E>,
    {
        let mut attempt = 1;
        loop {
            match action().await.map_err(EngineError::from) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(action = name, attempt, error = %err, "transient failure, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(action = name, attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
