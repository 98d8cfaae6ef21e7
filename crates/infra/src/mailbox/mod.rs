//! Per-key mailboxes: ordered queue + single-runner guarantee.
//!
//! A mailbox owns a queue policy ([`MailboxQueue`]) and a handler. Enqueueing
//! never blocks: it admits the message and, when no run is active, spawns
//! one on the mailbox's [`WorkerPool`]. A run drains one bounded batch, hands
//! it to the handler together with its [`Worker`], settles the batch receipt
//! and then either goes idle or reschedules itself when more work is ready.
//! Handlers await I/O through [`Worker::suspend`] so the slot serves other
//! mailboxes meanwhile; the mailbox itself stays locked until the run ends.
//!
//! Handler errors and panics are caught at the run boundary, logged, and
//! followed by a pause before the next run. A failing handler never wedges
//! the mailbox.

mod pool;
mod queue;
mod registry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::error::EngineError;

pub use pool::{Worker, WorkerPool};
pub use queue::{Admission, DedupQueue, Deduplicated, FifoQueue, MailboxQueue, OrderedQueue, Versioned};
pub use registry::MailboxRegistry;

/// Processes one batch taken from a mailbox.
#[async_trait]
pub trait MailboxHandler<M>: Send + Sync + 'static {
    async fn handle(&self, key: &str, batch: Vec<M>, worker: &mut Worker) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct MailboxSettings {
    /// Max messages per run.
    pub batch_size: usize,
    /// Pause after a failed run.
    pub run_error_pause: Duration,
}

pub struct Mailbox<Q: MailboxQueue> {
    key: String,
    queue: Mutex<Q>,
    running: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
    last_active: Mutex<Instant>,
    /// Bumped after every settled batch.
    settled: watch::Sender<u64>,
    handler: Arc<dyn MailboxHandler<Q::Message>>,
    pool: WorkerPool,
    settings: MailboxSettings,
}

impl<Q: MailboxQueue> std::fmt::Debug for Mailbox<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("key", &self.key)
            .field("running", &self.is_running())
            .field("pool", &self.pool.name())
            .finish()
    }
}

impl<Q: MailboxQueue> Mailbox<Q> {
    pub fn new(
        key: impl Into<String>,
        queue: Q,
        handler: Arc<dyn MailboxHandler<Q::Message>>,
        pool: WorkerPool,
        settings: MailboxSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            queue: Mutex::new(queue),
            running: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            last_active: Mutex::new(Instant::now()),
            settled: watch::channel(0).0,
            handler,
            pool,
            settings: MailboxSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admit `message`; schedules a run when it became ready.
    pub fn enqueue(self: &Arc<Self>, message: Q::Message) -> Admission<Q::Message> {
        let admission = self.queue.lock().push(message);
        self.touch();
        if matches!(admission, Admission::Queued) {
            self.try_schedule();
        }
        admission
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Not running, holding nothing, and untouched for at least `timeout`.
    pub fn is_inactive(&self, timeout: Duration) -> bool {
        !self.is_running() && self.queue.lock().is_empty() && self.last_active.lock().elapsed() >= timeout
    }

    /// Read the queue state (e.g. an ordered mailbox's handled version).
    pub fn inspect<R>(&self, f: impl FnOnce(&Q) -> R) -> R {
        f(&self.queue.lock())
    }

    /// Changes once the batch running now (or the next one) is settled.
    pub fn settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn try_schedule(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(self.clone().run());
        }
    }

    async fn run(self: Arc<Self>) {
        let Some(mut worker) = self.pool.worker().await else {
            warn!(mailbox = %self.key, pool = self.pool.name(), "worker pool closed, run dropped");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let failed = {
            let _exclusive = self.run_lock.lock().await;
            let (batch, receipt) = self.queue.lock().take_batch(self.settings.batch_size);
            let failed = !batch.is_empty() && self.dispatch(batch, &mut worker).await;
            self.queue.lock().settle(receipt);
            self.settled.send_modify(|n| *n += 1);
            failed
        };
        self.touch();
        drop(worker);

        if failed {
            tokio::time::sleep(self.settings.run_error_pause).await;
        }

        self.running.store(false, Ordering::SeqCst);
        // An enqueue that lost the race against `running` relies on this check.
        if self.queue.lock().has_ready() {
            self.try_schedule();
        }
    }

    /// Returns `true` when the run failed.
    async fn dispatch(&self, batch: Vec<Q::Message>, worker: &mut Worker) -> bool {
        let size = batch.len();
        match AssertUnwindSafe(self.handler.handle(&self.key, batch, worker))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                error!(mailbox = %self.key, pool = self.pool.name(), batch = size, error = %err, "mailbox run failed");
                true
            }
            Err(panic) => {
                error!(
                    mailbox = %self.key,
                    pool = self.pool.name(),
                    batch = size,
                    panic = panic_message(panic.as_ref()),
                    "mailbox run panicked"
                );
                true
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
