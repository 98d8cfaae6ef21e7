use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use super::{Admission, Mailbox, MailboxHandler, MailboxQueue, MailboxSettings, WorkerPool};
use crate::reaper::Reapable;

/// Lazily created mailboxes of one kind, keyed by routing key.
///
/// Messages are pushed while the map entry is held, and reaping removes a
/// mailbox only if it is still inactive under the same entry lock. A message
/// can therefore never land in a mailbox that was just dropped.
pub struct MailboxRegistry<Q: MailboxQueue> {
    kind: &'static str,
    mailboxes: DashMap<String, Arc<Mailbox<Q>>>,
    handler: Arc<dyn MailboxHandler<Q::Message>>,
    pool: WorkerPool,
    settings: MailboxSettings,
    idle_timeout: Duration,
}

impl<Q: MailboxQueue> MailboxRegistry<Q> {
    pub fn new(
        kind: &'static str,
        handler: Arc<dyn MailboxHandler<Q::Message>>,
        pool: WorkerPool,
        settings: MailboxSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            mailboxes: DashMap::new(),
            handler,
            pool,
            settings,
            idle_timeout,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Push into the mailbox for `key`, creating it with `init` if needed.
    pub fn enqueue(&self, key: &str, message: Q::Message, init: impl FnOnce() -> Q) -> Admission<Q::Message> {
        let mailbox = self.mailboxes.entry(key.to_string()).or_insert_with(|| {
            debug!(kind = self.kind, mailbox = key, "mailbox created");
            Mailbox::new(key, init(), self.handler.clone(), self.pool.clone(), self.settings)
        });
        mailbox.enqueue(message)
    }

    /// [`enqueue`](Self::enqueue), plus a settle signal subscribed before the
    /// push. A rejected sender can wait on it for the pending batch to clear.
    pub fn enqueue_watched(
        &self,
        key: &str,
        message: Q::Message,
        init: impl FnOnce() -> Q,
    ) -> (Admission<Q::Message>, watch::Receiver<u64>) {
        let mailbox = self.mailboxes.entry(key.to_string()).or_insert_with(|| {
            debug!(kind = self.kind, mailbox = key, "mailbox created");
            Mailbox::new(key, init(), self.handler.clone(), self.pool.clone(), self.settings)
        });
        let settled = mailbox.settled();
        (mailbox.enqueue(message), settled)
    }

    /// Push into an existing mailbox; hands the message back if there is none.
    pub fn try_enqueue(&self, key: &str, message: Q::Message) -> Result<Admission<Q::Message>, Q::Message> {
        match self.mailboxes.get(key) {
            Some(mailbox) => Ok(mailbox.enqueue(message)),
            None => Err(message),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Mailbox<Q>>> {
        self.mailboxes.get(key).map(|m| m.value().clone())
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Drop every mailbox idle for at least `timeout`.
    pub fn remove_inactive(&self, timeout: Duration) -> usize {
        let candidates: Vec<String> = self
            .mailboxes
            .iter()
            .filter(|entry| entry.value().is_inactive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.mailboxes
                    .remove_if(key, |_, mailbox| mailbox.is_inactive(timeout))
                    .is_some()
            })
            .inspect(|key| debug!(kind = self.kind, mailbox = %key, "inactive mailbox removed"))
            .count()
    }
}

impl<Q: MailboxQueue> Reapable for MailboxRegistry<Q> {
    fn name(&self) -> &str {
        self.kind
    }

    fn reap(&self) -> usize {
        self.remove_inactive(self.idle_timeout)
    }
}
