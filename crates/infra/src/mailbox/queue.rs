//! Queue policies a [`Mailbox`](super::Mailbox) can run on.
//!
//! | policy | admission | used by |
//! |---|---|---|
//! | [`FifoQueue`] | always queued | command mailboxes |
//! | [`DedupQueue`] | one pending message per key | event committing |
//! | [`OrderedQueue`] | strictly increasing versions | event delivery |

use std::collections::{BTreeMap, HashSet, VecDeque};

/// What happened to a pushed message.
#[derive(Debug)]
pub enum Admission<M> {
    /// Ready to be taken by the next run.
    Queued,
    /// Held back until an earlier message arrives.
    Deferred,
    /// Not accepted; the message is handed back to the caller.
    Rejected(M),
}

impl<M> Admission<M> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }
}

pub trait MailboxQueue: Send + 'static {
    type Message: Send + 'static;
    /// Handed back to [`MailboxQueue::settle`] once a batch was processed.
    type Receipt: Send + 'static;

    fn push(&mut self, message: Self::Message) -> Admission<Self::Message>;

    fn take_batch(&mut self, max: usize) -> (Vec<Self::Message>, Self::Receipt);

    fn settle(&mut self, receipt: Self::Receipt);

    /// Whether a run would find work.
    fn has_ready(&self) -> bool;

    /// Whether nothing is held at all (ready or deferred).
    fn is_empty(&self) -> bool;
}

/// Plain first-in first-out.
#[derive(Debug)]
pub struct FifoQueue<M> {
    items: VecDeque<M>,
}

impl<M> Default for FifoQueue<M> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<M> FifoQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Send + 'static> MailboxQueue for FifoQueue<M> {
    type Message = M;
    type Receipt = ();

    fn push(&mut self, message: M) -> Admission<M> {
        self.items.push_back(message);
        Admission::Queued
    }

    fn take_batch(&mut self, max: usize) -> (Vec<M>, ()) {
        let n = max.min(self.items.len());
        (self.items.drain(..n).collect(), ())
    }

    fn settle(&mut self, _receipt: ()) {}

    fn has_ready(&self) -> bool {
        !self.items.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Messages carrying an identity that may be pending at most once.
pub trait Deduplicated {
    fn dedup_key(&self) -> String;
}

/// FIFO that rejects a message whose key is already pending.
///
/// A key stays pending from admission until the batch that took it is
/// settled, so a duplicate submitted while the original is being processed
/// is rejected as well.
#[derive(Debug)]
pub struct DedupQueue<M> {
    items: VecDeque<M>,
    pending: HashSet<String>,
}

impl<M> Default for DedupQueue<M> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            pending: HashSet::new(),
        }
    }
}

impl<M> DedupQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }
}

impl<M: Deduplicated + Send + 'static> MailboxQueue for DedupQueue<M> {
    type Message = M;
    type Receipt = Vec<String>;

    fn push(&mut self, message: M) -> Admission<M> {
        if !self.pending.insert(message.dedup_key()) {
            return Admission::Rejected(message);
        }
        self.items.push_back(message);
        Admission::Queued
    }

    fn take_batch(&mut self, max: usize) -> (Vec<M>, Vec<String>) {
        let n = max.min(self.items.len());
        let batch: Vec<M> = self.items.drain(..n).collect();
        let keys = batch.iter().map(Deduplicated::dedup_key).collect();
        (batch, keys)
    }

    fn settle(&mut self, receipt: Vec<String>) {
        for key in receipt {
            self.pending.remove(&key);
        }
    }

    fn has_ready(&self) -> bool {
        !self.items.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Messages that belong to a gap-free version sequence.
pub trait Versioned {
    fn version(&self) -> u64;
}

/// Releases messages strictly in version order.
///
/// Two counters are kept apart:
/// - `admitted`: highest version released to the ready queue
/// - `handled`: highest version whose batch was settled
///
/// A version at or below `admitted` is stale and rejected. A version beyond
/// `admitted + 1` is parked until the gap closes.
#[derive(Debug)]
pub struct OrderedQueue<M> {
    ready: VecDeque<M>,
    waiting: BTreeMap<u64, M>,
    admitted: u64,
    handled: u64,
}

impl<M> OrderedQueue<M> {
    /// A queue whose next expected version is `handled + 1`.
    pub fn starting_at(handled: u64) -> Self {
        Self {
            ready: VecDeque::new(),
            waiting: BTreeMap::new(),
            admitted: handled,
            handled,
        }
    }

    pub fn latest_handled_version(&self) -> u64 {
        self.handled
    }

    pub fn latest_admitted_version(&self) -> u64 {
        self.admitted
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}

impl<M: Versioned + Send + 'static> MailboxQueue for OrderedQueue<M> {
    type Message = M;
    type Receipt = Option<u64>;

    fn push(&mut self, message: M) -> Admission<M> {
        let version = message.version();
        if version <= self.admitted {
            return Admission::Rejected(message);
        }
        if version > self.admitted + 1 {
            if self.waiting.contains_key(&version) {
                return Admission::Rejected(message);
            }
            self.waiting.insert(version, message);
            return Admission::Deferred;
        }

        self.ready.push_back(message);
        self.admitted = version;
        while let Some(next) = self.waiting.remove(&(self.admitted + 1)) {
            self.ready.push_back(next);
            self.admitted += 1;
        }
        Admission::Queued
    }

    fn take_batch(&mut self, max: usize) -> (Vec<M>, Option<u64>) {
        let n = max.min(self.ready.len());
        let batch: Vec<M> = self.ready.drain(..n).collect();
        let last = batch.last().map(Versioned::version);
        (batch, last)
    }

    fn settle(&mut self, receipt: Option<u64>) {
        if let Some(version) = receipt {
            self.handled = self.handled.max(version);
        }
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }
}
