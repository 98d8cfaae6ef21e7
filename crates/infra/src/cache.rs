//! Live-aggregate cache.
//!
//! Shared by every mailbox runner of one engine. Entries are only written by
//! the runner that owns the aggregate (mailbox serialization); the map itself
//! is a `DashMap` so runners of different aggregates never contend on a
//! global lock.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use ordinal_core::{Aggregate, AggregateId, AggregateRoot};

use crate::reaper::Reapable;

#[derive(Debug)]
struct CachedAggregate<A: Aggregate> {
    root: AggregateRoot<A>,
    last_used: Instant,
}

#[derive(Debug)]
pub struct MemoryCache<A: Aggregate> {
    entries: DashMap<AggregateId, CachedAggregate<A>>,
    timeout: Duration,
}

impl<A: Aggregate> MemoryCache<A> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// A copy of the cached aggregate.
    pub fn get(&self, id: AggregateId) -> Option<AggregateRoot<A>> {
        self.entries.get_mut(&id).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.root.clone()
        })
    }

    /// Insert or replace with a committed root.
    pub fn update(&self, root: AggregateRoot<A>) {
        self.entries.insert(
            root.id(),
            CachedAggregate {
                root,
                last_used: Instant::now(),
            },
        );
    }

    pub fn evict(&self, id: AggregateId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evict_inactive(&self, timeout: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_used.elapsed() < timeout);
        before.saturating_sub(self.entries.len())
    }
}

impl<A: Aggregate> Reapable for MemoryCache<A> {
    fn name(&self) -> &str {
        "aggregate-cache"
    }

    fn reap(&self) -> usize {
        self.evict_inactive(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Tally(u32);

    impl Aggregate for Tally {
        type Event = u32;
        const AGGREGATE_TYPE: &'static str = "tally";

        fn empty(_id: AggregateId) -> Self {
            Self::default()
        }

        fn apply(&mut self, event: &u32) {
            self.0 += event;
        }
    }

    #[test]
    fn get_returns_a_copy() {
        let cache = MemoryCache::<Tally>::new(Duration::from_secs(60));
        let id = AggregateId::new();
        cache.update(AggregateRoot::restore(id, 3, Tally(5)));

        let mut copy = cache.get(id).unwrap();
        assert_eq!(copy.version(), 3);
        assert_eq!(copy.state().0, 5);

        copy.stage(1);
        assert_eq!(cache.get(id).unwrap().state().0, 5);
    }

    #[test]
    fn idle_entries_are_evicted() {
        let cache = MemoryCache::<Tally>::new(Duration::ZERO);
        cache.update(AggregateRoot::new(AggregateId::new()));
        assert_eq!(cache.reap(), 1);
        assert!(cache.is_empty());

        let keep = MemoryCache::<Tally>::new(Duration::from_secs(60));
        let id = AggregateId::new();
        keep.update(AggregateRoot::new(id));
        assert_eq!(keep.reap(), 0);
        assert!(keep.evict(id));
    }
}
