//! Periodic cleanup of idle runtime state.
//!
//! Mailboxes, cached aggregates and memoized command results are created on
//! demand and never removed on the hot path. The reaper sweeps them on a
//! fixed interval instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Something holding idle entries that can be dropped.
pub trait Reapable: Send + Sync {
    fn name(&self) -> &str;

    /// Drop idle entries; returns how many were removed.
    fn reap(&self) -> usize;
}

#[derive(Default)]
pub struct InactiveReaper {
    targets: RwLock<Vec<Arc<dyn Reapable>>>,
}

impl InactiveReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: Arc<dyn Reapable>) {
        self.targets.write().push(target);
    }

    /// One pass over every target.
    pub fn sweep(&self) -> usize {
        let targets = self.targets.read().clone();
        targets
            .iter()
            .map(|target| {
                let removed = target.reap();
                if removed > 0 {
                    debug!(reapable = target.name(), removed, "reaped idle entries");
                }
                removed
            })
            .sum()
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?interval, "reaper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reaper.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countdown(AtomicUsize);

    impl Reapable for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        fn reap(&self) -> usize {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|_| 1)
                .unwrap_or(0)
        }
    }

    #[test]
    fn sweep_sums_every_target() {
        let reaper = InactiveReaper::new();
        reaper.register(Arc::new(Countdown(AtomicUsize::new(1))));
        reaper.register(Arc::new(Countdown(AtomicUsize::new(2))));

        assert_eq!(reaper.sweep(), 2);
        assert_eq!(reaper.sweep(), 1);
        assert_eq!(reaper.sweep(), 0);
    }

    #[tokio::test]
    async fn background_loop_stops_on_shutdown() {
        let reaper = Arc::new(InactiveReaper::new());
        let target = Arc::new(Countdown(AtomicUsize::new(3)));
        reaper.register(target.clone());

        let (stop, shutdown) = watch::channel(false);
        let handle = reaper.spawn(Duration::from_millis(1), shutdown);
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(target.0.load(Ordering::SeqCst), 0);
    }
}
