//! Runtime configuration.
//!
//! Every knob has a default; a TOML document only needs the keys it changes.
//! Durations use humantime notation (`"250ms"`, `"5s"`, `"10m"`).

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent mailbox runs per mailbox kind (commands, commits, deliveries).
    pub worker_pool_size: usize,
    /// Max commands one command run executes and pipelines before it waits
    /// for their commits.
    pub command_batch_size: usize,
    /// Max event streams persisted per committing run.
    pub commit_batch_size: usize,
    /// Max streams delivered per event-processing run.
    pub event_batch_size: usize,
    /// How often a conflicting command is re-executed before it fails.
    pub max_conflict_retries: u32,
    /// In-context attempts before an I/O action moves to the background queue.
    pub io_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub io_retry_delay: Duration,
    /// Tick of the background retry loop.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Pause after a mailbox run failed before it is rescheduled.
    #[serde(with = "humantime_serde")]
    pub run_error_pause: Duration,
    /// Idle time after which an empty mailbox is reaped.
    #[serde(with = "humantime_serde")]
    pub mailbox_timeout: Duration,
    /// Idle time after which a cached aggregate is evicted.
    #[serde(with = "humantime_serde")]
    pub aggregate_cache_timeout: Duration,
    /// Tick of the reaper.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// Default caller-side deadline for a command.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Take a snapshot every N versions (0 disables snapshots).
    pub snapshot_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            command_batch_size: 32,
            commit_batch_size: 100,
            event_batch_size: 32,
            max_conflict_retries: 3,
            io_retry_attempts: 3,
            io_retry_delay: Duration::from_millis(50),
            retry_interval: Duration::from_secs(1),
            run_error_pause: Duration::from_millis(100),
            mailbox_timeout: Duration::from_secs(3600),
            aggregate_cache_timeout: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            snapshot_interval: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    pub fn with_command_batch_size(mut self, size: usize) -> Self {
        self.command_batch_size = size.max(1);
        self
    }

    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size.max(1);
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_io_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.io_retry_attempts = attempts.max(1);
        self.io_retry_delay = delay;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_mailbox_timeout(mut self, timeout: Duration) -> Self {
        self.mailbox_timeout = timeout;
        self
    }

    pub fn with_aggregate_cache_timeout(mut self, timeout: Duration) -> Self {
        self.aggregate_cache_timeout = timeout;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, every: u64) -> Self {
        self.snapshot_interval = every;
        self
    }
}
