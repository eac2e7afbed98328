//! Tunables of the dispatchers and of the rebuild tool.

use std::time::Duration;

/// Events read per dispatcher or rebuild batch.
pub const DEFAULT_BATCH_SIZE: u16 = 100;

/// Pause between two polls of an idle dispatcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait before a background dispatcher starts polling.
pub const DEFAULT_START_DELAY: Duration = Duration::ZERO;

/// Rows kept per table in a snapshot taken by `verify`.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// How long a checkpoint lease lasts without being renewed.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    pub batch_size: u16,
    pub poll_interval: Duration,
    pub start_delay: Duration,
    pub sample_size: usize,
    pub lease_ttl: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_delay: DEFAULT_START_DELAY,
            sample_size: DEFAULT_SAMPLE_SIZE,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ProjectionConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values below 1 are raised to 1.
    pub fn batch_size(mut self, size: u16) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.config.start_delay = delay;
        self
    }

    pub fn sample_size(mut self, size: usize) -> Self {
        self.config.sample_size = size;
        self
    }

    /// Must outlast the slowest batch, or another instance may take over
    /// the projector while it is still applying.
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.config.lease_ttl = ttl;
        self
    }

    pub fn build(self) -> ProjectionConfig {
        self.config
    }
}
