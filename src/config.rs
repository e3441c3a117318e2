use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{Queue, Result};

/// Settings for a [Queue] instance.
///
/// Everything except the database path has a default; the intervals govern the
/// cadence of the background maintenance, monitoring, and cron loops.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Path to the database file shared by all cooperating processes.
    pub path: PathBuf,
    /// Create the database file (and parent directory) when missing. Without this,
    /// opening a missing file is an error.
    pub auto_create: bool,
    /// Size of the read connection pool.
    pub pool_size: usize,
    /// Age at which terminal jobs become archival candidates. Also the window that
    /// must be at least one minute for cron firing to be enabled.
    pub archive_interval: Duration,
    /// Archival age for failed jobs.
    pub archive_failed_interval: Duration,
    /// How long archive rows are kept before being dropped.
    pub delete_after: Duration,
    /// Cadence of the expire/archive/drop maintenance pass.
    pub maintenance_interval: Duration,
    /// Cadence of the state-count monitor pass.
    pub monitor_state_interval: Duration,
    /// Cadence of cron evaluation. This is also the cron firing window; keep it at
    /// one minute unless every cooperating instance changes with it.
    pub cron_monitor_interval: Duration,
    /// Cadence of clock-skew re-measurement.
    pub clock_monitor_interval: Duration,
    /// Default polling period for workers that don't specify their own.
    pub polling_interval: Duration,
    /// How long [Queue::stop] waits for in-flight batches to drain.
    pub shutdown_timeout: Duration,
}

impl QueueSettings {
    /// Create settings for the database at `path`, with defaults everywhere else.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            auto_create: false,
            pool_size: 10,
            archive_interval: Duration::from_secs(24 * 60 * 60),
            archive_failed_interval: Duration::from_secs(24 * 60 * 60),
            delete_after: Duration::from_secs(24 * 60 * 60),
            maintenance_interval: Duration::from_secs(300),
            monitor_state_interval: Duration::from_secs(60),
            cron_monitor_interval: Duration::from_secs(60),
            clock_monitor_interval: Duration::from_secs(60),
            polling_interval: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Create the database file when it does not exist.
    pub fn auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    /// Set the read pool size.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        assert!(pool_size > 0, "pool size must be at least 1");
        self.pool_size = pool_size;
        self
    }

    /// Set the archival age for completed and cancelled jobs.
    pub fn archive_interval(mut self, archive_interval: Duration) -> Self {
        self.archive_interval = archive_interval;
        self
    }

    /// Set the archival age for failed jobs.
    pub fn archive_failed_interval(mut self, archive_failed_interval: Duration) -> Self {
        self.archive_failed_interval = archive_failed_interval;
        self
    }

    /// Set the archive row time-to-live.
    pub fn delete_after(mut self, delete_after: Duration) -> Self {
        self.delete_after = delete_after;
        self
    }

    /// Set the maintenance cadence.
    pub fn maintenance_interval(mut self, maintenance_interval: Duration) -> Self {
        self.maintenance_interval = maintenance_interval;
        self
    }

    /// Set the state-count monitor cadence.
    pub fn monitor_state_interval(mut self, monitor_state_interval: Duration) -> Self {
        self.monitor_state_interval = monitor_state_interval;
        self
    }

    /// Set the cron evaluation cadence and firing window.
    pub fn cron_monitor_interval(mut self, cron_monitor_interval: Duration) -> Self {
        self.cron_monitor_interval = cron_monitor_interval;
        self
    }

    /// Set the clock-skew re-measurement cadence.
    pub fn clock_monitor_interval(mut self, clock_monitor_interval: Duration) -> Self {
        self.clock_monitor_interval = clock_monitor_interval;
        self
    }

    /// Set the default worker polling period.
    pub fn polling_interval(mut self, polling_interval: Duration) -> Self {
        self.polling_interval = polling_interval;
        self
    }

    /// Set the graceful-shutdown drain timeout.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Build a [Queue] from these settings.
    pub async fn build(self) -> Result<Queue> {
        Queue::with_settings(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = QueueSettings::new("queue.db");
        assert_eq!(settings.pool_size, 10);
        assert_eq!(settings.archive_interval, Duration::from_secs(86_400));
        assert_eq!(settings.maintenance_interval, Duration::from_secs(300));
        assert_eq!(settings.monitor_state_interval, Duration::from_secs(60));
        assert_eq!(settings.cron_monitor_interval, Duration::from_secs(60));
        assert_eq!(settings.polling_interval, Duration::from_secs(2));
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(30));
        assert!(!settings.auto_create);
    }
}
