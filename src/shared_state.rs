use std::ops::Deref;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::QueueSettings;
use crate::db_writer::DbOperation;
use crate::events::EventBus;
use crate::job::to_millis;
use crate::pending_jobs::PendingJob;
use crate::worker_list::Pollers;

pub(crate) struct SharedStateData {
    pub db_write_tx: mpsc::Sender<DbOperation>,
    /// Separate pool for read-only calls so they won't block the writes.
    pub read_conn_pool: deadpool_sqlite::Pool,
    pub pollers: tokio::sync::RwLock<Pollers>,
    pub close: tokio::sync::watch::Receiver<()>,
    pub time: Time,
    pub pending_jobs_tx: tokio::sync::mpsc::Sender<PendingJob>,
    pub events: EventBus,
    pub settings: QueueSettings,
    /// Database time minus local time, in milliseconds, as last measured.
    pub clock_skew_millis: AtomicI64,
}

#[derive(Clone)]
pub(crate) struct SharedState(pub Arc<SharedStateData>);

impl Deref for SharedState {
    type Target = Arc<SharedStateData>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SharedStateData {
    /// Current time with the clock-skew correction applied, for decisions that
    /// must agree across instances sharing the database.
    pub fn skewed_now_millis(&self) -> i64 {
        self.time.now_millis()
            + self
                .clock_skew_millis
                .load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub(crate) struct Time {
    start_instant: tokio::time::Instant,
    start_time: time::OffsetDateTime,
}

impl Time {
    pub fn new() -> Self {
        let start_instant = tokio::time::Instant::now();
        let start_time = time::OffsetDateTime::now_utc();

        Time {
            start_instant,
            start_time,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        let now = self.start_instant.elapsed();
        self.start_time + now
    }

    pub fn now_millis(&self) -> i64 {
        to_millis(self.now())
    }

    pub fn instant_for_millis(&self, timestamp_millis: i64) -> Instant {
        let ms = std::cmp::max(timestamp_millis - to_millis(self.start_time), 0) as u64;
        self.start_instant + Duration::from_millis(ms)
    }
}
