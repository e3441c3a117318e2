//! Typed event bus.
//!
//! Every notable thing the queue does is published as a [QueueEvent] on a broadcast
//! channel. Subscribers come and go freely; publishing to zero subscribers is not an
//! error. Validation failures are returned to the caller and never published here.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::worker_list::WorkerSnapshot;

/// Row counts reported by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceCounts {
    /// Active jobs failed because they outlived their expiration.
    pub expired: u64,
    /// Job rows copied into the archive.
    pub archived: u64,
    /// Archive rows dropped after their retention elapsed.
    pub dropped: u64,
}

/// The number of jobs in one state of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStateCount {
    /// The queue name.
    pub queue: String,
    /// The job state being counted.
    pub state: crate::JobState,
    /// How many jobs are in that state.
    pub count: u64,
}

/// A point-in-time census of the job table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateCounts {
    /// Counts per queue and state.
    pub queues: Vec<QueueStateCount>,
    /// Counts per state across all queues.
    pub states: Vec<(crate::JobState, u64)>,
    /// Total number of job rows.
    pub total: u64,
}

/// Events published on the queue's broadcast bus.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A storage or background-loop error. The originating operation also returns
    /// the error to its caller where one exists.
    Error(String),
    /// Snapshot of all registered pollers and their in-progress work.
    Wip(Vec<WorkerSnapshot>),
    /// Jobs were inserted into a queue.
    Insert {
        /// The target queue.
        queue: String,
        /// How many rows were inserted.
        count: usize,
    },
    /// A poller claimed a batch and handed it to its callback.
    Work {
        /// The source queue.
        queue: String,
        /// The batch size.
        count: usize,
    },
    /// One job was delivered to a worker callback.
    Job {
        /// The source queue.
        queue: String,
        /// The delivered job's id.
        id: uuid::Uuid,
    },
    /// Shutdown was requested; workers are draining.
    Stop,
    /// A maintenance pass finished.
    Maintenance(MaintenanceCounts),
    /// A monitor pass counted job states.
    MonitorStates(StateCounts),
    /// A cron schedule fired.
    Schedule {
        /// The queue the schedule sent to.
        name: String,
        /// The firing cron expression.
        cron: String,
        /// The schedule's timezone.
        timezone: String,
    },
    /// The gap between database time and local time crossed the warning threshold.
    ClockSkew {
        /// Database time minus local time.
        seconds: i64,
    },
    /// The queue finished shutting down.
    Stopped,
}

pub(crate) struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: QueueEvent) {
        self.tx.send(event).ok();
    }

    pub fn error(&self, error: impl std::fmt::Display) {
        self.emit(QueueEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(QueueEvent::Stopped);
    }

    #[tokio::test]
    async fn subscribers_see_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Insert {
            queue: "q".to_string(),
            count: 3,
        });

        match rx.recv().await.unwrap() {
            QueueEvent::Insert { queue, count } => {
                assert_eq!(queue, "q");
                assert_eq!(count, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
