use std::sync::{Arc, Mutex};

use ahash::HashMap;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::SmartString;

/// Lifecycle of a polling worker. Only `Active -> Stopping` is externally
/// triggered; `Stopping -> Stopped` happens once the current iteration
/// returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered but not yet polling.
    Created,
    /// Polling and executing batches.
    Active,
    /// Asked to stop; finishing its current iteration.
    Stopping,
    /// The polling loop has exited.
    Stopped,
}

/// A point-in-time view of one poller, as published on the wip event.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// The worker's instance-local id.
    pub id: Uuid,
    /// The queue the worker polls.
    pub queue: String,
    /// Where the worker is in its lifecycle.
    pub state: WorkerState,
    /// When the worker last received a non-empty batch.
    pub last_job_started_on: Option<OffsetDateTime>,
    /// The last polling-iteration error, if any.
    pub last_error: Option<String>,
    /// When the last error happened.
    pub last_error_on: Option<OffsetDateTime>,
}

#[derive(Default)]
pub(crate) struct WorkerStatus {
    pub last_job_started_on: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub last_error_on: Option<OffsetDateTime>,
}

pub(crate) struct PollingWorker {
    pub id: Uuid,
    pub queue: SmartString,
    /// Wakes the poller out of its inter-tick sleep.
    pub notify: Notify,
    pub state: watch::Sender<WorkerState>,
    pub status: Mutex<WorkerStatus>,
}

impl PollingWorker {
    pub fn snapshot(&self) -> WorkerSnapshot {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        WorkerSnapshot {
            id: self.id,
            queue: self.queue.to_string(),
            state: *self.state.borrow(),
            last_job_started_on: status.last_job_started_on,
            last_error: status.last_error.clone(),
            last_error_on: status.last_error_on,
        }
    }

    /// Ask the poller to stop after its current iteration, aborting any
    /// pending sleep. In-flight batches are not preempted.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, WorkerState::Created | WorkerState::Active) {
                *state = WorkerState::Stopping;
                true
            } else {
                false
            }
        });
        self.notify.notify_one();
    }
}

pub(crate) struct Pollers {
    workers: HashMap<Uuid, Arc<PollingWorker>>,
    workers_by_queue: HashMap<SmartString, Vec<Arc<PollingWorker>>>,
    worker_count_tx: watch::Sender<usize>,
}

impl Pollers {
    pub fn new(worker_count_tx: watch::Sender<usize>) -> Self {
        Pollers {
            workers: HashMap::default(),
            workers_by_queue: HashMap::default(),
            worker_count_tx,
        }
    }

    /// Register a new poller for a queue.
    pub(crate) fn add_worker(&mut self, queue: &str) -> Arc<PollingWorker> {
        let (state, _) = watch::channel(WorkerState::Created);
        let worker = Arc::new(PollingWorker {
            id: Uuid::new_v4(),
            queue: SmartString::from(queue),
            notify: Notify::new(),
            state,
            status: Mutex::new(WorkerStatus::default()),
        });

        self.workers_by_queue
            .entry(worker.queue.clone())
            .or_default()
            .push(worker.clone());
        self.workers.insert(worker.id, worker.clone());
        self.worker_count_tx.send_replace(self.workers.len());

        worker
    }

    pub(crate) fn remove_worker(&mut self, worker_id: Uuid) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            return;
        };

        if let Some(queue_workers) = self.workers_by_queue.get_mut(&worker.queue) {
            queue_workers.retain(|w| !Arc::ptr_eq(w, &worker));
        }

        self.worker_count_tx.send_replace(self.workers.len());
    }

    /// Wake every poller watching this queue.
    pub(crate) fn new_job_available(&self, queue: &str) {
        if let Some(workers) = self.workers_by_queue.get(queue) {
            for worker in workers {
                worker.notify.notify_one();
            }
        }
    }

    pub(crate) fn stop_all(&self) {
        for worker in self.workers.values() {
            worker.stop();
        }
    }

    pub(crate) fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(|w| w.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_and_notify() {
        let (count_tx, count_rx) = watch::channel(0);
        let mut pollers = Pollers::new(count_tx);

        let worker = pollers.add_worker("a-queue");
        assert_eq!(*count_rx.borrow(), 1);
        assert_eq!(worker.queue.as_str(), "a-queue");
        assert_eq!(*worker.state.borrow(), WorkerState::Created);

        // Notifying an unknown queue is a no-op.
        pollers.new_job_available("other-queue");
        pollers.new_job_available("a-queue");

        pollers.remove_worker(worker.id);
        assert_eq!(*count_rx.borrow(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let (count_tx, _count_rx) = watch::channel(0);
        let mut pollers = Pollers::new(count_tx);

        let worker = pollers.add_worker("q");
        worker.stop();
        assert_eq!(*worker.state.borrow(), WorkerState::Stopping);
        worker.stop();
        assert_eq!(*worker.state.borrow(), WorkerState::Stopping);

        worker.state.send_replace(WorkerState::Stopped);
        worker.stop();
        assert_eq!(*worker.state.borrow(), WorkerState::Stopped);
    }
}
