//! The polling worker runtime.
//!
//! A worker is an independently scheduled polling loop over one queue: claim a
//! batch, hand it to the user callback, record the outcome, sleep until the
//! next tick. The inter-tick sleep is abortable, woken early by a producer
//! hint ([crate::Queue::notify]) or by [WorkerHandle::stop]. In-flight batches
//! are never preempted; stopping waits for the current iteration to finish.

use std::{fmt::Debug, fmt::Display, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{Future, FutureExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::{
    job::Job,
    shared_state::SharedState,
    validation,
    worker_list::{PollingWorker, WorkerSnapshot, WorkerState},
    events::QueueEvent,
    Queue, Result,
};

/// Sleeps shorter than this are skipped; the loop just polls again.
const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Options for [Queue::work].
#[derive(Debug, Clone, Copy)]
pub struct WorkOptions {
    /// How many jobs to claim per polling tick.
    pub batch_size: u32,
    /// Order claims by priority before insertion order.
    pub priority: bool,
    /// Polling period. Defaults to the queue-wide polling interval.
    pub interval: Option<Duration>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            priority: true,
            interval: None,
        }
    }
}

impl WorkOptions {
    /// Options with a batch size of 1 and priority ordering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the claim batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable or disable priority ordering.
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Set the polling period.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Handle to a running polling worker.
pub struct WorkerHandle {
    worker: Arc<PollingWorker>,
    state_rx: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// The worker's instance-local id.
    pub fn id(&self) -> Uuid {
        self.worker.id
    }

    /// The queue this worker polls.
    pub fn queue(&self) -> &str {
        self.worker.queue.as_str()
    }

    /// The worker's current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.worker.state.borrow()
    }

    /// A point-in-time view of the worker.
    pub fn snapshot(&self) -> WorkerSnapshot {
        self.worker.snapshot()
    }

    /// Ask the worker to stop after its current iteration. Does not wait; use
    /// [WorkerHandle::stopped] for that.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Wait until the polling loop has exited.
    pub async fn stopped(&mut self) {
        while *self.state_rx.borrow_and_update() != WorkerState::Stopped {
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Queue {
    /// Start a polling worker on a queue. Each tick claims up to
    /// `options.batch_size` jobs and passes them to `handler`; an `Ok` return
    /// completes the whole batch with the serialized output, an `Err` (or a
    /// panic, or exceeding the batch's largest expiration) fails it, consuming
    /// a retry on each job.
    pub async fn work<F, Fut, T, E>(
        &self,
        queue: &str,
        options: WorkOptions,
        handler: F,
    ) -> Result<WorkerHandle>
    where
        F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + Debug + 'static,
        E: Display + Send + 'static,
    {
        validation::require_queue_name(queue)?;
        let batch_size = options.batch_size.max(1);

        let mut pollers = self.state.pollers.write().await;
        let worker = pollers.add_worker(queue);
        drop(pollers);

        let state_rx = worker.state.subscribe();
        let handle = WorkerHandle {
            worker: worker.clone(),
            state_rx,
        };

        event!(Level::INFO, queue, worker_id = %worker.id, batch_size, "Starting worker");

        let state = self.state.clone();
        tokio::spawn(run_worker_loop(
            state,
            worker,
            batch_size,
            options.priority,
            options.interval,
            handler,
        ));

        Ok(handle)
    }
}

#[instrument(parent = None, name = "worker_loop", skip_all, fields(worker_id = %worker.id, queue = %worker.queue))]
async fn run_worker_loop<F, Fut, T, E>(
    state: SharedState,
    worker: Arc<PollingWorker>,
    batch_size: u32,
    priority: bool,
    interval: Option<Duration>,
    handler: F,
) where
    F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + Debug + 'static,
    E: Display + Send + 'static,
{
    let interval = interval.unwrap_or(state.settings.polling_interval);
    let mut global_close_rx = state.close.clone();

    worker.state.send_replace(WorkerState::Active);
    let mut state_rx = worker.state.subscribe();

    loop {
        if *worker.state.borrow() != WorkerState::Active {
            break;
        }

        let tick_started = tokio::time::Instant::now();

        if let Err(e) = run_one_batch(&state, &worker, batch_size, priority, &handler).await {
            {
                let mut status = worker.status.lock().unwrap_or_else(|e| e.into_inner());
                status.last_error = Some(e.to_string());
                status.last_error_on = Some(state.time.now());
            }
            state.events.error(&e);
            event!(Level::ERROR, %e, "Worker iteration failed");
        }

        if *worker.state.borrow() != WorkerState::Active {
            break;
        }

        let remaining = interval.saturating_sub(tick_started.elapsed());
        if remaining > MIN_SLEEP {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = worker.notify.notified() => {
                    event!(Level::TRACE, "Woken by notify");
                }
                _ = state_rx.changed() => {}
                _ = global_close_rx.changed() => {
                    worker.stop();
                }
            }
        }
    }

    worker.state.send_replace(WorkerState::Stopped);
    let mut pollers = state.pollers.write().await;
    pollers.remove_worker(worker.id);
    event!(Level::INFO, "Worker stopped");
}

async fn run_one_batch<F, Fut, T, E>(
    state: &SharedState,
    worker: &PollingWorker,
    batch_size: u32,
    priority: bool,
    handler: &F,
) -> Result<()>
where
    F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + Debug + 'static,
    E: Display + Send + 'static,
{
    let jobs = state
        .fetch_jobs(worker.queue.as_str(), batch_size, priority)
        .await?;

    if jobs.is_empty() {
        return Ok(());
    }

    {
        let mut status = worker.status.lock().unwrap_or_else(|e| e.into_inner());
        status.last_job_started_on = Some(state.time.now());
    }

    state.events.emit(QueueEvent::Work {
        queue: worker.queue.to_string(),
        count: jobs.len(),
    });
    for job in &jobs {
        state.events.emit(QueueEvent::Job {
            queue: worker.queue.to_string(),
            id: job.id,
        });
    }
    {
        let pollers = state.pollers.read().await;
        state.events.emit(QueueEvent::Wip(pollers.snapshots()));
    }

    let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();

    // The whole batch shares one clock: the largest expiration among its jobs.
    // A callback that outlives it fails every job in the batch.
    let batch_timeout = jobs
        .iter()
        .map(|job| job.expire_in)
        .max()
        .unwrap_or(Duration::from_secs(900));

    let result = tokio::time::timeout(
        batch_timeout,
        AssertUnwindSafe(handler(jobs)).catch_unwind(),
    )
    .await;

    match result {
        Err(_) => {
            event!(Level::WARN, "Batch handler timed out");
            state
                .fail_jobs(
                    &ids,
                    Some(json!({ "message": "batch handler timed out" })),
                )
                .await?;
        }
        Ok(Err(panic)) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Panic".to_string()
            };
            event!(Level::ERROR, %msg, "Batch handler panicked");
            state
                .fail_jobs(&ids, Some(json!({ "message": msg })))
                .await?;
        }
        Ok(Ok(Ok(output))) => {
            let output = serde_json::to_value(&output)
                .map_err(crate::Error::Payload)?;
            let output = (!output.is_null()).then_some(output);
            state.complete_jobs(&ids, output).await?;
        }
        Ok(Ok(Err(e))) => {
            state
                .fail_jobs(&ids, Some(json!({ "message": e.to_string() })))
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        test_util::{wait_for, wait_for_job_state, TestEnvironment},
        JobState, NewJob, QueueOptions,
    };

    #[tokio::test]
    async fn worker_completes_batches() {
        let test = TestEnvironment::new().await;
        test.make_queue("batched").await;

        let first = test
            .queue
            .send("batched", json!({"n": 1}))
            .await
            .unwrap()
            .unwrap();
        let second = test
            .queue
            .send("batched", json!({"n": 2}))
            .await
            .unwrap()
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        let mut worker = test
            .queue
            .work(
                "batched",
                WorkOptions::new()
                    .batch_size(10)
                    .interval(Duration::from_millis(100)),
                move |jobs| {
                    let seen = handler_seen.clone();
                    async move {
                        seen.lock().unwrap().extend(jobs.iter().map(|j| j.id));
                        Ok::<_, String>(json!({"done": true}))
                    }
                },
            )
            .await
            .unwrap();

        let done = wait_for_job_state("first job", &test.queue, "batched", first, JobState::Completed).await;
        assert_eq!(done.output, Some(json!({"done": true})));
        wait_for_job_state("second job", &test.queue, "batched", second, JobState::Completed).await;

        let seen = seen.lock().unwrap().clone();
        assert!(seen.contains(&first));
        assert!(seen.contains(&second));

        worker.stop();
        worker.stopped().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn handler_errors_fail_the_batch() {
        let test = TestEnvironment::new().await;
        test.queue
            .create_queue("doomed", QueueOptions::default().retry_limit(0))
            .await
            .unwrap();

        let id = test.queue.send("doomed", json!({})).await.unwrap().unwrap();

        let mut worker = test
            .queue
            .work(
                "doomed",
                WorkOptions::new().interval(Duration::from_millis(100)),
                |_jobs| async move { Err::<(), _>("handler exploded".to_string()) },
            )
            .await
            .unwrap();

        let job =
            wait_for_job_state("job to fail", &test.queue, "doomed", id, JobState::Failed).await;
        assert_eq!(job.output, Some(json!({"message": "handler exploded"})));

        worker.stop();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn failed_batches_consume_retries_and_rerun() {
        let test = TestEnvironment::new().await;
        test.queue
            .create_queue(
                "retryable",
                QueueOptions::default().retry_limit(1).retry_delay(0),
            )
            .await
            .unwrap();

        let id = test
            .queue
            .send("retryable", json!({}))
            .await
            .unwrap()
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let handler_attempts = attempts.clone();
        let mut worker = test
            .queue
            .work(
                "retryable",
                WorkOptions::new().interval(Duration::from_millis(50)),
                move |_jobs| {
                    let attempts = handler_attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("first try fails".to_string())
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await
            .unwrap();

        wait_for_job_state("job to finish", &test.queue, "retryable", id, JobState::Completed)
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        worker.stop();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn notify_wakes_a_sleeping_worker() {
        let test = TestEnvironment::new().await;
        test.make_queue("sleepy").await;

        // A long interval, so only a notification can explain a fast pickup.
        let mut worker = test
            .queue
            .work(
                "sleepy",
                WorkOptions::new().interval(Duration::from_secs(30)),
                |_jobs| async move { Ok::<_, String>(()) },
            )
            .await
            .unwrap();

        // Let the first (empty) poll pass and the worker go to sleep.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let id = test.queue.send("sleepy", json!({})).await.unwrap().unwrap();
        wait_for_job_state("notified pickup", &test.queue, "sleepy", id, JobState::Completed)
            .await;

        worker.stop();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn batch_timeout_fails_jobs() {
        let test = TestEnvironment::new().await;
        test.queue
            .create_queue("glacial", QueueOptions::default().retry_limit(0))
            .await
            .unwrap();

        let id = test
            .queue
            .send_job(
                NewJob::builder("glacial".to_string())
                    .expire_in(Duration::from_secs(1))
                    .build(),
            )
            .await
            .unwrap()
            .unwrap();

        let mut worker = test
            .queue
            .work(
                "glacial",
                WorkOptions::new().interval(Duration::from_millis(100)),
                |_jobs| async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, String>(())
                },
            )
            .await
            .unwrap();

        let job = wait_for_job_state(
            "job to time out",
            &test.queue,
            "glacial",
            id,
            JobState::Failed,
        )
        .await;
        assert_eq!(job.output, Some(json!({"message": "batch handler timed out"})));

        worker.stop();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn stop_drains_in_flight_batches() {
        let test = TestEnvironment::new().await;
        test.make_queue("draining").await;

        let id = test
            .queue
            .send("draining", json!({}))
            .await
            .unwrap()
            .unwrap();

        let _worker = test
            .queue
            .work(
                "draining",
                WorkOptions::new().interval(Duration::from_millis(50)),
                |_jobs| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, String>(())
                },
            )
            .await
            .unwrap();

        wait_for("job to be claimed", || async {
            let job = test
                .queue
                .get_job_by_id("draining", id, false)
                .await
                .unwrap()
                .unwrap();
            if job.state == JobState::Active {
                Ok(())
            } else {
                Err(format!("job state {}", job.state))
            }
        })
        .await;

        // Stop waits for the in-flight batch instead of preempting it.
        test.queue.stop().await.unwrap();

        let job = test
            .queue
            .get_job_by_id("draining", id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
