use ahash::{HashMap, HashSet};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db_writer::{
        log_error,
        send_job::{SendJobArgs, SendJobsArgs},
        DbOperationType,
    },
    events::QueueEvent,
    job::{to_millis, NewJob},
    shared_state::SharedState,
    validation, Queue, Result, SmartString,
};

fn validate_new_job(job: &NewJob) -> Result<()> {
    validation::require_queue_name(&job.queue)?;
    if let Some(key) = job.singleton_key.as_deref() {
        validation::require_singleton_key(key)?;
    }
    if let Some(seconds) = job.singleton_seconds {
        validation::require_singleton_seconds(seconds)?;
    }
    if let Some(retry_limit) = job.retry_limit {
        validation::require_retry_limit(retry_limit)?;
    }
    if let Some(retry_delay) = job.retry_delay {
        validation::require_retry_delay(retry_delay)?;
    }
    if let Some(expire_in) = job.expire_in {
        validation::require_expire_in(expire_in)?;
    }
    if let Some(retain_for) = job.retain_for {
        validation::require_retention(retain_for)?;
    }
    if let Some(dead_letter) = job.dead_letter.as_deref() {
        validation::require_queue_name(dead_letter)?;
    }
    Ok(())
}

impl SharedState {
    /// Tell pollers about a newly claimable job, or hand a future one to the
    /// delayed-job monitor.
    pub(crate) async fn notify_for_queue(&self, now_millis: i64, start_after_millis: i64, queue: &str) {
        if start_after_millis <= now_millis {
            let pollers = self.pollers.read().await;
            pollers.new_job_available(queue);
        } else {
            let mut queue = SmartString::from(queue);
            queue.shrink_to_fit();
            log_error(self.pending_jobs_tx.send((queue, start_after_millis)).await);
        }
    }

    /// Submit a job. Returns `None` when a singleton collision absorbed the row.
    pub(crate) async fn send_job(&self, job: NewJob) -> Result<Option<Uuid>> {
        validate_new_job(&job)?;

        let queue_name = job.queue.to_string();
        let now = self.time.now();
        let now_millis = to_millis(now);
        let start_after = job.start_after.map(to_millis).unwrap_or(now_millis);

        let id = self
            .write_op(|result_tx| {
                DbOperationType::SendJob(SendJobArgs {
                    job,
                    now,
                    result_tx,
                })
            })
            .await?;

        if id.is_some() {
            self.events.emit(QueueEvent::Insert {
                queue: queue_name.clone(),
                count: 1,
            });
            self.notify_for_queue(now_millis, start_after, &queue_name).await;
        }

        Ok(id)
    }

    /// Submit multiple jobs, returning the ids that were actually inserted.
    #[instrument(skip(self, jobs))]
    pub(crate) async fn send_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        for job in &jobs {
            validate_new_job(job)?;
        }

        let mut ready_queues: HashSet<String> = HashSet::default();
        let mut pending_queues: HashMap<String, i64> = HashMap::default();

        let now = self.time.now();
        let now_millis = to_millis(now);
        let mut counts: HashMap<String, usize> = HashMap::default();
        for job in &jobs {
            let start_after = job.start_after.map(to_millis).unwrap_or(now_millis);
            *counts.entry(job.queue.to_string()).or_default() += 1;
            if start_after <= now_millis {
                ready_queues.insert(job.queue.to_string());
            } else {
                pending_queues
                    .entry(job.queue.to_string())
                    .and_modify(|e| *e = std::cmp::min(*e, start_after))
                    .or_insert(start_after);
            }
        }

        let ids = self
            .write_op(|result_tx| {
                DbOperationType::SendJobs(SendJobsArgs {
                    jobs,
                    now,
                    result_tx,
                })
            })
            .await?;

        for (queue, count) in counts {
            self.events.emit(QueueEvent::Insert { queue, count });
        }

        for (queue, start_after) in pending_queues {
            let mut queue = SmartString::from(queue);
            queue.shrink_to_fit();
            log_error(self.pending_jobs_tx.send((queue, start_after)).await);
        }

        if !ready_queues.is_empty() {
            let pollers = self.pollers.read().await;
            for queue in ready_queues {
                pollers.new_job_available(&queue);
            }
        }

        Ok(ids)
    }
}

impl Queue {
    /// Send a job with the queue's default options. Returns the job id, or
    /// `None` when a singleton collision absorbed the row.
    pub async fn send(&self, queue: &str, data: serde_json::Value) -> Result<Option<Uuid>> {
        self.send_job(NewJob::builder(queue.to_string()).data(data).build())
            .await
    }

    /// Send a fully specified job.
    pub async fn send_job(&self, job: NewJob) -> Result<Option<Uuid>> {
        self.state.send_job(job).await
    }

    /// Send at most one job per `seconds`-wide time bucket, keyed by the queue.
    /// Calls landing in an occupied bucket are absorbed and return `None`.
    pub async fn send_debounced(
        &self,
        queue: &str,
        data: serde_json::Value,
        seconds: u32,
    ) -> Result<Option<Uuid>> {
        let job = NewJob::builder(queue.to_string())
            .data(data)
            .singleton_key(format!("debounce_{queue}"))
            .singleton_seconds(seconds)
            .build();
        self.send_job(job).await
    }

    /// Same bucket mechanism as [Queue::send_debounced] with a throttle-derived key.
    pub async fn send_throttled(
        &self,
        queue: &str,
        data: serde_json::Value,
        seconds: u32,
    ) -> Result<Option<Uuid>> {
        let job = NewJob::builder(queue.to_string())
            .data(data)
            .singleton_key(format!("throttle_{queue}"))
            .singleton_seconds(seconds)
            .build();
        self.send_job(job).await
    }

    /// Submit multiple jobs in one write, returning the ids actually inserted
    /// (singleton collisions are absorbed and omitted).
    pub async fn insert(&self, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        self.state.send_jobs(jobs).await
    }

    /// Producer hint: wake every poller watching this queue right away.
    pub async fn notify(&self, queue: &str) -> Result<()> {
        validation::require_queue_name(queue)?;
        let pollers = self.state.pollers.read().await;
        pollers.new_job_available(queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::{test_util::TestEnvironment, Error, NewJob};

    #[tokio::test]
    async fn sending_to_a_missing_queue_fails() {
        let test = TestEnvironment::new().await;
        let result = test.queue.send("nowhere", json!({})).await;
        assert!(matches!(result, Err(Error::QueueNotFound(name)) if name == "nowhere"));
    }

    #[tokio::test]
    async fn malformed_queue_names_are_rejected() {
        let test = TestEnvironment::new().await;
        let result = test.queue.send("not a queue", json!({})).await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn insert_batch() {
        let test = TestEnvironment::new().await;
        test.make_queue("bulk").await;

        let jobs = vec![
            NewJob::builder("bulk".to_string()).data(json!({"n": 1})).build(),
            NewJob::builder("bulk".to_string()).data(json!({"n": 2})).build(),
            NewJob::builder("bulk".to_string())
                .data(json!({"n": 3}))
                .start_after(test.time.now() + Duration::from_secs(60))
                .build(),
        ];

        let ids = test.queue.insert(jobs).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(test.queue.get_queue_size("bulk").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn throttle_absorbs_within_bucket() {
        let test = TestEnvironment::new().await;
        test.make_queue("chatty").await;

        let first = test
            .queue
            .send_throttled("chatty", json!({}), 60)
            .await
            .unwrap();
        let second = test
            .queue
            .send_throttled("chatty", json!({}), 60)
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn debounce_and_throttle_use_separate_keys() {
        let test = TestEnvironment::new().await;
        test.make_queue("mixed").await;

        let debounced = test
            .queue
            .send_debounced("mixed", json!({}), 60)
            .await
            .unwrap();
        let throttled = test
            .queue
            .send_throttled("mixed", json!({}), 60)
            .await
            .unwrap();

        // Different derived keys, so they do not collide with each other.
        assert!(debounced.is_some());
        assert!(throttled.is_some());
    }

    #[tokio::test]
    async fn explicit_ids_are_preserved() {
        let test = TestEnvironment::new().await;
        test.make_queue("fixed").await;

        let id = uuid::Uuid::new_v4();
        let sent = test
            .queue
            .send_job(NewJob::builder("fixed".to_string()).id(id).build())
            .await
            .unwrap();
        assert_eq!(sent, Some(id));

        // Re-sending the same id is absorbed like a singleton conflict.
        let again = test
            .queue
            .send_job(NewJob::builder("fixed".to_string()).id(id).build())
            .await
            .unwrap();
        assert!(again.is_none());
    }
}
