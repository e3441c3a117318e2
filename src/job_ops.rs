use tracing::instrument;
use uuid::Uuid;

use crate::{
    db_writer::{
        cancel::CancelJobsArgs,
        complete::CompleteJobsArgs,
        delete::DeleteJobsArgs,
        fail::FailJobsArgs,
        fetch::FetchJobsArgs,
        retry::RetryJobsArgs,
        DbOperationType,
    },
    job::Job,
    shared_state::SharedState,
    validation, Error, Queue, Result,
};

/// Options for [Queue::fetch_with_options].
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// How many jobs to claim at most.
    pub batch_size: u32,
    /// Order claims by priority before insertion order. Disabling this turns
    /// the queue strictly first-in-first-out.
    pub priority: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            priority: true,
        }
    }
}

impl FetchOptions {
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
}

fn serialize_output(output: Option<serde_json::Value>) -> Result<Option<String>> {
    output
        .map(|o| serde_json::to_string(&o))
        .transpose()
        .map_err(Error::Payload)
}

impl SharedState {
    pub(crate) async fn fetch_jobs(
        &self,
        queue: &str,
        batch_size: u32,
        order_by_priority: bool,
    ) -> Result<Vec<Job>> {
        self.write_op(|result_tx| {
            DbOperationType::FetchJobs(FetchJobsArgs {
                queue: queue.to_string(),
                batch_size,
                order_by_priority,
                now: self.time.now(),
                result_tx,
            })
        })
        .await
    }

    pub(crate) async fn complete_jobs(
        &self,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let output = serialize_output(output)?;

        self.write_op(|result_tx| {
            DbOperationType::CompleteJobs(CompleteJobsArgs {
                ids: ids.to_vec(),
                output,
                now: self.time.now(),
                result_tx,
            })
        })
        .await
    }

    pub(crate) async fn fail_jobs(
        &self,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let output = serialize_output(output)?;

        let outcome = self
            .write_op(|result_tx| {
                DbOperationType::FailJobs(FailJobsArgs {
                    ids: ids.to_vec(),
                    output,
                    now: self.time.now(),
                    result_tx,
                })
            })
            .await?;

        let now_millis = self.time.now_millis();
        for (queue, start_after) in &outcome.retried {
            self.notify_for_queue(now_millis, *start_after, queue).await;
        }

        Ok(outcome.affected())
    }
}

impl Queue {
    /// Claim one ready job from a queue.
    pub async fn fetch(&self, queue: &str) -> Result<Vec<Job>> {
        self.fetch_with_options(queue, FetchOptions::default()).await
    }

    /// Atomically claim up to a batch of ready jobs: the returned rows moved to
    /// [crate::JobState::Active] in the same transaction that selected them, so
    /// concurrent claimers never see the same row twice. Contention on the
    /// database write lock surfaces as an empty batch, never as an error.
    #[instrument(skip(self))]
    pub async fn fetch_with_options(&self, queue: &str, options: FetchOptions) -> Result<Vec<Job>> {
        validation::require_queue_name(queue)?;
        if options.batch_size == 0 {
            return Err(Error::invalid_argument("batch size", "must be at least 1"));
        }

        self.state
            .fetch_jobs(queue, options.batch_size, options.priority)
            .await
    }

    /// Mark jobs completed, recording the output document. Returns how many
    /// rows actually transitioned.
    #[instrument(skip(self, output))]
    pub async fn complete(&self, ids: &[Uuid], output: Option<serde_json::Value>) -> Result<u64> {
        self.state.complete_jobs(ids, output).await
    }

    /// Fail jobs, recording the error document. Jobs with retries remaining
    /// move back to [crate::JobState::Retry] with their delay applied; the rest
    /// land in [crate::JobState::Failed], with a payload copy routed to the
    /// queue's dead-letter queue when one is configured.
    #[instrument(skip(self, output))]
    pub async fn fail(&self, ids: &[Uuid], output: Option<serde_json::Value>) -> Result<u64> {
        self.state.fail_jobs(ids, output).await
    }

    /// Cancel any non-terminal jobs. Cancelled jobs can be brought back with
    /// [Queue::resume].
    #[instrument(skip(self))]
    pub async fn cancel(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.state
            .write_op(|result_tx| {
                DbOperationType::CancelJobs(CancelJobsArgs {
                    ids: ids.to_vec(),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Move cancelled jobs back to [crate::JobState::Created]. Jobs in any
    /// other state are unaffected.
    #[instrument(skip(self))]
    pub async fn resume(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.state
            .write_op(|result_tx| {
                DbOperationType::ResumeJobs(CancelJobsArgs {
                    ids: ids.to_vec(),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Move jobs to [crate::JobState::Retry] from any state, consuming a retry
    /// and applying the queue's retry delay. This is the escape hatch for
    /// re-running jobs that already landed in `failed`.
    #[instrument(skip(self))]
    pub async fn retry(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let outcome = self
            .state
            .write_op(|result_tx| {
                DbOperationType::RetryJobs(RetryJobsArgs {
                    ids: ids.to_vec(),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await?;

        let now_millis = self.state.time.now_millis();
        for (queue, start_after) in &outcome.retried {
            self.state
                .notify_for_queue(now_millis, *start_after, queue)
                .await;
        }

        Ok(outcome.retried.len() as u64)
    }

    /// Hard-delete jobs regardless of state.
    #[instrument(skip(self))]
    pub async fn delete_jobs(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.state
            .write_op(|result_tx| {
                DbOperationType::DeleteJobs(DeleteJobsArgs {
                    ids: ids.to_vec(),
                    result_tx,
                })
            })
            .await
    }
}
