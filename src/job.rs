use std::{borrow::Cow, fmt::Display, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{queues::QueuePolicy, Error, Queue, Result};

/// The current lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// The job is waiting to be claimed.
    Created,
    /// The job failed and is waiting to be claimed again.
    Retry,
    /// The job has been claimed by a poller and is executing.
    Active,
    /// The job finished successfully.
    Completed,
    /// The job was cancelled by the user.
    Cancelled,
    /// The job failed and exceeded its retry limit. It will not be retried.
    Failed,
}

impl JobState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }

    /// Whether the state is terminal. The only edge out of a terminal state is
    /// [Queue::resume], which moves cancelled jobs back to [JobState::Created].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobState::Created),
            "retry" => Ok(JobState::Retry),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "cancelled" => Ok(JobState::Cancelled),
            "failed" => Ok(JobState::Failed),
            _ => Err(Error::InvalidJobState(s.to_string())),
        }
    }
}

pub(crate) fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64, column: &'static str) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|_| Error::TimestampOutOfRange(column))
}

fn opt_from_millis(ms: Option<i64>, column: &'static str) -> Result<Option<OffsetDateTime>> {
    ms.map(|ms| from_millis(ms, column)).transpose()
}

/// Column list matching [Job::from_row]. Every statement that surfaces full job rows
/// selects exactly these columns in this order.
pub(crate) const JOB_COLUMNS: &str = "id, name, priority, data, state, \
    retry_limit, retry_count, retry_delay, retry_backoff, \
    start_after, started_on, singleton_key, singleton_on, expire_in, \
    created_on, completed_on, keep_until, output, dead_letter, policy";

/// A job row as returned by [Queue::fetch] or [Queue::get_job_by_id].
#[derive(Debug, Clone)]
pub struct Job {
    /// The job's unique identifier.
    pub id: Uuid,
    /// The queue the job belongs to.
    pub name: String,
    /// Jobs with higher `priority` are claimed first.
    pub priority: i16,
    /// The payload to pass to the consumer.
    pub data: Option<serde_json::Value>,
    /// Where the job is in its lifecycle.
    pub state: JobState,
    /// How many times the job may move back to [JobState::Retry] after a failure.
    pub retry_limit: i32,
    /// How many retries have been consumed so far.
    pub retry_count: i32,
    /// Base delay in seconds applied before a retried job becomes claimable again.
    pub retry_delay: i32,
    /// Whether the retry delay doubles with each consumed retry.
    pub retry_backoff: bool,
    /// The job is invisible to [Queue::fetch] before this time.
    pub start_after: OffsetDateTime,
    /// When the job was last claimed.
    pub started_on: Option<OffsetDateTime>,
    /// Deduplication key for singleton admission.
    pub singleton_key: Option<String>,
    /// The quantized time bucket for debounce/throttle admission.
    pub singleton_on: Option<OffsetDateTime>,
    /// How long the job may stay active before the expiration pass fails it.
    pub expire_in: Duration,
    /// When the job was inserted.
    pub created_on: OffsetDateTime,
    /// When the job reached a terminal state.
    pub completed_on: Option<OffsetDateTime>,
    /// When the job becomes a candidate for archival even if never completed.
    pub keep_until: OffsetDateTime,
    /// The result document recorded on completion, or the serialized error on failure.
    pub output: Option<serde_json::Value>,
    /// Queue receiving a copy of the payload once retries are exhausted.
    pub dead_letter: Option<String>,
    /// The admission policy resolved from the queue at insertion time.
    pub policy: QueuePolicy,
}

impl Job {
    /// Deserialize the job's payload.
    pub fn json_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(Error::Payload)
    }

    /// Build a [Job] from a row selected with [JOB_COLUMNS].
    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Job> {
        let id: String = row.get(0).map_err(|e| Error::ColumnType(e, "id"))?;
        let id =
            Uuid::parse_str(&id).map_err(|_| Error::DbInteract(format!("invalid job id {id}")))?;

        let data: Option<String> = row.get(3).map_err(|e| Error::ColumnType(e, "data"))?;
        let data = data
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(Error::Payload)?;

        let output: Option<String> = row.get(17).map_err(|e| Error::ColumnType(e, "output"))?;
        let output = output
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(Error::Payload)?;

        let state: String = row.get(4).map_err(|e| Error::ColumnType(e, "state"))?;
        let policy: String = row.get(19).map_err(|e| Error::ColumnType(e, "policy"))?;
        let expire_in: i64 = row.get(13).map_err(|e| Error::ColumnType(e, "expire_in"))?;

        Ok(Job {
            id,
            name: row.get(1).map_err(|e| Error::ColumnType(e, "name"))?,
            priority: row.get(2).map_err(|e| Error::ColumnType(e, "priority"))?,
            data,
            state: state.parse()?,
            retry_limit: row
                .get(5)
                .map_err(|e| Error::ColumnType(e, "retry_limit"))?,
            retry_count: row
                .get(6)
                .map_err(|e| Error::ColumnType(e, "retry_count"))?,
            retry_delay: row
                .get(7)
                .map_err(|e| Error::ColumnType(e, "retry_delay"))?,
            retry_backoff: row
                .get(8)
                .map_err(|e| Error::ColumnType(e, "retry_backoff"))?,
            start_after: from_millis(
                row.get(9).map_err(|e| Error::ColumnType(e, "start_after"))?,
                "start_after",
            )?,
            started_on: opt_from_millis(
                row.get(10)
                    .map_err(|e| Error::ColumnType(e, "started_on"))?,
                "started_on",
            )?,
            singleton_key: row
                .get(11)
                .map_err(|e| Error::ColumnType(e, "singleton_key"))?,
            singleton_on: opt_from_millis(
                row.get(12)
                    .map_err(|e| Error::ColumnType(e, "singleton_on"))?,
                "singleton_on",
            )?,
            expire_in: Duration::from_secs(expire_in.max(0) as u64),
            created_on: from_millis(
                row.get(14)
                    .map_err(|e| Error::ColumnType(e, "created_on"))?,
                "created_on",
            )?,
            completed_on: opt_from_millis(
                row.get(15)
                    .map_err(|e| Error::ColumnType(e, "completed_on"))?,
                "completed_on",
            )?,
            keep_until: from_millis(
                row.get(16)
                    .map_err(|e| Error::ColumnType(e, "keep_until"))?,
                "keep_until",
            )?,
            output,
            dead_letter: row
                .get(18)
                .map_err(|e| Error::ColumnType(e, "dead_letter"))?,
            policy: policy.parse()?,
        })
    }
}

/// A job to be submitted to a queue.
///
/// Most fields are optional; anything unset falls back to the target queue's defaults.
/// Clone the same [NewJob] to submit it multiple times; the id is minted at send time
/// unless one is supplied.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewJob {
    /// The target queue.
    pub queue: Cow<'static, str>,
    /// Explicit id for the job. A fresh UUIDv4 is minted when unset.
    pub id: Option<Uuid>,
    /// The payload.
    pub data: Option<serde_json::Value>,
    /// Jobs with higher priority are claimed first.
    pub priority: i16,
    /// When the job should become claimable. Unset means right away.
    pub start_after: Option<OffsetDateTime>,
    /// Deduplication key. Two live jobs with the same key (and bucket) collide and
    /// the later send is absorbed.
    pub singleton_key: Option<String>,
    /// Bucket width in seconds for debounce/throttle admission.
    pub singleton_seconds: Option<u32>,
    /// Override the queue's retry limit.
    pub retry_limit: Option<i32>,
    /// Override the queue's retry delay in seconds.
    pub retry_delay: Option<i32>,
    /// Override the queue's backoff flag.
    pub retry_backoff: Option<bool>,
    /// Override the queue's active-state expiration.
    pub expire_in: Option<Duration>,
    /// Override the queue's retention period.
    pub retain_for: Option<Duration>,
    /// Override the queue's dead-letter target.
    pub dead_letter: Option<String>,
}

impl NewJob {
    /// Create a [NewJobBuilder] for the given queue.
    pub fn builder(queue: impl Into<Cow<'static, str>>) -> NewJobBuilder {
        NewJobBuilder::new(queue)
    }
}

/// A builder for a job to submit to a queue.
pub struct NewJobBuilder {
    job: NewJob,
}

impl NewJobBuilder {
    /// Create a new job builder.
    pub fn new(queue: impl Into<Cow<'static, str>>) -> Self {
        Self {
            job: NewJob {
                queue: queue.into(),
                ..Default::default()
            },
        }
    }

    /// Use an explicit job id instead of minting one.
    pub fn id(mut self, id: Uuid) -> Self {
        self.job.id = Some(id);
        self
    }

    /// Set the payload of the job.
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.job.data = Some(data);
        self
    }

    /// Serialize the payload of the job using `serde_json`.
    pub fn json_data<T: ?Sized + serde::Serialize>(mut self, data: &T) -> Result<Self> {
        self.job.data = Some(serde_json::to_value(data).map_err(Error::Payload)?);
        Ok(self)
    }

    /// Set the priority of the job.
    pub fn priority(mut self, priority: i16) -> Self {
        self.job.priority = priority;
        self
    }

    /// Set the time at which the job becomes claimable.
    pub fn start_after(mut self, start_after: OffsetDateTime) -> Self {
        self.job.start_after = Some(start_after);
        self
    }

    /// Set the deduplication key.
    pub fn singleton_key(mut self, key: impl ToString) -> Self {
        self.job.singleton_key = Some(key.to_string());
        self
    }

    /// Deduplicate within quantized buckets of this many seconds.
    pub fn singleton_seconds(mut self, seconds: u32) -> Self {
        self.job.singleton_seconds = Some(seconds);
        self
    }

    /// Set the maximum number of retries for the job.
    pub fn retry_limit(mut self, retry_limit: i32) -> Self {
        self.job.retry_limit = Some(retry_limit);
        self
    }

    /// Set the base retry delay in seconds.
    pub fn retry_delay(mut self, retry_delay: i32) -> Self {
        self.job.retry_delay = Some(retry_delay);
        self
    }

    /// Double the retry delay with each consumed retry.
    pub fn retry_backoff(mut self, retry_backoff: bool) -> Self {
        self.job.retry_backoff = Some(retry_backoff);
        self
    }

    /// Limit how long the job may stay active.
    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.job.expire_in = Some(expire_in);
        self
    }

    /// Keep the job row at least this long before archival.
    pub fn retain_for(mut self, retain_for: Duration) -> Self {
        self.job.retain_for = Some(retain_for);
        self
    }

    /// Route the payload to this queue once retries are exhausted.
    pub fn dead_letter(mut self, dead_letter: impl ToString) -> Self {
        self.job.dead_letter = Some(dead_letter.to_string());
        self
    }

    /// Build the job.
    pub fn build(self) -> NewJob {
        self.job
    }

    /// Build the job and send it to a [Queue]. Returns `None` when a singleton
    /// collision absorbed the row.
    pub async fn send_to(self, queue: &Queue) -> Result<Option<Uuid>> {
        queue.send_job(self.job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            JobState::Created,
            JobState::Retry,
            JobState::Active,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }

        assert!("pending".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Retry.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn millis_round_trip() {
        let now = OffsetDateTime::now_utc();
        let ms = to_millis(now);
        let back = from_millis(ms, "test").unwrap();
        assert!((now - back).whole_milliseconds().abs() < 1);
    }
}
