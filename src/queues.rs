use std::{fmt::Display, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    db_writer::{
        queues::{CreateQueueArgs, NameArgs},
        DbOperationType,
    },
    job::from_millis,
    validation, Error, Queue, Result,
};

/// How a queue admits jobs that share a singleton key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// No admission restriction.
    #[default]
    Standard,
    /// At most one claimable job per singleton key.
    Short,
    /// At most one live (non-terminal) job per singleton key.
    Singleton,
    /// At most one live job per singleton key and state.
    Stately,
}

impl QueuePolicy {
    /// Return a string representation of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePolicy::Standard => "standard",
            QueuePolicy::Short => "short",
            QueuePolicy::Singleton => "singleton",
            QueuePolicy::Stately => "stately",
        }
    }
}

impl Display for QueuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueuePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(QueuePolicy::Standard),
            "short" => Ok(QueuePolicy::Short),
            "singleton" => Ok(QueuePolicy::Singleton),
            "stately" => Ok(QueuePolicy::Stately),
            _ => Err(Error::InvalidPolicy(s.to_string())),
        }
    }
}

/// Execution defaults applied to jobs sent to a queue. Per-job options override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Admission policy for jobs carrying a singleton key.
    pub policy: QueuePolicy,
    /// How many times a failing job is retried before it lands in `failed`.
    pub retry_limit: i32,
    /// Base delay in seconds before a retried job becomes claimable again.
    pub retry_delay: i32,
    /// Double the retry delay with each consumed retry.
    pub retry_backoff: bool,
    /// How long a claimed job may stay active before the expiration pass fails it.
    pub expire_in: Duration,
    /// How long job rows are kept before becoming archival candidates.
    pub retention: Duration,
    /// Queue receiving payload copies once retries are exhausted.
    pub dead_letter: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            policy: QueuePolicy::Standard,
            retry_limit: 2,
            retry_delay: 0,
            retry_backoff: false,
            expire_in: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
            dead_letter: None,
        }
    }
}

impl QueueOptions {
    /// Set the admission policy.
    pub fn policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the retry limit.
    pub fn retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Set the base retry delay in seconds.
    pub fn retry_delay(mut self, retry_delay: i32) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Enable or disable exponential backoff.
    pub fn retry_backoff(mut self, retry_backoff: bool) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Set the active-state expiration.
    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    /// Set the retention period.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Route exhausted jobs to this queue.
    pub fn dead_letter(mut self, dead_letter: impl ToString) -> Self {
        self.dead_letter = Some(dead_letter.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        validation::require_retry_limit(self.retry_limit)?;
        validation::require_retry_delay(self.retry_delay)?;
        validation::require_expire_in(self.expire_in)?;
        validation::require_retention(self.retention)?;
        if let Some(dead_letter) = self.dead_letter.as_deref() {
            validation::require_queue_name(dead_letter)?;
        }
        Ok(())
    }
}

/// A queue row, as returned by [Queue::get_queue].
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// The queue name.
    pub name: String,
    /// The queue's execution defaults.
    pub options: QueueOptions,
    /// When the queue was created.
    pub created_on: OffsetDateTime,
    /// When the queue's options were last updated.
    pub updated_on: OffsetDateTime,
}

impl QueueInfo {
    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<QueueInfo> {
        let policy: String = row.get(1).map_err(|e| Error::ColumnType(e, "policy"))?;
        let expire_seconds: i64 = row
            .get(5)
            .map_err(|e| Error::ColumnType(e, "expire_seconds"))?;
        let retention_minutes: i64 = row
            .get(6)
            .map_err(|e| Error::ColumnType(e, "retention_minutes"))?;

        Ok(QueueInfo {
            name: row.get(0).map_err(|e| Error::ColumnType(e, "name"))?,
            options: QueueOptions {
                policy: policy.parse()?,
                retry_limit: row
                    .get(2)
                    .map_err(|e| Error::ColumnType(e, "retry_limit"))?,
                retry_delay: row
                    .get(3)
                    .map_err(|e| Error::ColumnType(e, "retry_delay"))?,
                retry_backoff: row
                    .get(4)
                    .map_err(|e| Error::ColumnType(e, "retry_backoff"))?,
                expire_in: Duration::from_secs(expire_seconds.max(0) as u64),
                retention: Duration::from_secs(retention_minutes.max(0) as u64 * 60),
                dead_letter: row
                    .get(7)
                    .map_err(|e| Error::ColumnType(e, "dead_letter"))?,
            },
            created_on: from_millis(
                row.get(8).map_err(|e| Error::ColumnType(e, "created_on"))?,
                "created_on",
            )?,
            updated_on: from_millis(
                row.get(9).map_err(|e| Error::ColumnType(e, "updated_on"))?,
                "updated_on",
            )?,
        })
    }
}

pub(crate) const QUEUE_COLUMNS: &str = "name, policy, retry_limit, retry_delay, retry_backoff, \
    expire_seconds, retention_minutes, dead_letter, created_on, updated_on";

impl Queue {
    /// Create a queue, or update its options if it already exists.
    #[instrument(skip(self, options))]
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        validation::require_queue_name(name)?;
        options.validate()?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::CreateQueue(CreateQueueArgs {
                    name: name.to_string(),
                    options,
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Update an existing queue's options. Fails when the queue does not exist.
    #[instrument(skip(self, options))]
    pub async fn update_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        validation::require_queue_name(name)?;
        options.validate()?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::UpdateQueue(CreateQueueArgs {
                    name: name.to_string(),
                    options,
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Delete a queue. Schedules and subscriptions tied to the queue go with it;
    /// jobs do not and must be purged separately.
    #[instrument(skip(self))]
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        validation::require_queue_name(name)?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::DeleteQueue(NameArgs {
                    name: name.to_string(),
                    result_tx,
                })
            })
            .await?;
        Ok(())
    }

    /// Look up a queue's metadata.
    pub async fn get_queue(&self, name: &str) -> Result<Option<QueueInfo>> {
        validation::require_queue_name(name)?;
        let name = name.to_string();

        let conn = self.state.read_conn_pool.get().await?;
        let info = conn
            .interact(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM queues WHERE name = ?1"
                ))?;
                let mut rows = stmt
                    .query_and_then([&name], |row| QueueInfo::from_row(row))?
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, Error>(rows.pop())
            })
            .await??;

        Ok(info)
    }

    /// List all queues.
    pub async fn get_queues(&self) -> Result<Vec<QueueInfo>> {
        let conn = self.state.read_conn_pool.get().await?;
        let queues = conn
            .interact(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM queues ORDER BY name"
                ))?;
                let rows = stmt
                    .query_and_then([], |row| QueueInfo::from_row(row))?
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, Error>(rows)
            })
            .await??;

        Ok(queues)
    }

    /// Count the claimable jobs (created or retry) in a queue.
    pub async fn get_queue_size(&self, name: &str) -> Result<u64> {
        validation::require_queue_name(name)?;
        let name = name.to_string();

        let conn = self.state.read_conn_pool.get().await?;
        let count: i64 = conn
            .interact(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT COUNT(*) FROM jobs \
                     WHERE name = ?1 AND state IN ('created', 'retry')",
                )?;
                stmt.query_row([&name], |row| row.get(0))
            })
            .await??;

        Ok(count as u64)
    }

    /// Hard-delete every job in a queue, regardless of state.
    #[instrument(skip(self))]
    pub async fn purge_queue(&self, name: &str) -> Result<u64> {
        validation::require_queue_name(name)?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::PurgeQueue(NameArgs {
                    name: name.to_string(),
                    result_tx,
                })
            })
            .await
    }

    /// Truncate all queue, job, archive, schedule, and subscription storage.
    #[instrument(skip(self))]
    pub async fn clear_storage(&self) -> Result<()> {
        self.state
            .write_op(|result_tx| DbOperationType::ClearStorage { result_tx })
            .await
    }
}


#[cfg(test)]
mod integration_tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{QueueOptions, QueuePolicy};
    use crate::{scheduling::ScheduleOptions, test_util::TestEnvironment, Error};

    #[tokio::test]
    async fn queue_round_trip() {
        let test = TestEnvironment::new().await;
        test.make_queue("dlq").await;

        let options = QueueOptions::default()
            .policy(QueuePolicy::Singleton)
            .retry_limit(5)
            .retry_delay(30)
            .retry_backoff(true)
            .expire_in(Duration::from_secs(600))
            .retention(Duration::from_secs(7 * 24 * 60 * 60))
            .dead_letter("dlq");

        test.queue.create_queue("orders", options).await.unwrap();

        let info = test
            .queue
            .get_queue("orders")
            .await
            .unwrap()
            .expect("queue exists");
        assert_eq!(info.name, "orders");
        assert_eq!(info.options.policy, QueuePolicy::Singleton);
        assert_eq!(info.options.retry_limit, 5);
        assert_eq!(info.options.retry_delay, 30);
        assert!(info.options.retry_backoff);
        assert_eq!(info.options.expire_in, Duration::from_secs(600));
        assert_eq!(info.options.dead_letter.as_deref(), Some("dlq"));

        assert_eq!(test.queue.get_queues().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_queue_changes_defaults() {
        let test = TestEnvironment::new().await;
        test.make_queue("tunable").await;

        test.queue
            .update_queue("tunable", QueueOptions::default().retry_limit(9))
            .await
            .unwrap();
        let info = test.queue.get_queue("tunable").await.unwrap().unwrap();
        assert_eq!(info.options.retry_limit, 9);

        let missing = test
            .queue
            .update_queue("ghost", QueueOptions::default())
            .await;
        assert!(matches!(missing, Err(Error::QueueNotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn dead_letter_must_exist() {
        let test = TestEnvironment::new().await;
        let result = test
            .queue
            .create_queue("q", QueueOptions::default().dead_letter("missing"))
            .await;
        assert!(matches!(result, Err(Error::QueueNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn delete_queue_cascades_to_schedules_but_not_jobs() {
        let test = TestEnvironment::new().await;
        test.make_queue("ephemeral").await;

        test.queue
            .schedule("ephemeral", "* * * * *", None, ScheduleOptions::default())
            .await
            .unwrap();
        test.queue
            .send("ephemeral", json!({}))
            .await
            .unwrap()
            .unwrap();

        test.queue.delete_queue("ephemeral").await.unwrap();

        assert!(test.queue.get_queue("ephemeral").await.unwrap().is_none());
        assert!(test.queue.get_schedules().await.unwrap().is_empty());
        // Jobs are purged separately.
        assert_eq!(test.queue.get_queue_size("ephemeral").await.unwrap(), 1);

        assert_eq!(test.queue.purge_queue("ephemeral").await.unwrap(), 1);
        assert_eq!(test.queue.get_queue_size("ephemeral").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleting_a_dead_letter_target_nulls_references() {
        let test = TestEnvironment::new().await;
        test.make_queue("dlq").await;
        test.queue
            .create_queue("main", QueueOptions::default().dead_letter("dlq"))
            .await
            .unwrap();

        test.queue.delete_queue("dlq").await.unwrap();

        let info = test.queue.get_queue("main").await.unwrap().unwrap();
        assert!(info.options.dead_letter.is_none());
    }
}
