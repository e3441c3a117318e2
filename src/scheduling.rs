use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    db_writer::{
        queues::NameArgs,
        scheduling::UpsertScheduleArgs,
        DbOperationType,
    },
    job::{from_millis, NewJob},
    validation, Error, Queue, Result,
};

/// Options stored with a schedule and applied to each job it sends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// IANA timezone the cron expression is evaluated in. Defaults to UTC.
    pub timezone: Option<String>,
    /// Priority for the sent jobs.
    #[serde(default)]
    pub priority: i16,
    /// Override the queue's retry limit.
    pub retry_limit: Option<i32>,
    /// Override the queue's retry delay in seconds.
    pub retry_delay: Option<i32>,
    /// Override the queue's backoff flag.
    pub retry_backoff: Option<bool>,
    /// Override the queue's active-state expiration.
    pub expire_in: Option<Duration>,
    /// Deduplication key for the sent jobs.
    pub singleton_key: Option<String>,
    /// Bucket width in seconds for the sent jobs.
    pub singleton_seconds: Option<u32>,
}

/// A cron rule attached to a queue: at most one per queue, evaluated once per
/// firing window by whichever instance wins the cron lease.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// The queue the schedule sends to.
    pub name: String,
    /// Five-field cron expression.
    pub cron: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Payload for the sent jobs.
    pub data: Option<serde_json::Value>,
    /// Send options for the sent jobs.
    pub options: ScheduleOptions,
    /// When the schedule was created.
    pub created_on: OffsetDateTime,
    /// When the schedule was last replaced.
    pub updated_on: OffsetDateTime,
}

pub(crate) const SCHEDULE_COLUMNS: &str =
    "name, cron, timezone, data, options, created_on, updated_on";

impl Schedule {
    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Schedule> {
        let data: Option<String> = row.get(3).map_err(|e| Error::ColumnType(e, "data"))?;
        let data = data
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(Error::Payload)?;

        let options: Option<String> = row.get(4).map_err(|e| Error::ColumnType(e, "options"))?;
        let options = options
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(Error::Payload)?
            .unwrap_or_default();

        Ok(Schedule {
            name: row.get(0).map_err(|e| Error::ColumnType(e, "name"))?,
            cron: row.get(1).map_err(|e| Error::ColumnType(e, "cron"))?,
            timezone: row.get(2).map_err(|e| Error::ColumnType(e, "timezone"))?,
            data,
            options,
            created_on: from_millis(
                row.get(5).map_err(|e| Error::ColumnType(e, "created_on"))?,
                "created_on",
            )?,
            updated_on: from_millis(
                row.get(6).map_err(|e| Error::ColumnType(e, "updated_on"))?,
                "updated_on",
            )?,
        })
    }

    /// The job this schedule sends when it fires.
    pub(crate) fn to_job(&self) -> NewJob {
        NewJob {
            queue: self.name.clone().into(),
            id: None,
            data: self.data.clone(),
            priority: self.options.priority,
            start_after: None,
            singleton_key: self.options.singleton_key.clone(),
            singleton_seconds: self.options.singleton_seconds,
            retry_limit: self.options.retry_limit,
            retry_delay: self.options.retry_delay,
            retry_backoff: self.options.retry_backoff,
            expire_in: self.options.expire_in,
            retain_for: None,
            dead_letter: None,
        }
    }
}

impl Queue {
    /// Attach a cron schedule to a queue, replacing any existing one. The cron
    /// expression and timezone are validated before the row is persisted, and
    /// the queue must already exist.
    #[instrument(skip(self, data, options))]
    pub async fn schedule(
        &self,
        name: &str,
        cron: &str,
        data: Option<serde_json::Value>,
        options: ScheduleOptions,
    ) -> Result<()> {
        validation::require_queue_name(name)?;
        validation::parse_cron(cron)?;
        let timezone = options.timezone.clone().unwrap_or_else(|| "UTC".to_string());
        validation::parse_timezone(&timezone)?;
        if let Some(key) = options.singleton_key.as_deref() {
            validation::require_singleton_key(key)?;
        }
        if let Some(seconds) = options.singleton_seconds {
            validation::require_singleton_seconds(seconds)?;
        }

        let data = data
            .map(|d| serde_json::to_string(&d))
            .transpose()
            .map_err(Error::Payload)?;
        let options = serde_json::to_string(&options).map_err(Error::Payload)?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::UpsertSchedule(UpsertScheduleArgs {
                    name: name.to_string(),
                    cron: cron.to_string(),
                    timezone,
                    data,
                    options: Some(options),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Remove a queue's schedule.
    #[instrument(skip(self))]
    pub async fn unschedule(&self, name: &str) -> Result<()> {
        validation::require_queue_name(name)?;

        let removed = self
            .state
            .write_op(|result_tx| {
                DbOperationType::DeleteSchedule(NameArgs {
                    name: name.to_string(),
                    result_tx,
                })
            })
            .await?;

        if removed == 0 {
            return Err(Error::ScheduleNotFound(name.to_string()));
        }

        Ok(())
    }

    /// List all schedules.
    pub async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.state.read_conn_pool.get().await?;
        let schedules = conn
            .interact(|conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name"
                ))?;
                let rows = stmt
                    .query_and_then([], |row| Schedule::from_row(row))?
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, Error>(rows)
            })
            .await??;

        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ScheduleOptions;
    use crate::{test_util::TestEnvironment, Error};

    #[tokio::test]
    async fn schedule_round_trip() {
        let test = TestEnvironment::new().await;
        test.make_queue("nightly").await;

        test.queue
            .schedule(
                "nightly",
                "0 3 * * *",
                Some(json!({"kind": "report"})),
                ScheduleOptions {
                    timezone: Some("America/New_York".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let schedules = test.queue.get_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].name, "nightly");
        assert_eq!(schedules[0].cron, "0 3 * * *");
        assert_eq!(schedules[0].timezone, "America/New_York");
        assert_eq!(schedules[0].data, Some(json!({"kind": "report"})));

        // One schedule per queue: scheduling again replaces it.
        test.queue
            .schedule("nightly", "30 4 * * *", None, ScheduleOptions::default())
            .await
            .unwrap();
        let schedules = test.queue.get_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].cron, "30 4 * * *");
        assert_eq!(schedules[0].timezone, "UTC");

        test.queue.unschedule("nightly").await.unwrap();
        assert!(test.queue.get_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduling_a_missing_queue_fails() {
        let test = TestEnvironment::new().await;
        let result = test
            .queue
            .schedule("ghost", "* * * * *", None, ScheduleOptions::default())
            .await;
        assert!(matches!(result, Err(Error::QueueNotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn bad_cron_and_timezone_are_rejected_eagerly() {
        let test = TestEnvironment::new().await;
        test.make_queue("q").await;

        let result = test
            .queue
            .schedule("q", "not cron", None, ScheduleOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidCron(_))));

        let result = test
            .queue
            .schedule(
                "q",
                "* * * * *",
                None,
                ScheduleOptions {
                    timezone: Some("Atlantis/Sunken".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidTimezone(_))));

        // Nothing was persisted.
        assert!(test.queue.get_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unschedule_missing_is_an_error() {
        let test = TestEnvironment::new().await;
        let result = test.queue.unschedule("ghost").await;
        assert!(matches!(result, Err(Error::ScheduleNotFound(_))));
    }
}
