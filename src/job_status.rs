use smallvec::SmallVec;
use uuid::Uuid;

use crate::{
    events::{QueueStateCount, StateCounts},
    job::{Job, JobState, JOB_COLUMNS},
    shared_state::SharedState,
    validation, Error, Queue, Result,
};

fn job_by_id_query(table: &str) -> String {
    format!("SELECT {JOB_COLUMNS} FROM {table} WHERE name = ?1 AND id = ?2")
}

impl Queue {
    /// Look up a job by queue and id, optionally falling back to the archive.
    pub async fn get_job_by_id(
        &self,
        queue: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>> {
        validation::require_queue_name(queue)?;

        let queue = queue.to_string();
        let conn = self.state.read_conn_pool.get().await?;
        let job = conn
            .interact(move |conn| {
                let id = id.to_string();
                let mut stmt = conn.prepare_cached(&job_by_id_query("jobs"))?;
                let mut rows = stmt
                    .query_and_then([&queue, &id], |row| Job::from_row(row))?
                    .collect::<Result<SmallVec<[Job; 1]>>>()?;

                if rows.is_empty() && include_archive {
                    let mut stmt = conn.prepare_cached(&job_by_id_query("archived_jobs"))?;
                    rows = stmt
                        .query_and_then([&queue, &id], |row| Job::from_row(row))?
                        .collect::<Result<SmallVec<[Job; 1]>>>()?;
                }

                Ok::<_, Error>(rows.pop())
            })
            .await??;

        Ok(job)
    }

    /// Census of the job table: counts per queue and state, per state, and in
    /// total. This is what the monitor loop publishes.
    pub async fn count_states(&self) -> Result<StateCounts> {
        count_states(&self.state).await
    }
}

pub(crate) async fn count_states(state: &SharedState) -> Result<StateCounts> {
    let conn = state.read_conn_pool.get().await?;
    let queues = conn
        .interact(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name, state, COUNT(*) FROM jobs GROUP BY name, state ORDER BY name, state",
            )?;
            let rows = stmt
                .query_and_then([], |row| {
                    let state: String = row.get(1).map_err(|e| Error::ColumnType(e, "state"))?;
                    let count: i64 = row.get(2).map_err(|e| Error::ColumnType(e, "count"))?;
                    Ok::<_, Error>(QueueStateCount {
                        queue: row.get(0).map_err(|e| Error::ColumnType(e, "name"))?,
                        state: state.parse::<JobState>()?,
                        count: count as u64,
                    })
                })?
                .collect::<Result<Vec<_>>>()?;
            Ok::<_, Error>(rows)
        })
        .await??;

    let mut states: Vec<(JobState, u64)> = Vec::new();
    let mut total = 0u64;
    for row in &queues {
        total += row.count;
        match states.iter_mut().find(|(state, _)| *state == row.state) {
            Some((_, count)) => *count += row.count,
            None => states.push((row.state, row.count)),
        }
    }

    Ok(StateCounts {
        queues,
        states,
        total,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use temp_dir::TempDir;

    use crate::{test_util::TestEnvironment, JobState, QueueOptions, QueueSettings};

    #[tokio::test]
    async fn lookup_falls_back_to_archive() {
        let dir = TempDir::new().unwrap();
        let queue = QueueSettings::new(dir.child("test.sqlite"))
            .auto_create(true)
            .archive_interval(Duration::ZERO)
            .archive_failed_interval(Duration::ZERO)
            .delete_after(Duration::from_secs(3600))
            .build()
            .await
            .unwrap();
        queue
            .create_queue("jobs", QueueOptions::default())
            .await
            .unwrap();

        let id = queue.send("jobs", json!({})).await.unwrap().unwrap();
        queue.fetch("jobs").await.unwrap();
        queue.complete(&[id], None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let counts = queue.maintain().await.unwrap();
        assert_eq!(counts.archived, 1);

        assert!(queue.get_job_by_id("jobs", id, false).await.unwrap().is_none());
        let archived = queue
            .get_job_by_id("jobs", id, true)
            .await
            .unwrap()
            .expect("archived row");
        assert_eq!(archived.state, JobState::Completed);

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let test = TestEnvironment::new().await;
        test.make_queue("jobs").await;
        let missing = test
            .queue
            .get_job_by_id("jobs", uuid::Uuid::new_v4(), true)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn state_census() {
        let test = TestEnvironment::new().await;
        test.make_queue("a").await;
        test.make_queue("b").await;

        test.queue.send("a", json!({})).await.unwrap().unwrap();
        test.queue.send("a", json!({})).await.unwrap().unwrap();
        test.queue.send("b", json!({})).await.unwrap().unwrap();
        test.queue.fetch("a").await.unwrap();

        let counts = test.queue.count_states().await.unwrap();
        assert_eq!(counts.total, 3);

        let created = counts
            .states
            .iter()
            .find(|(state, _)| *state == JobState::Created)
            .map(|(_, count)| *count);
        assert_eq!(created, Some(2));

        let active_a = counts
            .queues
            .iter()
            .find(|row| row.queue == "a" && row.state == JobState::Active)
            .map(|row| row.count);
        assert_eq!(active_a, Some(1));
    }
}
