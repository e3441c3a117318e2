use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{event, Level};
use uuid::Uuid;

use super::{
    complete::id_array,
    send_job::{insert_resolved, resolve_queue, ResolvedJob, INSERT_JOB_QUERY},
    DbOperationResult, OperationResult,
};
use crate::{job::to_millis, Error, Result};

pub(crate) struct FailJobsArgs {
    pub ids: Vec<Uuid>,
    pub output: Option<String>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<FailureOutcome>>,
}

/// What a failure pass did: rows that landed in `failed`, and for each row that
/// moved back to `retry`, its queue and the time it becomes claimable again
/// (so delayed-job monitors can schedule a wake-up).
#[derive(Debug, Default)]
pub(crate) struct FailureOutcome {
    pub failed: u64,
    pub retried: Vec<(String, i64)>,
}

impl FailureOutcome {
    pub fn affected(&self) -> u64 {
        self.failed + self.retried.len() as u64
    }
}

/// The retry delay in milliseconds: linear by default, doubling with each
/// consumed retry under backoff. The shift is clamped to keep the arithmetic
/// in range for pathological retry counts.
const RETRY_DELAY_MILLIS: &str =
    "1000 * (CASE WHEN retry_backoff THEN retry_delay * (1 << MIN(retry_count, 30)) \
     ELSE retry_delay END)";

struct FailCandidate {
    id: Uuid,
    name: String,
    priority: i16,
    data: Option<String>,
    dead_letter: Option<String>,
    can_retry: bool,
}

/// Fail a set of jobs, rewriting each row to `retry` while it has retries left
/// and to `failed` once they are exhausted. Exhausted rows whose queue names a
/// dead-letter queue get a payload copy inserted there with counters reset.
pub(super) fn fail_job_set(
    conn: &Connection,
    ids: &[Uuid],
    output: Option<&str>,
    now: OffsetDateTime,
) -> Result<FailureOutcome> {
    let now_millis = to_millis(now);

    let mut candidates_stmt = conn.prepare_cached(
        r##"SELECT id, name, priority, data, dead_letter, retry_count < retry_limit
            FROM jobs
            WHERE id IN rarray($ids)
              AND state NOT IN ('completed', 'cancelled', 'failed')"##,
    )?;

    let candidates = candidates_stmt
        .query_and_then(named_params! { "$ids": id_array(ids) }, |row| {
            let id: String = row.get(0).map_err(|e| Error::ColumnType(e, "id"))?;
            Ok::<_, Error>(FailCandidate {
                id: Uuid::parse_str(&id)
                    .map_err(|_| Error::DbInteract(format!("invalid job id {id}")))?,
                name: row.get(1).map_err(|e| Error::ColumnType(e, "name"))?,
                priority: row.get(2).map_err(|e| Error::ColumnType(e, "priority"))?,
                data: row.get(3).map_err(|e| Error::ColumnType(e, "data"))?,
                dead_letter: row
                    .get(4)
                    .map_err(|e| Error::ColumnType(e, "dead_letter"))?,
                can_retry: row.get(5).map_err(|e| Error::ColumnType(e, "can_retry"))?,
            })
        })?
        .collect::<Result<Vec<_>>>()?;

    let retry_ids: Vec<Uuid> = candidates
        .iter()
        .filter(|c| c.can_retry)
        .map(|c| c.id)
        .collect();
    let exhausted: Vec<&FailCandidate> = candidates.iter().filter(|c| !c.can_retry).collect();

    let mut outcome = FailureOutcome::default();

    if !retry_ids.is_empty() {
        let mut retry_stmt = conn.prepare_cached(&format!(
            r##"UPDATE jobs
                SET state = 'retry',
                    retry_count = retry_count + 1,
                    completed_on = NULL,
                    output = $output,
                    start_after = $now + {RETRY_DELAY_MILLIS}
                WHERE id IN rarray($ids)
                RETURNING name, start_after"##
        ))?;

        outcome.retried = retry_stmt
            .query_map(
                named_params! {
                    "$now": now_millis,
                    "$output": output,
                    "$ids": id_array(&retry_ids),
                },
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<(String, i64)>, _>>()?;
    }

    if !exhausted.is_empty() {
        let mut insert_stmt = conn.prepare_cached(INSERT_JOB_QUERY)?;
        for candidate in &exhausted {
            let Some(dead_letter) = candidate.dead_letter.as_deref() else {
                continue;
            };

            // A missing dead-letter queue doesn't block the failure itself.
            let defaults = match resolve_queue(conn, dead_letter) {
                Ok(defaults) => defaults,
                Err(Error::QueueNotFound(name)) => {
                    event!(Level::WARN, queue = %name, job_id = %candidate.id,
                        "dead-letter queue missing, dropping payload copy");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let copy = ResolvedJob {
                id: Uuid::new_v4(),
                name: dead_letter.to_string(),
                priority: candidate.priority,
                data: candidate.data.clone(),
                retry_limit: defaults.retry_limit,
                retry_delay: defaults.retry_delay,
                retry_backoff: defaults.retry_backoff,
                start_after: now_millis,
                singleton_key: None,
                singleton_on: None,
                expire_in: defaults.expire_seconds,
                created_on: now_millis,
                keep_until: now_millis + defaults.retention_minutes * 60 * 1000,
                dead_letter: defaults.dead_letter,
                policy: defaults.policy,
            };
            insert_resolved(&mut insert_stmt, &copy)?;
        }

        let fail_ids: Vec<Uuid> = exhausted.iter().map(|c| c.id).collect();
        let mut fail_stmt = conn.prepare_cached(
            r##"UPDATE jobs
                SET state = 'failed', completed_on = $now, output = $output
                WHERE id IN rarray($ids)"##,
        )?;

        outcome.failed = fail_stmt.execute(named_params! {
            "$now": now_millis,
            "$output": output,
            "$ids": id_array(&fail_ids),
        })? as u64;
    }

    Ok(outcome)
}

pub(super) fn fail_jobs(conn: &Connection, args: FailJobsArgs) -> DbOperationResult {
    let FailJobsArgs {
        ids,
        output,
        now,
        result_tx,
    } = args;

    let result = fail_job_set(conn, &ids, output.as_deref(), now);
    DbOperationResult::Failures(OperationResult::new(result, result_tx))
}
