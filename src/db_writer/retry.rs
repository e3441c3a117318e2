use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{complete::id_array, fail::FailureOutcome, DbOperationResult, OperationResult};
use crate::{job::to_millis, Result};

pub(crate) struct RetryJobsArgs {
    pub ids: Vec<Uuid>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<FailureOutcome>>,
}

/// The operator-facing retry: moves rows to `retry` from any state, consuming
/// a retry and applying the same delay formula as the failure path. This is
/// the tool for re-running jobs that already landed in `failed`.
fn do_retry_jobs(conn: &Connection, ids: &[Uuid], now: OffsetDateTime) -> Result<FailureOutcome> {
    let mut stmt = conn.prepare_cached(
        r##"UPDATE jobs
            SET state = 'retry',
                retry_count = MIN(retry_count + 1, retry_limit),
                completed_on = NULL,
                start_after = $now + 1000 * (CASE WHEN retry_backoff
                    THEN retry_delay * (1 << MIN(retry_count, 30))
                    ELSE retry_delay END)
            WHERE id IN rarray($ids)
            RETURNING name, start_after"##,
    )?;

    let retried = stmt
        .query_map(
            named_params! {
                "$now": to_millis(now),
                "$ids": id_array(ids),
            },
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<Result<Vec<(String, i64)>, _>>()?;

    Ok(FailureOutcome {
        failed: 0,
        retried,
    })
}

pub(super) fn retry_jobs(conn: &Connection, args: RetryJobsArgs) -> DbOperationResult {
    let RetryJobsArgs {
        ids,
        now,
        result_tx,
    } = args;

    let result = do_retry_jobs(conn, &ids, now);
    DbOperationResult::Failures(OperationResult::new(result, result_tx))
}
