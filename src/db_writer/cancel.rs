use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{complete::id_array, DbOperationResult, OperationResult};
use crate::{job::to_millis, Result};

pub(crate) struct CancelJobsArgs {
    pub ids: Vec<Uuid>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

fn do_cancel_jobs(conn: &Connection, ids: &[Uuid], now: OffsetDateTime) -> Result<u64> {
    let mut stmt = conn.prepare_cached(
        r##"UPDATE jobs
            SET state = 'cancelled', completed_on = $now
            WHERE id IN rarray($ids)
              AND state NOT IN ('completed', 'cancelled', 'failed')"##,
    )?;

    let changed = stmt.execute(named_params! {
        "$now": to_millis(now),
        "$ids": id_array(ids),
    })?;

    Ok(changed as u64)
}

/// Resuming is the only edge out of a terminal state: cancelled rows move back
/// to `created` with their claim bookkeeping cleared. Rows in any other state
/// are untouched.
fn do_resume_jobs(conn: &Connection, ids: &[Uuid]) -> Result<u64> {
    let mut stmt = conn.prepare_cached(
        r##"UPDATE jobs
            SET state = 'created', started_on = NULL, completed_on = NULL
            WHERE id IN rarray($ids) AND state = 'cancelled'"##,
    )?;

    let changed = stmt.execute(named_params! { "$ids": id_array(ids) })?;

    Ok(changed as u64)
}

pub(super) fn cancel_jobs(conn: &Connection, args: CancelJobsArgs) -> DbOperationResult {
    let CancelJobsArgs {
        ids,
        now,
        result_tx,
    } = args;

    let result = do_cancel_jobs(conn, &ids, now);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}

pub(super) fn resume_jobs(conn: &Connection, args: CancelJobsArgs) -> DbOperationResult {
    let CancelJobsArgs {
        ids,
        now: _,
        result_tx,
    } = args;

    let result = do_resume_jobs(conn, &ids);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}
