use std::rc::Rc;

use rusqlite::{named_params, types::Value, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use super::{is_busy, DbOperationResult, OperationResult};
use crate::{
    job::{to_millis, Job, JOB_COLUMNS},
    Result,
};

pub(crate) struct FetchJobsArgs {
    pub queue: String,
    pub batch_size: u32,
    pub order_by_priority: bool,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<Vec<Job>>>,
}

/// The claim: select up to `batch_size` ready rows and flip them to `active`
/// inside the enclosing write transaction. Committing the transaction is the
/// linearization point; a competing claimer blocks on the write lock and then
/// sees only unclaimed rows.
fn do_fetch_jobs(
    conn: &Connection,
    queue: &str,
    batch_size: u32,
    order_by_priority: bool,
    now: OffsetDateTime,
) -> Result<Vec<Job>> {
    let query = if order_by_priority {
        r##"SELECT id FROM jobs
            WHERE name = $name AND state IN ('created', 'retry') AND start_after <= $now
            ORDER BY priority DESC, created_on ASC, id ASC
            LIMIT $limit"##
    } else {
        r##"SELECT id FROM jobs
            WHERE name = $name AND state IN ('created', 'retry') AND start_after <= $now
            ORDER BY created_on ASC, id ASC
            LIMIT $limit"##
    };

    let now_millis = to_millis(now);

    let mut select_stmt = conn.prepare_cached(query)?;
    let ids = select_stmt
        .query_map(
            named_params! {
                "$name": queue,
                "$now": now_millis,
                "$limit": batch_size,
            },
            |row| row.get::<_, String>(0).map(Value::from),
        )?
        .collect::<Result<Vec<Value>, _>>()?;

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut claim_stmt = conn.prepare_cached(&format!(
        r##"UPDATE jobs SET state = 'active', started_on = $now
            WHERE id IN rarray($ids)
            RETURNING {JOB_COLUMNS}"##
    ))?;

    let mut jobs = claim_stmt
        .query_and_then(
            named_params! {
                "$now": now_millis,
                "$ids": Rc::new(ids),
            },
            |row| Job::from_row(row),
        )?
        .collect::<Result<Vec<Job>>>()?;

    // RETURNING does not promise an order; restore the claim order.
    if order_by_priority {
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_on.cmp(&b.created_on))
                .then(a.id.cmp(&b.id))
        });
    } else {
        jobs.sort_by(|a, b| a.created_on.cmp(&b.created_on).then(a.id.cmp(&b.id)));
    }

    Ok(jobs)
}

pub(super) fn fetch_jobs(conn: &Connection, args: FetchJobsArgs) -> DbOperationResult {
    let FetchJobsArgs {
        queue,
        batch_size,
        order_by_priority,
        now,
        result_tx,
    } = args;

    let result = match do_fetch_jobs(conn, &queue, batch_size, order_by_priority, now) {
        // A lock-wait timeout on the claim is contention, not an error.
        Err(crate::Error::Database(e)) if is_busy(&e) => Ok(Vec::new()),
        other => other,
    };

    DbOperationResult::Jobs(OperationResult::new(result, result_tx))
}
