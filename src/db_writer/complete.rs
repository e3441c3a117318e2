use std::rc::Rc;

use rusqlite::{named_params, types::Value, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{DbOperationResult, OperationResult};
use crate::{job::to_millis, Result};

pub(crate) struct CompleteJobsArgs {
    pub ids: Vec<Uuid>,
    pub output: Option<String>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

pub(super) fn id_array(ids: &[Uuid]) -> Rc<Vec<Value>> {
    Rc::new(ids.iter().map(|id| Value::from(id.to_string())).collect())
}

fn do_complete_jobs(
    conn: &Connection,
    ids: &[Uuid],
    output: Option<&str>,
    now: OffsetDateTime,
) -> Result<u64> {
    let mut stmt = conn.prepare_cached(
        r##"UPDATE jobs
            SET state = 'completed', completed_on = $now, output = $output
            WHERE id IN rarray($ids)
              AND state NOT IN ('completed', 'cancelled', 'failed')"##,
    )?;

    let changed = stmt.execute(named_params! {
        "$now": to_millis(now),
        "$output": output,
        "$ids": id_array(ids),
    })?;

    Ok(changed as u64)
}

pub(super) fn complete_jobs(conn: &Connection, args: CompleteJobsArgs) -> DbOperationResult {
    let CompleteJobsArgs {
        ids,
        output,
        now,
        result_tx,
    } = args;

    let result = do_complete_jobs(conn, &ids, output.as_deref(), now);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}
