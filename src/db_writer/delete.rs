use rusqlite::{named_params, Connection};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{complete::id_array, DbOperationResult, OperationResult};
use crate::Result;

pub(crate) struct DeleteJobsArgs {
    pub ids: Vec<Uuid>,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

fn do_delete_jobs(conn: &Connection, ids: &[Uuid]) -> Result<u64> {
    let mut stmt = conn.prepare_cached("DELETE FROM jobs WHERE id IN rarray($ids)")?;
    let changed = stmt.execute(named_params! { "$ids": id_array(ids) })?;
    Ok(changed as u64)
}

pub(super) fn delete_jobs(conn: &Connection, args: DeleteJobsArgs) -> DbOperationResult {
    let DeleteJobsArgs { ids, result_tx } = args;

    let result = do_delete_jobs(conn, &ids);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}
