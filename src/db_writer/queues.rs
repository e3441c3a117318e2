use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use super::{is_foreign_key_violation, DbOperationResult, OperationResult};
use crate::{job::to_millis, queues::QueueOptions, Error, Result};

pub(crate) struct CreateQueueArgs {
    pub name: String,
    pub options: QueueOptions,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<()>>,
}

pub(crate) struct NameArgs {
    pub name: String,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

/// Remap a dead-letter foreign-key violation to the queue the user actually
/// named, so the failure reads as "queue not found" rather than a constraint.
fn map_dead_letter_error(e: rusqlite::Error, options: &QueueOptions) -> Error {
    if is_foreign_key_violation(&e) {
        if let Some(dead_letter) = options.dead_letter.as_deref() {
            return Error::QueueNotFound(dead_letter.to_string());
        }
    }
    e.into()
}

fn do_create_queue(conn: &Connection, args: &CreateQueueArgs) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r##"INSERT INTO queues
            (name, policy, retry_limit, retry_delay, retry_backoff,
                expire_seconds, retention_minutes, dead_letter, created_on, updated_on)
            VALUES
            ($name, $policy, $retry_limit, $retry_delay, $retry_backoff,
                $expire_seconds, $retention_minutes, $dead_letter, $now, $now)
            ON CONFLICT (name) DO UPDATE SET
                policy = excluded.policy,
                retry_limit = excluded.retry_limit,
                retry_delay = excluded.retry_delay,
                retry_backoff = excluded.retry_backoff,
                expire_seconds = excluded.expire_seconds,
                retention_minutes = excluded.retention_minutes,
                dead_letter = excluded.dead_letter,
                updated_on = excluded.updated_on"##,
    )?;

    stmt.execute(named_params! {
        "$name": args.name,
        "$policy": args.options.policy.as_str(),
        "$retry_limit": args.options.retry_limit,
        "$retry_delay": args.options.retry_delay,
        "$retry_backoff": args.options.retry_backoff,
        "$expire_seconds": args.options.expire_in.as_secs() as i64,
        "$retention_minutes": (args.options.retention.as_secs() / 60) as i64,
        "$dead_letter": args.options.dead_letter,
        "$now": to_millis(args.now),
    })
    .map_err(|e| map_dead_letter_error(e, &args.options))?;

    Ok(())
}

fn do_update_queue(conn: &Connection, args: &CreateQueueArgs) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r##"UPDATE queues SET
                policy = $policy,
                retry_limit = $retry_limit,
                retry_delay = $retry_delay,
                retry_backoff = $retry_backoff,
                expire_seconds = $expire_seconds,
                retention_minutes = $retention_minutes,
                dead_letter = $dead_letter,
                updated_on = $now
            WHERE name = $name"##,
    )?;

    let changed = stmt
        .execute(named_params! {
            "$name": args.name,
            "$policy": args.options.policy.as_str(),
            "$retry_limit": args.options.retry_limit,
            "$retry_delay": args.options.retry_delay,
            "$retry_backoff": args.options.retry_backoff,
            "$expire_seconds": args.options.expire_in.as_secs() as i64,
            "$retention_minutes": (args.options.retention.as_secs() / 60) as i64,
            "$dead_letter": args.options.dead_letter,
            "$now": to_millis(args.now),
        })
        .map_err(|e| map_dead_letter_error(e, &args.options))?;

    if changed == 0 {
        return Err(Error::QueueNotFound(args.name.clone()));
    }

    Ok(())
}

/// Deleting a queue cascades to its schedules and subscriptions via foreign
/// keys, and nulls out dead-letter references to it. Jobs stay behind and are
/// purged separately.
fn do_delete_queue(conn: &Connection, name: &str) -> Result<u64> {
    let mut stmt = conn.prepare_cached("DELETE FROM queues WHERE name = ?1")?;
    let changed = stmt.execute([name])?;
    Ok(changed as u64)
}

fn do_purge_queue(conn: &Connection, name: &str) -> Result<u64> {
    let mut stmt = conn.prepare_cached("DELETE FROM jobs WHERE name = ?1")?;
    let changed = stmt.execute([name])?;
    Ok(changed as u64)
}

fn do_clear_storage(conn: &Connection) -> Result<()> {
    for table in [
        "jobs",
        "archived_jobs",
        "schedules",
        "subscriptions",
        "queues",
    ] {
        conn.execute(&format!("DELETE FROM {table}"), [])?;
    }
    Ok(())
}

pub(super) fn create_queue(conn: &Connection, args: CreateQueueArgs) -> DbOperationResult {
    let result = do_create_queue(conn, &args);
    DbOperationResult::Empty(OperationResult::new(result, args.result_tx))
}

pub(super) fn update_queue(conn: &Connection, args: CreateQueueArgs) -> DbOperationResult {
    let result = do_update_queue(conn, &args);
    DbOperationResult::Empty(OperationResult::new(result, args.result_tx))
}

pub(super) fn delete_queue(conn: &Connection, args: NameArgs) -> DbOperationResult {
    let NameArgs { name, result_tx } = args;
    let result = do_delete_queue(conn, &name);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}

pub(super) fn purge_queue(conn: &Connection, args: NameArgs) -> DbOperationResult {
    let NameArgs { name, result_tx } = args;
    let result = do_purge_queue(conn, &name);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}

pub(super) fn clear_storage(
    conn: &Connection,
    result_tx: oneshot::Sender<Result<()>>,
) -> DbOperationResult {
    let result = do_clear_storage(conn);
    DbOperationResult::Empty(OperationResult::new(result, result_tx))
}
