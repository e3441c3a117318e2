use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use super::{is_foreign_key_violation, DbOperationResult, OperationResult};
use crate::{job::to_millis, Error, Result};

pub(crate) struct UpsertScheduleArgs {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub data: Option<String>,
    pub options: Option<String>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<()>>,
}

pub(crate) struct SubscriptionArgs {
    pub event: String,
    pub name: String,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<()>>,
}

/// Schedules are keyed by queue name, so there is at most one cron rule per
/// queue and scheduling again replaces it. The foreign key to `queues` turns a
/// dangling schedule into a "queue not found" error.
fn do_upsert_schedule(conn: &Connection, args: &UpsertScheduleArgs) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r##"INSERT INTO schedules (name, cron, timezone, data, options, created_on, updated_on)
            VALUES ($name, $cron, $timezone, $data, $options, $now, $now)
            ON CONFLICT (name) DO UPDATE SET
                cron = excluded.cron,
                timezone = excluded.timezone,
                data = excluded.data,
                options = excluded.options,
                updated_on = excluded.updated_on"##,
    )?;

    stmt.execute(named_params! {
        "$name": args.name,
        "$cron": args.cron,
        "$timezone": args.timezone,
        "$data": args.data,
        "$options": args.options,
        "$now": to_millis(args.now),
    })
    .map_err(|e| {
        if is_foreign_key_violation(&e) {
            Error::QueueNotFound(args.name.clone())
        } else {
            e.into()
        }
    })?;

    Ok(())
}

fn do_delete_schedule(conn: &Connection, name: &str) -> Result<u64> {
    let mut stmt = conn.prepare_cached("DELETE FROM schedules WHERE name = ?1")?;
    let changed = stmt.execute([name])?;
    Ok(changed as u64)
}

fn do_subscribe(conn: &Connection, args: &SubscriptionArgs) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r##"INSERT INTO subscriptions (event, name, created_on)
            VALUES ($event, $name, $now)
            ON CONFLICT (event, name) DO NOTHING"##,
    )?;

    stmt.execute(named_params! {
        "$event": args.event,
        "$name": args.name,
        "$now": to_millis(args.now),
    })
    .map_err(|e| {
        if is_foreign_key_violation(&e) {
            Error::QueueNotFound(args.name.clone())
        } else {
            e.into()
        }
    })?;

    Ok(())
}

fn do_unsubscribe(conn: &Connection, args: &SubscriptionArgs) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM subscriptions WHERE event = ?1 AND name = ?2")?;
    stmt.execute([&args.event, &args.name])?;
    Ok(())
}

pub(super) fn upsert_schedule(conn: &Connection, args: UpsertScheduleArgs) -> DbOperationResult {
    let result = do_upsert_schedule(conn, &args);
    DbOperationResult::Empty(OperationResult::new(result, args.result_tx))
}

pub(super) fn delete_schedule(conn: &Connection, args: super::queues::NameArgs) -> DbOperationResult {
    let super::queues::NameArgs { name, result_tx } = args;
    let result = do_delete_schedule(conn, &name);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}

pub(super) fn subscribe(conn: &Connection, args: SubscriptionArgs) -> DbOperationResult {
    let result = do_subscribe(conn, &args);
    DbOperationResult::Empty(OperationResult::new(result, args.result_tx))
}

pub(super) fn unsubscribe(conn: &Connection, args: SubscriptionArgs) -> DbOperationResult {
    let result = do_unsubscribe(conn, &args);
    DbOperationResult::Empty(OperationResult::new(result, args.result_tx))
}
