use std::time::Duration;

use rusqlite::{named_params, Connection};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    fail::{fail_job_set, FailureOutcome},
    DbOperationResult, OperationResult,
};
use crate::{job::to_millis, Error, Result};

/// The canned output recorded on jobs failed by the expiration pass.
pub(crate) const TIMEOUT_OUTPUT: &str = r#"{"value":{"message":"job failed by timeout"}}"#;

/// The three advisory leases on the `version` row. A conditional UPDATE
/// returning its affected-row count is the only atomic primitive needed to
/// elect one instance per tick.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LeaseGate {
    Maintenance,
    Monitor,
    Cron,
}

impl LeaseGate {
    fn column(&self) -> &'static str {
        match self {
            LeaseGate::Maintenance => "maintained_on",
            LeaseGate::Monitor => "monitored_on",
            LeaseGate::Cron => "cron_on",
        }
    }
}

pub(crate) struct TryLeaseArgs {
    pub gate: LeaseGate,
    pub interval: Duration,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<bool>>,
}

pub(crate) struct ExpireJobsArgs {
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<FailureOutcome>>,
}

pub(crate) struct ArchiveArgs {
    pub now: OffsetDateTime,
    pub archive_interval: Duration,
    pub archive_failed_interval: Duration,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

pub(crate) struct DropArchiveArgs {
    pub now: OffsetDateTime,
    pub delete_after: Duration,
    pub result_tx: oneshot::Sender<Result<u64>>,
}

fn do_try_lease(
    conn: &Connection,
    gate: LeaseGate,
    interval: Duration,
    now: OffsetDateTime,
) -> Result<bool> {
    let column = gate.column();
    let mut stmt = conn.prepare_cached(&format!(
        "UPDATE version SET {column} = $now \
         WHERE {column} IS NULL OR {column} < $now - $interval"
    ))?;

    let changed = stmt.execute(named_params! {
        "$now": to_millis(now),
        "$interval": interval.as_millis() as i64,
    })?;

    Ok(changed == 1)
}

/// Fail every `active` row that has outlived its expiration. Routed through
/// the normal failure path so timeouts retry and dead-letter like any other
/// failure.
fn do_expire_jobs(conn: &Connection, now: OffsetDateTime) -> Result<FailureOutcome> {
    let mut stmt = conn.prepare_cached(
        r##"SELECT id FROM jobs
            WHERE state = 'active'
              AND started_on IS NOT NULL
              AND started_on + expire_in * 1000 < $now"##,
    )?;

    let ids = stmt
        .query_and_then(named_params! { "$now": to_millis(now) }, |row| {
            let id: String = row.get(0).map_err(|e| Error::ColumnType(e, "id"))?;
            Uuid::parse_str(&id).map_err(|_| Error::DbInteract(format!("invalid job id {id}")))
        })?
        .collect::<Result<Vec<_>>>()?;

    if ids.is_empty() {
        return Ok(FailureOutcome::default());
    }

    fail_job_set(conn, &ids, Some(TIMEOUT_OUTPUT), now)
}

const ARCHIVE_CRITERIA: &str = r##"
    (state IN ('completed', 'cancelled') AND completed_on < $now - $interval)
    OR (state = 'failed' AND completed_on < $now - $failed_interval)
    OR (state IN ('created', 'retry') AND keep_until < $now)
"##;

/// Move aged terminal rows (and never-claimed rows past their retention) into
/// the archive table, copy first then delete, all inside the batch transaction.
fn do_archive_jobs(
    conn: &Connection,
    now: OffsetDateTime,
    archive_interval: Duration,
    archive_failed_interval: Duration,
) -> Result<u64> {
    let now_millis = to_millis(now);
    let interval_millis = archive_interval.as_millis() as i64;
    let failed_interval_millis = archive_failed_interval.as_millis() as i64;
    let params = named_params! {
        "$now": now_millis,
        "$interval": interval_millis,
        "$failed_interval": failed_interval_millis,
    };

    let mut copy_stmt = conn.prepare_cached(&format!(
        r##"INSERT INTO archived_jobs
            (id, name, priority, data, state, retry_limit, retry_count, retry_delay,
                retry_backoff, start_after, started_on, singleton_key, singleton_on,
                expire_in, created_on, completed_on, keep_until, output, dead_letter,
                policy, archived_on)
            SELECT id, name, priority, data, state, retry_limit, retry_count, retry_delay,
                retry_backoff, start_after, started_on, singleton_key, singleton_on,
                expire_in, created_on, completed_on, keep_until, output, dead_letter,
                policy, $now
            FROM jobs
            WHERE {ARCHIVE_CRITERIA}"##
    ))?;
    copy_stmt.execute(params)?;

    let mut delete_stmt =
        conn.prepare_cached(&format!("DELETE FROM jobs WHERE {ARCHIVE_CRITERIA}"))?;
    let archived = delete_stmt.execute(params)?;

    Ok(archived as u64)
}

fn do_drop_archive(conn: &Connection, now: OffsetDateTime, delete_after: Duration) -> Result<u64> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM archived_jobs WHERE archived_on < $now - $ttl")?;

    let dropped = stmt.execute(named_params! {
        "$now": to_millis(now),
        "$ttl": delete_after.as_millis() as i64,
    })?;

    Ok(dropped as u64)
}

pub(super) fn try_lease(conn: &Connection, args: TryLeaseArgs) -> DbOperationResult {
    let TryLeaseArgs {
        gate,
        interval,
        now,
        result_tx,
    } = args;

    let result = do_try_lease(conn, gate, interval, now);
    DbOperationResult::Flag(OperationResult::new(result, result_tx))
}

pub(super) fn expire_jobs(conn: &Connection, args: ExpireJobsArgs) -> DbOperationResult {
    let ExpireJobsArgs { now, result_tx } = args;

    let result = do_expire_jobs(conn, now);
    DbOperationResult::Failures(OperationResult::new(result, result_tx))
}

pub(super) fn archive_jobs(conn: &Connection, args: ArchiveArgs) -> DbOperationResult {
    let ArchiveArgs {
        now,
        archive_interval,
        archive_failed_interval,
        result_tx,
    } = args;

    let result = do_archive_jobs(conn, now, archive_interval, archive_failed_interval);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}

pub(super) fn drop_archive(conn: &Connection, args: DropArchiveArgs) -> DbOperationResult {
    let DropArchiveArgs {
        now,
        delete_after,
        result_tx,
    } = args;

    let result = do_drop_archive(conn, now, delete_after);
    DbOperationResult::Count(OperationResult::new(result, result_tx))
}
