use rusqlite::{named_params, Connection, OptionalExtension, Statement};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{DbOperationResult, OperationResult};
use crate::{
    job::{to_millis, NewJob},
    queues::QueuePolicy,
    validation, Error, Result,
};

pub(crate) struct SendJobArgs {
    pub job: NewJob,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<Option<Uuid>>>,
}

pub(crate) struct SendJobsArgs {
    pub jobs: Vec<NewJob>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<Vec<Uuid>>>,
}

/// A queue row's execution defaults, as consulted at insertion time.
pub(super) struct QueueDefaults {
    pub policy: QueuePolicy,
    pub retry_limit: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub expire_seconds: i64,
    pub retention_minutes: i64,
    pub dead_letter: Option<String>,
}

pub(super) fn resolve_queue(conn: &Connection, name: &str) -> Result<QueueDefaults> {
    let mut stmt = conn.prepare_cached(
        "SELECT policy, retry_limit, retry_delay, retry_backoff, \
         expire_seconds, retention_minutes, dead_letter \
         FROM queues WHERE name = ?1",
    )?;

    let row = stmt
        .query_row([name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })
        .optional()?
        .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

    Ok(QueueDefaults {
        policy: row.0.parse()?,
        retry_limit: row.1,
        retry_delay: row.2,
        retry_backoff: row.3,
        expire_seconds: row.4,
        retention_minutes: row.5,
        dead_letter: row.6,
    })
}

pub(super) const INSERT_JOB_QUERY: &str = r##"
    INSERT INTO jobs
    (id, name, priority, data, state, retry_limit, retry_count, retry_delay, retry_backoff,
        start_after, singleton_key, singleton_on, expire_in, created_on, keep_until,
        dead_letter, policy)
    VALUES
    ($id, $name, $priority, $data, 'created', $retry_limit, 0, $retry_delay, $retry_backoff,
        $start_after, $singleton_key, $singleton_on, $expire_in, $created_on, $keep_until,
        $dead_letter, $policy)
    ON CONFLICT DO NOTHING
"##;

/// A job with every column value resolved against its queue's defaults,
/// ready to insert.
pub(super) struct ResolvedJob {
    pub id: Uuid,
    pub name: String,
    pub priority: i16,
    pub data: Option<String>,
    pub retry_limit: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub start_after: i64,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<i64>,
    pub expire_in: i64,
    pub created_on: i64,
    pub keep_until: i64,
    pub dead_letter: Option<String>,
    pub policy: QueuePolicy,
}

pub(super) fn resolve_new_job(conn: &Connection, job: &NewJob, now_millis: i64) -> Result<ResolvedJob> {
    let defaults = resolve_queue(conn, &job.queue)?;

    let data = job
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::Payload)?;

    // Singleton admission keys: explicit key first, then a throttle key derived
    // from the queue name when only a bucket width was given, then a
    // policy-derived key for non-standard queues.
    let singleton_key = job.singleton_key.clone().or_else(|| {
        if job.singleton_seconds.is_some() {
            Some(format!("throttle_{}", job.queue))
        } else if defaults.policy != QueuePolicy::Standard {
            Some(format!("__{}", defaults.policy.as_str()))
        } else {
            None
        }
    });

    let singleton_on = job
        .singleton_seconds
        .map(|seconds| validation::singleton_bucket(now_millis, seconds));

    let retention_millis = job
        .retain_for
        .map(|d| d.as_millis() as i64)
        .unwrap_or(defaults.retention_minutes * 60 * 1000);

    Ok(ResolvedJob {
        id: job.id.unwrap_or_else(Uuid::new_v4),
        name: job.queue.to_string(),
        priority: job.priority,
        data,
        retry_limit: job.retry_limit.unwrap_or(defaults.retry_limit),
        retry_delay: job.retry_delay.unwrap_or(defaults.retry_delay),
        retry_backoff: job.retry_backoff.unwrap_or(defaults.retry_backoff),
        start_after: job.start_after.map(to_millis).unwrap_or(now_millis),
        singleton_key,
        singleton_on,
        expire_in: job
            .expire_in
            .map(|d| d.as_secs() as i64)
            .unwrap_or(defaults.expire_seconds),
        created_on: now_millis,
        keep_until: now_millis + retention_millis,
        dead_letter: job.dead_letter.clone().or(defaults.dead_letter),
        policy: defaults.policy,
    })
}

/// Insert one resolved row. Returns `None` when the singleton unique index
/// absorbed the insert; a conflict is not an error.
pub(super) fn insert_resolved(stmt: &mut Statement, row: &ResolvedJob) -> Result<Option<Uuid>> {
    let changed = stmt.execute(named_params! {
        "$id": row.id.to_string(),
        "$name": row.name,
        "$priority": row.priority,
        "$data": row.data,
        "$retry_limit": row.retry_limit,
        "$retry_delay": row.retry_delay,
        "$retry_backoff": row.retry_backoff,
        "$start_after": row.start_after,
        "$singleton_key": row.singleton_key,
        "$singleton_on": row.singleton_on,
        "$expire_in": row.expire_in,
        "$created_on": row.created_on,
        "$keep_until": row.keep_until,
        "$dead_letter": row.dead_letter,
        "$policy": row.policy.as_str(),
    })?;

    Ok((changed == 1).then_some(row.id))
}

fn do_send_job(conn: &Connection, job: &NewJob, now: OffsetDateTime) -> Result<Option<Uuid>> {
    let resolved = resolve_new_job(conn, job, to_millis(now))?;
    let mut stmt = conn.prepare_cached(INSERT_JOB_QUERY)?;
    insert_resolved(&mut stmt, &resolved)
}

pub(super) fn send_job(conn: &Connection, args: SendJobArgs) -> DbOperationResult {
    let SendJobArgs {
        job,
        now,
        result_tx,
    } = args;

    let result = do_send_job(conn, &job, now);
    DbOperationResult::OptionalId(OperationResult::new(result, result_tx))
}

fn do_send_jobs(conn: &Connection, jobs: &[NewJob], now: OffsetDateTime) -> Result<Vec<Uuid>> {
    let now_millis = to_millis(now);
    let mut stmt = conn.prepare_cached(INSERT_JOB_QUERY)?;

    let mut ids = Vec::with_capacity(jobs.len());
    for job in jobs {
        let resolved = resolve_new_job(conn, job, now_millis)?;
        if let Some(id) = insert_resolved(&mut stmt, &resolved)? {
            ids.push(id);
        }
    }

    Ok(ids)
}

pub(super) fn send_jobs(conn: &Connection, args: SendJobsArgs) -> DbOperationResult {
    let SendJobsArgs {
        jobs,
        now,
        result_tx,
    } = args;

    let result = do_send_jobs(conn, &jobs, now);
    DbOperationResult::Ids(OperationResult::new(result, result_tx))
}
