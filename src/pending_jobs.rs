//! Wakes pollers when a delayed job's `start_after` arrives, so jobs scheduled
//! into the future don't wait for the next poll interval.

use ahash::HashMap;
use rusqlite::params;
use time::OffsetDateTime;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, instrument, Level};

use crate::{error::Result, shared_state::SharedState, Error, SmartString};

/// A queue name and the unix-millisecond time its next delayed job becomes ready.
pub(crate) type PendingJob = (SmartString, i64);

enum NextTimeDisplay {
    Time(OffsetDateTime),
    Empty,
}

impl std::fmt::Display for NextTimeDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Time(t) => write!(f, "{}", t),
            Self::Empty => write!(f, "none"),
        }
    }
}

impl From<i64> for NextTimeDisplay {
    fn from(t: i64) -> Self {
        match crate::job::from_millis(t, "next_time") {
            Ok(t) => Self::Time(t),
            Err(_) => Self::Empty,
        }
    }
}

#[instrument(skip_all)]
pub(crate) async fn monitor_pending_jobs(
    queue: SharedState,
    pending_job_rx: mpsc::Receiver<PendingJob>,
) -> Result<JoinHandle<()>> {
    // Get the initial set of delayed jobs so we can wait for them.
    let now = queue.time.now_millis();
    let conn = queue.read_conn_pool.get().await?;
    let initial_pending = conn
        .interact(move |db| {
            let mut stmt = db.prepare(
                r##"
            SELECT name, MIN(start_after) AS start_after
            FROM jobs
            WHERE state IN ('created', 'retry') AND start_after > ?1
            GROUP BY name
            "##,
            )?;

            let rows = stmt
                .query_map(params![now], |row| {
                    let name = SmartString::from(row.get_ref(0)?.as_str()?);
                    Ok((name, row.get(1)?))
                })?
                .collect::<Result<Vec<PendingJob>, _>>()?;
            Ok::<_, Error>(rows)
        })
        .await??;

    let next_times = HashMap::from_iter(initial_pending);

    Ok(tokio::spawn(pending_jobs_task(
        queue,
        pending_job_rx,
        next_times,
    )))
}

#[instrument(level = "debug", skip(queue), fields(next_times))]
async fn get_next_times(
    queue: &SharedState,
    now: i64,
    queue_names: Vec<SmartString>,
) -> Result<Vec<PendingJob>> {
    let conn = queue.read_conn_pool.get().await?;

    let queue_names = queue_names
        .into_iter()
        .map(|s| rusqlite::types::Value::from(String::from(s)))
        .collect::<Vec<_>>();

    let next_times = conn
        .interact(move |db| {
            let mut stmt = db.prepare_cached(
                r##"
            SELECT name, MIN(start_after) AS start_after
            FROM jobs
            WHERE state IN ('created', 'retry') AND start_after > ?1 AND name IN rarray(?2)
            GROUP BY name
            "##,
            )?;

            let rows = stmt
                .query_map(params![now, std::rc::Rc::new(queue_names)], |row| {
                    let name = SmartString::from(row.get_ref(0)?.as_str()?);
                    Ok((name, row.get(1)?))
                })?
                .collect::<Result<Vec<PendingJob>, _>>()?;
            Ok::<_, Error>(rows)
        })
        .await??;

    tracing::Span::current().record("next_times", tracing::field::debug(&next_times));
    event!(Level::DEBUG, ?next_times);
    Ok(next_times)
}

async fn pending_jobs_task(
    queue: SharedState,
    mut pending_job_rx: mpsc::Receiver<PendingJob>,
    mut next_times: HashMap<SmartString, i64>,
) {
    let mut global_close_rx = queue.close.clone();
    loop {
        let next_time = next_times.values().copied().min().unwrap_or(0);

        if next_time > 0 {
            let next_time_pretty = NextTimeDisplay::from(next_time);
            event!(Level::TRACE, next_time=%next_time_pretty, "Waiting for delayed job");
        } else {
            event!(Level::TRACE, "No delayed jobs");
        }

        tokio::select! {
            _ = tokio::time::sleep_until(queue.time.instant_for_millis(next_time)), if next_time > 0 => {
                let now = queue.time.now_millis();

                let ready_queues = next_times
                    .iter()
                    .filter(|(_, &start_after)| start_after <= now)
                    .map(|(name, _)| name.clone())
                    .collect::<Vec<_>>();

                let pollers = queue.pollers.read().await;
                for name in &ready_queues {
                    event!(Level::DEBUG, queue=%name, "Notifying pollers of ready jobs");
                    next_times.remove(name);
                    pollers.new_job_available(name.as_str());
                }
                drop(pollers);

                match get_next_times(&queue, now, ready_queues).await {
                    Ok(new_next_times) => {
                        next_times.extend(new_next_times);
                    }
                    Err(e) => event!(Level::ERROR, err = %e, "Failed to fetch new times"),
                }
            }
            Some((name, start_after)) = pending_job_rx.recv() => {
                let start_after_pretty = NextTimeDisplay::from(start_after);
                event!(Level::DEBUG, queue=%name, start_after=%start_after_pretty, "Got delayed job");
                next_times.entry(name)
                    .and_modify(|ts| *ts = std::cmp::min(start_after, *ts))
                    .or_insert(start_after);
            }
            _ = global_close_rx.changed() => {
                break;
            }
        }
    }
}
