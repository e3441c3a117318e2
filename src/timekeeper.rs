//! Cron firing and clock-skew tracking.
//!
//! Every cron tick, one instance fleet-wide wins the `cron_on` lease and
//! evaluates all schedules. A schedule fires when its most recent cron moment
//! falls inside the window that just passed; because the lease interval equals
//! the window, each cron moment fires at most once across the fleet.
//!
//! The evaluation instant is corrected by the measured gap between database
//! time and local time, so instances with drifting clocks agree on which
//! window they are in.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

use crate::{
    db_writer::{
        maintenance::{LeaseGate, TryLeaseArgs},
        DbOperationType,
    },
    events::QueueEvent,
    scheduling::{Schedule, SCHEDULE_COLUMNS},
    shared_state::SharedState,
    validation, Error, Result,
};

/// Skew at or past this magnitude is worth an operator's attention.
const SKEW_WARNING: Duration = Duration::from_secs(60);

/// The smallest archive interval compatible with the one-minute cron window.
const MIN_CRON_ARCHIVE_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) fn start_timekeeper(state: &SharedState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(cron_loop(state.clone())),
        tokio::spawn(clock_monitor_loop(state.clone())),
    ]
}

#[instrument(skip_all)]
async fn cron_loop(state: SharedState) {
    if state.settings.archive_interval < MIN_CRON_ARCHIVE_INTERVAL {
        event!(
            Level::WARN,
            "Archive interval is under one minute; cron firing is disabled"
        );
        return;
    }

    let mut close_rx = state.close.clone();
    let mut ticker = tokio::time::interval(state.settings.cron_monitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.changed() => break,
        }

        match cron_tick(&state).await {
            Ok(Some(fired)) => {
                if fired > 0 {
                    event!(Level::DEBUG, fired, "Cron tick fired schedules");
                }
            }
            Ok(None) => {
                event!(Level::TRACE, "Another instance owns this cron tick");
            }
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, %e, "Cron tick failed");
            }
        }
    }
}

#[instrument(skip_all)]
async fn clock_monitor_loop(state: SharedState) {
    let mut close_rx = state.close.clone();
    let mut ticker = tokio::time::interval(state.settings.clock_monitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.changed() => break,
        }

        match measure_clock_skew(&state).await {
            Ok(skew_millis) => {
                state
                    .clock_skew_millis
                    .store(skew_millis, std::sync::atomic::Ordering::Relaxed);

                if skew_millis.unsigned_abs() >= SKEW_WARNING.as_millis() as u64 {
                    let seconds = skew_millis / 1000;
                    event!(Level::WARN, seconds, "Clock skew against database time");
                    state.events.emit(QueueEvent::ClockSkew { seconds });
                }
            }
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, %e, "Clock skew measurement failed");
            }
        }
    }
}

/// Database time minus local time, in milliseconds.
pub(crate) async fn measure_clock_skew(state: &SharedState) -> Result<i64> {
    let conn = state.read_conn_pool.get().await?;
    let db_millis: i64 = conn
        .interact(|conn| {
            conn.query_row(
                "SELECT CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
                [],
                |row| row.get(0),
            )
        })
        .await??;

    Ok(db_millis - state.time.now_millis())
}

/// One cron evaluation pass. Returns `None` when another instance owns the
/// window, otherwise how many schedules fired.
pub(crate) async fn cron_tick(state: &SharedState) -> Result<Option<usize>> {
    let window = state.settings.cron_monitor_interval;
    let leader = state
        .write_op(|result_tx| {
            DbOperationType::TryLease(TryLeaseArgs {
                gate: LeaseGate::Cron,
                interval: window,
                now: state.time.now(),
                result_tx,
            })
        })
        .await?;

    if !leader {
        return Ok(None);
    }

    let conn = state.read_conn_pool.get().await?;
    let schedules = conn
        .interact(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name"
            ))?;
            let rows = stmt
                .query_and_then([], |row| Schedule::from_row(row))?
                .collect::<Result<Vec<_>>>()?;
            Ok::<_, Error>(rows)
        })
        .await??;
    drop(conn);

    let now_millis = state.skewed_now_millis();
    let mut fired = 0;
    for schedule in schedules {
        match should_fire(&schedule.cron, &schedule.timezone, now_millis, window) {
            Ok(true) => {
                event!(Level::INFO, name = %schedule.name, cron = %schedule.cron, "Schedule fired");
                state.send_job(schedule.to_job()).await?;
                state.events.emit(QueueEvent::Schedule {
                    name: schedule.name.clone(),
                    cron: schedule.cron.clone(),
                    timezone: schedule.timezone.clone(),
                });
                fired += 1;
            }
            Ok(false) => {}
            // One bad row doesn't block the others.
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, name = %schedule.name, %e, "Skipping unevaluable schedule");
            }
        }
    }

    Ok(Some(fired))
}

/// Whether a cron expression has a firing moment inside `(now - window, now]`,
/// evaluated in the schedule's timezone.
pub(crate) fn should_fire(
    cron: &str,
    timezone: &str,
    now_millis: i64,
    window: Duration,
) -> Result<bool> {
    let schedule = validation::parse_cron(cron)?;
    let tz = validation::parse_timezone(timezone)?;

    let now = chrono::DateTime::from_timestamp_millis(now_millis)
        .ok_or(Error::TimestampOutOfRange("now"))?
        .with_timezone(&tz);
    let window_start = now - chrono::Duration::milliseconds(window.as_millis() as i64);

    let prev_fire = schedule
        .after(&window_start)
        .take_while(|moment| *moment <= now)
        .last();

    Ok(prev_fire.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(iso: &str) -> i64 {
        chrono::DateTime::parse_from_rfc3339(iso)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn fires_once_per_window() {
        let window = Duration::from_secs(60);

        // Every-minute cron fires in any window.
        assert!(should_fire("* * * * *", "UTC", millis("2024-03-01T12:00:30Z"), window).unwrap());

        // Daily-at-noon cron fires only in the window containing 12:00:00.
        let daily = "0 12 * * *";
        assert!(should_fire(daily, "UTC", millis("2024-03-01T12:00:30Z"), window).unwrap());
        assert!(!should_fire(daily, "UTC", millis("2024-03-01T12:02:30Z"), window).unwrap());
        assert!(!should_fire(daily, "UTC", millis("2024-03-01T11:59:30Z"), window).unwrap());
    }

    #[test]
    fn respects_timezone() {
        let window = Duration::from_secs(60);

        // Noon in New York is 17:00 UTC (March, EST -5... EDT -4 after the
        // second Sunday; 2024-03-01 is still EST).
        let daily = "0 12 * * *";
        assert!(should_fire(daily, "America/New_York", millis("2024-03-01T17:00:30Z"), window)
            .unwrap());
        assert!(!should_fire(daily, "America/New_York", millis("2024-03-01T12:00:30Z"), window)
            .unwrap());
    }

    #[test]
    fn rejects_bad_rows() {
        assert!(should_fire("bad", "UTC", 0, Duration::from_secs(60)).is_err());
        assert!(should_fire("* * * * *", "Nowhere/Here", 0, Duration::from_secs(60)).is_err());
    }
}

#[cfg(test)]
mod integration_tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{cron_tick, measure_clock_skew};
    use crate::{scheduling::ScheduleOptions, test_util::TestEnvironment};

    #[tokio::test]
    async fn cron_fires_once_per_lease_window() {
        let test = TestEnvironment::new().await;
        test.make_queue("ticker").await;
        test.queue
            .schedule(
                "ticker",
                "* * * * *",
                Some(json!({"from": "cron"})),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        let fired = cron_tick(&test.queue.state).await.unwrap();
        assert_eq!(fired, Some(1));
        assert_eq!(test.queue.get_queue_size("ticker").await.unwrap(), 1);

        let jobs = test.queue.fetch("ticker").await.unwrap();
        assert_eq!(jobs[0].data, Some(json!({"from": "cron"})));

        // The cron lease is held for the window; a second tick defers.
        let fired = cron_tick(&test.queue.state).await.unwrap();
        assert_eq!(fired, None);
    }

    #[tokio::test]
    async fn local_database_has_negligible_skew() {
        let test = TestEnvironment::new().await;
        let skew = measure_clock_skew(&test.queue.state).await.unwrap();
        assert!(skew.abs() < Duration::from_secs(5).as_millis() as i64);
    }
}
