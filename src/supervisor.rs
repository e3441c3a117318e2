//! Periodic background passes: expire timed-out active jobs, archive aged
//! terminal rows, drop stale archive rows, and publish state counts.
//!
//! Each tick first takes the matching advisory lease on the `version` row, so
//! across every process sharing the database exactly one instance runs a given
//! pass per interval. A failed tick is reported and retried at the next
//! interval; nothing here is fatal.

use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

use crate::{
    db_writer::{
        maintenance::{
            ArchiveArgs, DropArchiveArgs, ExpireJobsArgs, LeaseGate, TryLeaseArgs,
        },
        DbOperationType,
    },
    events::{MaintenanceCounts, QueueEvent},
    job_status::count_states,
    shared_state::SharedState,
    Queue, Result,
};

pub(crate) fn start_supervisor(state: &SharedState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(maintenance_loop(state.clone())),
        tokio::spawn(monitor_loop(state.clone())),
    ]
}

#[instrument(skip_all)]
async fn maintenance_loop(state: SharedState) {
    let mut close_rx = state.close.clone();
    let mut ticker = tokio::time::interval(state.settings.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.changed() => break,
        }

        match maintenance_tick(&state).await {
            Ok(Some(counts)) => {
                event!(Level::DEBUG, ?counts, "Maintenance pass finished");
                state.events.emit(QueueEvent::Maintenance(counts));
            }
            Ok(None) => {
                event!(Level::TRACE, "Another instance owns this maintenance tick");
            }
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, %e, "Maintenance tick failed");
            }
        }
    }
}

#[instrument(skip_all)]
async fn monitor_loop(state: SharedState) {
    let mut close_rx = state.close.clone();
    let mut ticker = tokio::time::interval(state.settings.monitor_state_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.changed() => break,
        }

        match monitor_tick(&state).await {
            Ok(true) => {}
            Ok(false) => {
                event!(Level::TRACE, "Another instance owns this monitor tick");
            }
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, %e, "Monitor tick failed");
            }
        }
    }
}

pub(crate) async fn try_lease(
    state: &SharedState,
    gate: LeaseGate,
    interval: std::time::Duration,
) -> Result<bool> {
    state
        .write_op(|result_tx| {
            DbOperationType::TryLease(TryLeaseArgs {
                gate,
                interval,
                now: state.time.now(),
                result_tx,
            })
        })
        .await
}

async fn maintenance_tick(state: &SharedState) -> Result<Option<MaintenanceCounts>> {
    let leader = try_lease(
        state,
        LeaseGate::Maintenance,
        state.settings.maintenance_interval,
    )
    .await?;

    if !leader {
        return Ok(None);
    }

    run_maintenance(state).await.map(Some)
}

/// The three maintenance passes, in order: expire, archive, drop.
pub(crate) async fn run_maintenance(state: &SharedState) -> Result<MaintenanceCounts> {
    let expired = state
        .write_op(|result_tx| {
            DbOperationType::ExpireJobs(ExpireJobsArgs {
                now: state.time.now(),
                result_tx,
            })
        })
        .await?;

    // Expired jobs that kept a retry become claimable again after their delay.
    let now_millis = state.time.now_millis();
    for (queue, start_after) in &expired.retried {
        state.notify_for_queue(now_millis, *start_after, queue).await;
    }

    let archived = state
        .write_op(|result_tx| {
            DbOperationType::ArchiveJobs(ArchiveArgs {
                now: state.time.now(),
                archive_interval: state.settings.archive_interval,
                archive_failed_interval: state.settings.archive_failed_interval,
                result_tx,
            })
        })
        .await?;

    let dropped = state
        .write_op(|result_tx| {
            DbOperationType::DropArchive(DropArchiveArgs {
                now: state.time.now(),
                delete_after: state.settings.delete_after,
                result_tx,
            })
        })
        .await?;

    Ok(MaintenanceCounts {
        expired: expired.affected(),
        archived,
        dropped,
    })
}

async fn monitor_tick(state: &SharedState) -> Result<bool> {
    let leader = try_lease(
        state,
        LeaseGate::Monitor,
        state.settings.monitor_state_interval,
    )
    .await?;

    if !leader {
        return Ok(false);
    }

    let counts = count_states(state).await?;
    state.events.emit(QueueEvent::MonitorStates(counts));
    Ok(true)
}

impl Queue {
    /// Run the expire, archive, and drop passes right now, bypassing the
    /// maintenance lease. The background loop does the same thing on its
    /// interval.
    pub async fn maintain(&self) -> Result<MaintenanceCounts> {
        run_maintenance(&self.state).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use temp_dir::TempDir;

    use super::*;
    use crate::{
        test_util::TestEnvironment, JobState, NewJob, QueueEvent, QueueOptions, QueueSettings,
    };

    #[tokio::test]
    async fn expiration_fails_timed_out_jobs() {
        let test = TestEnvironment::new().await;
        test.queue
            .create_queue("slow", QueueOptions::default().retry_limit(0))
            .await
            .unwrap();

        let id = test
            .queue
            .send_job(
                NewJob::builder("slow".to_string())
                    .expire_in(Duration::from_secs(1))
                    .build(),
            )
            .await
            .unwrap()
            .unwrap();
        test.queue.fetch("slow").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let counts = test.queue.maintain().await.unwrap();
        assert_eq!(counts.expired, 1);

        let job = test
            .queue
            .get_job_by_id("slow", id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.output,
            Some(json!({"value": {"message": "job failed by timeout"}}))
        );
    }

    #[tokio::test]
    async fn expiration_leaves_live_jobs_alone() {
        let test = TestEnvironment::new().await;
        test.make_queue("fine").await;

        let id = test.queue.send("fine", json!({})).await.unwrap().unwrap();
        test.queue.fetch("fine").await.unwrap();

        let counts = test.queue.maintain().await.unwrap();
        assert_eq!(counts.expired, 0);

        let job = test
            .queue
            .get_job_by_id("fine", id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Active);
    }

    #[tokio::test]
    async fn archive_then_drop() {
        let dir = TempDir::new().unwrap();
        let queue = QueueSettings::new(dir.child("test.sqlite"))
            .auto_create(true)
            .archive_interval(Duration::ZERO)
            .archive_failed_interval(Duration::ZERO)
            .delete_after(Duration::ZERO)
            .build()
            .await
            .unwrap();
        queue
            .create_queue("short-lived", QueueOptions::default())
            .await
            .unwrap();

        let id = queue.send("short-lived", json!({})).await.unwrap().unwrap();
        queue.fetch("short-lived").await.unwrap();
        queue.complete(&[id], None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let counts = queue.maintain().await.unwrap();
        assert_eq!(counts.archived, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.maintain().await.unwrap();

        // Archived and then aged out entirely.
        assert!(queue
            .get_job_by_id("short-lived", id, true)
            .await
            .unwrap()
            .is_none());

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn leases_are_exclusive_per_interval() {
        let test = TestEnvironment::new().await;

        let first = try_lease(
            &test.queue.state,
            LeaseGate::Maintenance,
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        assert!(first);

        let second = try_lease(
            &test.queue.state,
            LeaseGate::Maintenance,
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        assert!(!second);

        // A different gate is unaffected.
        let monitor = try_lease(
            &test.queue.state,
            LeaseGate::Monitor,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(monitor);
    }

    #[tokio::test]
    async fn monitor_publishes_state_counts() {
        let test = TestEnvironment::new().await;
        test.make_queue("watched").await;
        test.queue.send("watched", json!({})).await.unwrap().unwrap();

        let mut events = test.queue.events();

        assert!(monitor_tick(&test.queue.state).await.unwrap());

        let event = events.recv().await.unwrap();
        match event {
            QueueEvent::MonitorStates(counts) => {
                assert_eq!(counts.total, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The lease is held, so the next tick defers.
        assert!(!monitor_tick(&test.queue.state).await.unwrap());
    }
}
