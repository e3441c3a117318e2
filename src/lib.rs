#![warn(missing_docs)]
//! A durable, SQLite-backed job queue.
//!
//! Producers send jobs to named queues; pollers claim batches atomically and
//! report completion or failure; background loops expire timed-out jobs,
//! archive finished ones, publish state counts, and fire cron schedules. The
//! database file is the single source of truth, so any number of processes can
//! cooperate through it without talking to each other.
//!
//! ```no_run
//! # use std::path::Path;
//! use serde_json::json;
//! use swift_queue::{Queue, QueueOptions, WorkOptions, Error};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let queue = Queue::new(Path::new("jobs.db")).await?;
//!     queue.start().await?;
//!
//!     queue.create_queue("emails", QueueOptions::default()).await?;
//!
//!     // Produce.
//!     let job_id = queue
//!         .send("emails", json!({ "to": "me@example.com" }))
//!         .await?;
//!     println!("sent {job_id:?}");
//!
//!     // Consume with a polling worker.
//!     let worker = queue
//!         .work("emails", WorkOptions::new().batch_size(5), |jobs| async move {
//!             for job in &jobs {
//!                 // deliver the email here
//!                 println!("handling {}", job.id);
//!             }
//!             Ok::<_, String>("delivered")
//!         })
//!         .await?;
//!
//!     // ...
//!
//!     worker.stop();
//!     queue.stop().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod db_writer;
mod error;
mod events;
mod job;
mod job_ops;
mod job_status;
mod migrations;
mod pending_jobs;
mod pubsub;
mod queue;
mod queues;
mod scheduling;
mod send_job;
mod shared_state;
mod supervisor;
#[cfg(test)]
mod test_util;
mod timekeeper;
mod validation;
mod worker;
mod worker_list;

pub use config::QueueSettings;
pub use error::{Error, Result};
pub use events::{MaintenanceCounts, QueueEvent, QueueStateCount, StateCounts};
pub use job::{Job, JobState, NewJob, NewJobBuilder};
pub use job_ops::FetchOptions;
pub use queue::Queue;
pub use queues::{QueueInfo, QueueOptions, QueuePolicy};
pub use scheduling::{Schedule, ScheduleOptions};
pub use worker::{WorkOptions, WorkerHandle};
pub use worker_list::{WorkerSnapshot, WorkerState};

pub(crate) type SmartString = smartstring::SmartString<smartstring::LazyCompact>;
