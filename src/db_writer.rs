//! The write side of the queue.
//!
//! SQLite allows one writer at a time, so all mutations are funneled through a
//! dedicated writer thread that drains an operation channel and executes each
//! batch inside a single `IMMEDIATE` transaction, with a savepoint per
//! operation so one failure doesn't poison the batch.
//!
//! Cross-process lock contention is resolved here and nowhere else: when the
//! batch transaction cannot acquire the write lock before the busy timeout,
//! pending claims complete with an empty batch and every other operation
//! reports [Error::LockContention].

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{event, instrument, Level, Span};
use uuid::Uuid;

use self::{
    cancel::{cancel_jobs, resume_jobs, CancelJobsArgs},
    complete::{complete_jobs, CompleteJobsArgs},
    delete::{delete_jobs, DeleteJobsArgs},
    fail::{fail_jobs, FailJobsArgs, FailureOutcome},
    fetch::{fetch_jobs, FetchJobsArgs},
    maintenance::{
        archive_jobs, drop_archive, expire_jobs, try_lease, ArchiveArgs, DropArchiveArgs,
        ExpireJobsArgs, TryLeaseArgs,
    },
    queues::{
        clear_storage, create_queue, delete_queue, purge_queue, update_queue, CreateQueueArgs,
        NameArgs,
    },
    retry::{retry_jobs, RetryJobsArgs},
    scheduling::{
        delete_schedule, subscribe, unsubscribe, upsert_schedule, SubscriptionArgs,
        UpsertScheduleArgs,
    },
    send_job::{send_job, send_jobs, SendJobArgs, SendJobsArgs},
};
use crate::{error::Result, job::Job, shared_state::SharedState, Error};

pub(crate) mod cancel;
pub(crate) mod complete;
pub(crate) mod delete;
pub(crate) mod fail;
pub(crate) mod fetch;
pub(crate) mod maintenance;
pub(crate) mod queues;
pub(crate) mod retry;
pub(crate) mod scheduling;
pub(crate) mod send_job;

pub(crate) fn log_error<T, E>(result: Result<T, E>)
where
    E: std::fmt::Debug,
{
    if let Err(e) = result {
        event!(Level::ERROR, ?e);
    }
}

pub(crate) fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

pub(crate) fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

pub(crate) struct DbOperation {
    pub operation: DbOperationType,
    pub span: tracing::Span,
}

pub(crate) enum DbOperationType {
    Close,
    SendJob(SendJobArgs),
    SendJobs(SendJobsArgs),
    FetchJobs(FetchJobsArgs),
    CompleteJobs(CompleteJobsArgs),
    FailJobs(FailJobsArgs),
    CancelJobs(CancelJobsArgs),
    ResumeJobs(CancelJobsArgs),
    RetryJobs(RetryJobsArgs),
    DeleteJobs(DeleteJobsArgs),
    CreateQueue(CreateQueueArgs),
    UpdateQueue(CreateQueueArgs),
    DeleteQueue(NameArgs),
    PurgeQueue(NameArgs),
    ClearStorage {
        result_tx: oneshot::Sender<Result<()>>,
    },
    Subscribe(SubscriptionArgs),
    Unsubscribe(SubscriptionArgs),
    UpsertSchedule(UpsertScheduleArgs),
    DeleteSchedule(NameArgs),
    TryLease(TryLeaseArgs),
    ExpireJobs(ExpireJobsArgs),
    ArchiveJobs(ArchiveArgs),
    DropArchive(DropArchiveArgs),
}

impl DbOperationType {
    /// Resolve an operation that never ran because the write lock could not be
    /// acquired. Claims are defined to see contention as an empty batch; every
    /// other operation surfaces it to its caller.
    fn resolve_contention(self) {
        match self {
            DbOperationType::Close => {}
            DbOperationType::FetchJobs(args) => {
                args.result_tx.send(Ok(Vec::new())).ok();
            }
            DbOperationType::SendJob(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::SendJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::CompleteJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::FailJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::CancelJobs(args) | DbOperationType::ResumeJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::RetryJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::DeleteJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::CreateQueue(args) | DbOperationType::UpdateQueue(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::DeleteQueue(args)
            | DbOperationType::PurgeQueue(args)
            | DbOperationType::DeleteSchedule(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::ClearStorage { result_tx } => {
                result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::Subscribe(args) | DbOperationType::Unsubscribe(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::UpsertSchedule(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::TryLease(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::ExpireJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::ArchiveJobs(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
            DbOperationType::DropArchive(args) => {
                args.result_tx.send(Err(Error::LockContention)).ok();
            }
        }
    }
}

pub(crate) struct OperationResult<T> {
    result: Result<T>,
    result_tx: oneshot::Sender<Result<T>>,
}

impl<T> OperationResult<T> {
    pub(crate) fn new(result: Result<T>, result_tx: oneshot::Sender<Result<T>>) -> Self {
        OperationResult { result, result_tx }
    }
}

pub(crate) enum DbOperationResult {
    Close,
    Empty(OperationResult<()>),
    Count(OperationResult<u64>),
    Flag(OperationResult<bool>),
    OptionalId(OperationResult<Option<Uuid>>),
    Ids(OperationResult<Vec<Uuid>>),
    Jobs(OperationResult<Vec<Job>>),
    Failures(OperationResult<FailureOutcome>),
}

impl DbOperationResult {
    fn is_ok(&self) -> bool {
        match self {
            DbOperationResult::Close => true,
            DbOperationResult::Empty(r) => r.result.is_ok(),
            DbOperationResult::Count(r) => r.result.is_ok(),
            DbOperationResult::Flag(r) => r.result.is_ok(),
            DbOperationResult::OptionalId(r) => r.result.is_ok(),
            DbOperationResult::Ids(r) => r.result.is_ok(),
            DbOperationResult::Jobs(r) => r.result.is_ok(),
            DbOperationResult::Failures(r) => r.result.is_ok(),
        }
    }

    fn send(self) {
        match self {
            DbOperationResult::Close => {}
            DbOperationResult::Empty(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::Count(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::Flag(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::OptionalId(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::Ids(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::Jobs(r) => {
                r.result_tx.send(r.result).ok();
            }
            DbOperationResult::Failures(r) => {
                r.result_tx.send(r.result).ok();
            }
        }
    }

    /// Replace a computed result whose enclosing transaction failed to commit.
    /// Claims still degrade to an empty batch under contention.
    fn abort(self, contended: bool) {
        fn err<T>(r: OperationResult<T>, contended: bool) {
            let e = if contended {
                Error::LockContention
            } else {
                Error::DbInteract("operation batch failed to commit".to_string())
            };
            r.result_tx.send(Err(e)).ok();
        }

        match self {
            DbOperationResult::Close => {}
            DbOperationResult::Empty(r) => err(r, contended),
            DbOperationResult::Count(r) => err(r, contended),
            DbOperationResult::Flag(r) => err(r, contended),
            DbOperationResult::OptionalId(r) => err(r, contended),
            DbOperationResult::Ids(r) => err(r, contended),
            DbOperationResult::Jobs(r) => {
                if contended {
                    r.result_tx.send(Ok(Vec::new())).ok();
                } else {
                    err(r, contended);
                }
            }
            DbOperationResult::Failures(r) => err(r, contended),
        }
    }
}

#[instrument(level = "trace", skip_all, fields(count = %operations.len()))]
fn process_operations(conn: &mut Connection, operations: &mut Vec<DbOperation>) -> Result<bool> {
    let mut results = Vec::with_capacity(operations.len());
    let mut closed = false;

    let mut tx = match conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate) {
        Ok(tx) => tx,
        Err(e) if is_busy(&e) => {
            for op in operations.drain(..) {
                let _span = op.span.enter();
                closed |= matches!(op.operation, DbOperationType::Close);
                op.operation.resolve_contention();
            }
            return Ok(closed);
        }
        Err(e) => return Err(e.into()),
    };

    for op in operations.drain(..) {
        let _span = op.span.enter();
        // Use savepoints within the batch to allow rollback as needed, but still a single
        // transaction for the whole batch since it's many times faster.
        match tx.savepoint() {
            Ok(mut sp) => {
                let result = match op.operation {
                    DbOperationType::Close => {
                        closed = true;
                        DbOperationResult::Close
                    }
                    DbOperationType::SendJob(args) => send_job(&sp, args),
                    DbOperationType::SendJobs(args) => send_jobs(&sp, args),
                    DbOperationType::FetchJobs(args) => fetch_jobs(&sp, args),
                    DbOperationType::CompleteJobs(args) => complete_jobs(&sp, args),
                    DbOperationType::FailJobs(args) => fail_jobs(&sp, args),
                    DbOperationType::CancelJobs(args) => cancel_jobs(&sp, args),
                    DbOperationType::ResumeJobs(args) => resume_jobs(&sp, args),
                    DbOperationType::RetryJobs(args) => retry_jobs(&sp, args),
                    DbOperationType::DeleteJobs(args) => delete_jobs(&sp, args),
                    DbOperationType::CreateQueue(args) => create_queue(&sp, args),
                    DbOperationType::UpdateQueue(args) => update_queue(&sp, args),
                    DbOperationType::DeleteQueue(args) => delete_queue(&sp, args),
                    DbOperationType::PurgeQueue(args) => purge_queue(&sp, args),
                    DbOperationType::ClearStorage { result_tx } => clear_storage(&sp, result_tx),
                    DbOperationType::Subscribe(args) => subscribe(&sp, args),
                    DbOperationType::Unsubscribe(args) => unsubscribe(&sp, args),
                    DbOperationType::UpsertSchedule(args) => upsert_schedule(&sp, args),
                    DbOperationType::DeleteSchedule(args) => delete_schedule(&sp, args),
                    DbOperationType::TryLease(args) => try_lease(&sp, args),
                    DbOperationType::ExpireJobs(args) => expire_jobs(&sp, args),
                    DbOperationType::ArchiveJobs(args) => archive_jobs(&sp, args),
                    DbOperationType::DropArchive(args) => drop_archive(&sp, args),
                };

                let worked = result.is_ok();
                results.push(result);

                if worked {
                    log_error(sp.commit());
                } else {
                    log_error(sp.rollback());
                }
            }
            Err(e) => {
                event!(Level::ERROR, %e, "failed to create savepoint");
            }
        }
    }

    match tx.commit() {
        Ok(()) => {
            for result in results {
                result.send();
            }
        }
        Err(e) => {
            let contended = is_busy(&e);
            event!(Level::ERROR, %e, "failed to commit operation batch");
            for result in results {
                result.abort(contended);
            }
        }
    }

    Ok(closed)
}

pub(crate) fn db_writer_worker(
    mut conn: Connection,
    state: SharedState,
    mut operations_rx: tokio::sync::mpsc::Receiver<DbOperation>,
) {
    const BATCH_SIZE: usize = 50;
    let mut operations = Vec::with_capacity(BATCH_SIZE);
    loop {
        operations.truncate(0);

        match operations_rx.blocking_recv() {
            Some(op) => operations.push(op),
            None => break,
        }

        // Get additional operations, if any are waiting.
        // This lets us process multiple operations in a batch for better efficiency.
        while operations.len() < BATCH_SIZE {
            match operations_rx.try_recv() {
                Ok(operation) => operations.push(operation),
                // Treat "empty" and "closed" as the same here. If it's closed then
                // we'll leave the loop next time around, after processing the last jobs below.
                Err(_) => break,
            }
        }

        match process_operations(&mut conn, &mut operations) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                state.events.error(&e);
                event!(Level::ERROR, %e);
            }
        }
    }

    log_error(conn.close().map_err(|(_, e)| e));
}

impl SharedState {
    /// Enqueue one operation for the writer thread and wait for its result.
    pub(crate) async fn write_op<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> DbOperationType,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.db_write_tx
            .send(DbOperation {
                operation: build(result_tx),
                span: Span::current(),
            })
            .await
            .map_err(|_| Error::QueueClosed)?;
        result_rx.await.map_err(|_| Error::QueueClosed)?
    }
}
