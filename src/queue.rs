use std::{path::Path, sync::Arc, time::Duration};

use deadpool_sqlite::{Hook, HookError};
use rusqlite::{Connection, OpenFlags};
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

use crate::{
    config::QueueSettings,
    db_writer::{db_writer_worker, log_error, DbOperation, DbOperationType},
    error::*,
    events::{EventBus, QueueEvent},
    pending_jobs::monitor_pending_jobs,
    shared_state::{SharedState, SharedStateData},
    supervisor::start_supervisor,
    timekeeper::start_timekeeper,
    worker_list::{Pollers, WorkerSnapshot},
};

fn configure_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    rusqlite::vtab::array::load_module(conn)?;
    conn.trace(Some(|msg| {
        log::trace!("{}", msg);
    }));
    Ok(())
}

struct Tasks {
    close: tokio::sync::watch::Sender<()>,
    worker_count_rx: tokio::sync::watch::Receiver<usize>,
    _pending_jobs_monitor: JoinHandle<()>,
    db_write_worker: std::thread::JoinHandle<()>,
}

/// The queue itself: the database connections plus the tasks that watch
/// delayed jobs and run the background passes.
pub struct Queue {
    pub(crate) state: SharedState,
    tasks: std::sync::Mutex<Option<Tasks>>,
    monitors: std::sync::Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Queue {
    /// Open the queue database at the given path, creating it when missing.
    /// Use [QueueSettings] for anything beyond the defaults.
    pub async fn new(path: &Path) -> Result<Queue> {
        Queue::with_settings(QueueSettings::new(path).auto_create(true)).await
    }

    /// Create a settings builder for a queue at `path`.
    pub fn builder(path: &Path) -> QueueSettings {
        QueueSettings::new(path)
    }

    /// Open (or create, per the settings) the database, install or migrate the
    /// schema, and start the write loop and delayed-job monitor. Background
    /// supervision starts with [Queue::start].
    pub async fn with_settings(settings: QueueSettings) -> Result<Queue> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if settings.auto_create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = settings.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(Error::open_database)?;
                }
            }
        }

        let mut conn =
            Connection::open_with_flags(&settings.path, flags).map_err(Error::open_database)?;
        configure_connection(&mut conn).map_err(Error::open_database)?;

        crate::migrations::migrate(&mut conn)?;

        let (close_tx, close_rx) = tokio::sync::watch::channel(());

        let read_conn_pool = deadpool_sqlite::Config::new(&settings.path)
            .builder(deadpool_sqlite::Runtime::Tokio1)
            .map_err(Error::open_database)?
            .max_size(settings.pool_size)
            .recycle_timeout(Some(Duration::from_secs(5 * 60)))
            .post_create(Hook::async_fn(move |conn, _| {
                Box::pin(async move {
                    conn.interact(|conn| configure_connection(conn))
                        .await
                        .map_err(|e| HookError::Message(e.to_string().into()))?
                        .map_err(HookError::Backend)?;
                    Ok(())
                })
            }))
            .build()
            .map_err(Error::open_database)?;

        let (worker_count_tx, worker_count_rx) = tokio::sync::watch::channel(0);
        let (pending_jobs_tx, pending_jobs_rx) = tokio::sync::mpsc::channel(10);
        let (db_write_tx, db_write_rx) = tokio::sync::mpsc::channel(50);

        let shared_state = SharedState(Arc::new(SharedStateData {
            db_write_tx,
            read_conn_pool,
            pollers: tokio::sync::RwLock::new(Pollers::new(worker_count_tx)),
            close: close_rx,
            time: crate::shared_state::Time::new(),
            pending_jobs_tx,
            events: EventBus::new(),
            settings,
            clock_skew_millis: std::sync::atomic::AtomicI64::new(0),
        }));

        let db_write_worker = {
            let shared_state = shared_state.clone();
            std::thread::spawn(move || db_writer_worker(conn, shared_state, db_write_rx))
        };

        let pending_jobs_monitor =
            monitor_pending_jobs(shared_state.clone(), pending_jobs_rx).await?;

        let q = Queue {
            state: shared_state,
            tasks: std::sync::Mutex::new(Some(Tasks {
                close: close_tx,
                worker_count_rx,
                _pending_jobs_monitor: pending_jobs_monitor,
                db_write_worker,
            })),
            monitors: std::sync::Mutex::new(None),
        };

        Ok(q)
    }

    /// Start the supervisor and timekeeper loops. Calling this again (or from
    /// several tasks at once) is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        if monitors.is_some() {
            return Ok(());
        }

        event!(Level::INFO, "Starting background supervision");
        let mut handles = start_supervisor(&self.state);
        handles.extend(start_timekeeper(&self.state));
        *monitors = Some(handles);

        Ok(())
    }

    /// Subscribe to the queue's event stream.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.state.events.subscribe()
    }

    /// Point-in-time view of every registered poller.
    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.state.pollers.read().await.snapshots()
    }

    async fn wait_for_workers_to_stop(tasks: &mut Tasks, timeout: Duration) -> Result<()> {
        if *tasks.worker_count_rx.borrow_and_update() == 0 {
            return Ok(());
        }

        let timeout = tokio::time::sleep(timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => return Err(Error::Timeout),
                res = tasks.worker_count_rx.changed() => {
                    if res.is_err() || *tasks.worker_count_rx.borrow() == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn close_internal(mut tasks: Tasks, state: SharedState, timeout: Duration) -> Result<()> {
        state.events.emit(QueueEvent::Stop);
        tasks.close.send(()).ok();
        {
            let pollers = state.pollers.read().await;
            pollers.stop_all();
        }

        // Workers finish their in-flight batches; they are not preempted.
        let res = Self::wait_for_workers_to_stop(&mut tasks, timeout).await;

        state
            .db_write_tx
            .send(DbOperation {
                operation: DbOperationType::Close,
                span: tracing::Span::current(),
            })
            .await
            .ok();

        log_error(tokio::task::spawn_blocking(|| tasks.db_write_worker.join()).await);

        state.events.emit(QueueEvent::Stopped);
        event!(Level::INFO, "Queue stopped");

        res
    }

    /// Stop the queue: end the background loops, signal all workers, wait for
    /// in-flight batches to drain (bounded by the settings' shutdown timeout),
    /// then close the writer.
    pub async fn stop(&self) -> Result<()> {
        let timeout = self.state.settings.shutdown_timeout;
        self.stop_with_timeout(timeout).await
    }

    /// [Queue::stop] with an explicit drain timeout.
    #[instrument(skip(self))]
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<()> {
        let tasks = {
            let mut tasks_holder = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks_holder.take()
        };

        if let Some(tasks) = tasks {
            Self::close_internal(tasks, self.state.clone(), timeout).await?;
        }

        Ok(())
    }
}

impl Drop for Queue {
    /// Try to close the queue cleanly as it's dropped.
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tasks) = tasks.take() {
            let timeout = self.state.settings.shutdown_timeout;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(Self::close_internal(tasks, self.state.clone(), timeout));
            }
        }
    }
}
