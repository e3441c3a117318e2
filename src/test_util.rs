use std::{fmt::Display, ops::Deref, path::PathBuf, time::Duration};

use futures::Future;
use once_cell::sync::Lazy;
use temp_dir::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    config::QueueSettings, job::Job, shared_state::Time, JobState, Queue, QueueOptions,
};

pub struct TestQueue {
    queue: Queue,
    pub path: PathBuf,
    #[allow(dead_code)]
    dir: TempDir,
}

impl Deref for TestQueue {
    type Target = Queue;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

pub fn queue_db_path(dir: &TempDir) -> PathBuf {
    dir.child("test.sqlite")
}

pub async fn create_test_queue(dir: TempDir) -> TestQueue {
    let path = queue_db_path(&dir);
    let queue = QueueSettings::new(&path)
        .auto_create(true)
        .build()
        .await
        .unwrap();

    TestQueue { queue, path, dir }
}

pub(crate) struct TestEnvironment {
    pub queue: TestQueue,
    pub time: Time,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        Lazy::force(&TRACING);
        let dir = TempDir::new().unwrap();
        let queue = create_test_queue(dir).await;

        TestEnvironment {
            time: queue.state.time.clone(),
            queue,
        }
    }

    /// Create a queue with default options.
    pub async fn make_queue(&self, name: &str) -> &Self {
        self.queue
            .create_queue(name, QueueOptions::default())
            .await
            .expect("creating queue");
        self
    }
}

pub async fn wait_for<F, Fut, T, E>(label: impl Display, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    wait_for_timeout(label, Duration::from_secs(5), f).await
}

pub async fn wait_for_timeout<F, Fut, T, E>(label: impl Display, timeout: Duration, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_check = 1000;
    let mut check_interval = 10;
    let start_time = OffsetDateTime::now_utc();
    let final_time = start_time + timeout;
    let mut last_error: E;

    loop {
        tokio::task::yield_now().await;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::trace!(%label, %e, "Checking... not ready yet");
                last_error = e;
            }
        };

        let now = OffsetDateTime::now_utc();
        if now >= final_time {
            panic!(
                "Timed out waiting for {} after {}ms: {}",
                label,
                timeout.as_millis(),
                last_error
            );
        }

        check_interval = std::cmp::min(check_interval * 2, max_check);
        let sleep_time = std::cmp::min(
            (final_time - now).whole_milliseconds() as u64,
            check_interval,
        );

        tokio::time::sleep(Duration::from_millis(sleep_time)).await;
    }
}

pub async fn wait_for_job_state(
    label: impl Display,
    queue: &Queue,
    queue_name: &str,
    job_id: Uuid,
    desired_state: JobState,
) -> Job {
    wait_for(label, || async {
        let job = queue
            .get_job_by_id(queue_name, job_id, true)
            .await
            .expect("looking up job")
            .ok_or_else(|| "job not found".to_string())?;

        if job.state == desired_state {
            Ok(job)
        } else {
            Err(format!("job state {}", job.state))
        }
    })
    .await
}

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default().with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
