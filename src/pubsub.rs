//! Event fan-out: queues subscribe to named events, and publishing an event
//! sends one job per subscriber queue.

use tracing::instrument;
use uuid::Uuid;

use crate::{
    db_writer::{scheduling::SubscriptionArgs, DbOperationType},
    job::NewJob,
    validation, Error, Queue, Result,
};

impl Queue {
    /// Subscribe a queue to an event. Subscribing twice is a no-op.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, event: &str, queue: &str) -> Result<()> {
        validation::require_queue_name(event)?;
        validation::require_queue_name(queue)?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::Subscribe(SubscriptionArgs {
                    event: event.to_string(),
                    name: queue.to_string(),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Remove a queue's subscription to an event.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, event: &str, queue: &str) -> Result<()> {
        validation::require_queue_name(event)?;
        validation::require_queue_name(queue)?;

        self.state
            .write_op(|result_tx| {
                DbOperationType::Unsubscribe(SubscriptionArgs {
                    event: event.to_string(),
                    name: queue.to_string(),
                    now: self.state.time.now(),
                    result_tx,
                })
            })
            .await
    }

    /// Publish an event: enqueue one job carrying `data` per subscriber queue.
    /// Returns the inserted job ids.
    pub async fn publish(
        &self,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Vec<Uuid>> {
        let template = NewJob {
            data,
            ..NewJob::default()
        };
        self.publish_with(event, template).await
    }

    /// Publish an event using `template` for the per-subscriber jobs. The
    /// template's queue is replaced with each subscriber's.
    #[instrument(skip(self, template))]
    pub async fn publish_with(&self, event: &str, template: NewJob) -> Result<Vec<Uuid>> {
        validation::require_queue_name(event)?;

        let event_name = event.to_string();
        let conn = self.state.read_conn_pool.get().await?;
        let subscribers = conn
            .interact(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT name FROM subscriptions WHERE event = ?1 ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([&event_name], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, Error>(rows)
            })
            .await??;

        if subscribers.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = subscribers
            .into_iter()
            .map(|name| NewJob {
                queue: name.into(),
                id: None,
                ..template.clone()
            })
            .collect();

        self.state.send_jobs(jobs).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{test_util::TestEnvironment, Error};

    #[tokio::test]
    async fn publish_fans_out_to_subscribers() {
        let test = TestEnvironment::new().await;
        test.make_queue("inbox-a").await;
        test.make_queue("inbox-b").await;

        test.queue.subscribe("user.created", "inbox-a").await.unwrap();
        test.queue.subscribe("user.created", "inbox-b").await.unwrap();
        // Subscribing twice is a no-op.
        test.queue.subscribe("user.created", "inbox-a").await.unwrap();

        let ids = test
            .queue
            .publish("user.created", Some(json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(test.queue.get_queue_size("inbox-a").await.unwrap(), 1);
        assert_eq!(test.queue.get_queue_size("inbox-b").await.unwrap(), 1);

        let jobs = test.queue.fetch("inbox-a").await.unwrap();
        assert_eq!(jobs[0].data, Some(json!({"id": 7})));

        test.queue.unsubscribe("user.created", "inbox-b").await.unwrap();
        let ids = test.queue.publish("user.created", None).await.unwrap();
        assert_eq!(ids.len(), 1);
        // inbox-a's first copy was already claimed above; only the new one counts.
        assert_eq!(test.queue.get_queue_size("inbox-a").await.unwrap(), 1);
        assert_eq!(test.queue.get_queue_size("inbox-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_empty() {
        let test = TestEnvironment::new().await;
        let ids = test.queue.publish("nobody.cares", None).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn subscribing_a_missing_queue_fails() {
        let test = TestEnvironment::new().await;
        let result = test.queue.subscribe("some.event", "nowhere").await;
        assert!(matches!(result, Err(Error::QueueNotFound(name)) if name == "nowhere"));
    }
}
