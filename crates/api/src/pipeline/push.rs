//! Push fanout consumer
//!
//! Consumes `push.task` and notifies offline recipients through a [`PushNotifier`].
//! Pushes are best-effort: a notifier failure is logged to `push_log` and the task is
//! acked. Only store failures requeue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_shared::{GatewayResult, PushStatus, PushTask};
use serde_json::json;

use crate::queue::{Envelope, EnvelopeHandler};
use crate::store::PushLog;

/// Maximum characters of message content included in a notification preview
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("push endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Channel name recorded in `push_log`
    fn channel(&self) -> &'static str;

    async fn notify(&self, task: &PushTask) -> Result<(), PushError>;
}

/// POSTs a JSON notification to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let mut short: String = content.chars().take(PREVIEW_CHARS).collect();
    short.push('…');
    short
}

#[async_trait]
impl PushNotifier for WebhookNotifier {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, task: &PushTask) -> Result<(), PushError> {
        let payload = json!({
            "user_id": task.user_id,
            "message_id": task.message_id,
            "sender_id": task.sender_id,
            "conversation_id": task.conversation_id,
            "preview": preview(&task.content),
            "timestamp": task.timestamp.unix_timestamp(),
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Logs instead of notifying. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, task: &PushTask) -> Result<(), PushError> {
        tracing::info!(
            user_id = %task.user_id,
            message_id = task.message_id,
            sender_id = %task.sender_id,
            "Push notification (log only)"
        );
        Ok(())
    }
}

pub struct PushConsumer {
    notifier: Arc<dyn PushNotifier>,
    log: Arc<dyn PushLog>,
}

impl PushConsumer {
    pub fn new(notifier: Arc<dyn PushNotifier>, log: Arc<dyn PushLog>) -> Self {
        Self { notifier, log }
    }
}

#[async_trait]
impl EnvelopeHandler for PushConsumer {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn handle(&self, envelope: &Envelope) -> GatewayResult<()> {
        let task: PushTask = envelope.decode()?;
        let channel = self.notifier.channel();

        if self.log.already_pushed(&task.user_id, task.message_id).await? {
            tracing::debug!(
                user_id = %task.user_id,
                message_id = task.message_id,
                "Push already delivered, skipping"
            );
            return self
                .log
                .record_push(&task, channel, PushStatus::Skipped, None)
                .await;
        }

        match self.notifier.notify(&task).await {
            Ok(()) => {
                tracing::debug!(user_id = %task.user_id, message_id = task.message_id, "Push sent");
                self.log
                    .record_push(&task, channel, PushStatus::Success, None)
                    .await
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %task.user_id,
                    message_id = task.message_id,
                    error = %e,
                    "Push failed"
                );
                let detail = e.to_string();
                self.log
                    .record_push(&task, channel, PushStatus::Failed, Some(&detail))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{settle, Disposition, PUSH_TASK_KEY};
    use crate::store::MemoryStore;
    use time::OffsetDateTime;

    fn task(message_id: i64) -> PushTask {
        PushTask {
            user_id: "bob".into(),
            message_id,
            sender_id: "alice".into(),
            content: "hi".into(),
            conversation_id: "alice_bob".into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn envelope(task: &PushTask) -> Envelope {
        Envelope {
            routing_key: PUSH_TASK_KEY.into(),
            payload: serde_json::to_vec(task).unwrap(),
            redelivered: false,
        }
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(150);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS + 1);
    }

    #[tokio::test]
    async fn test_webhook_success_recorded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/push")
            .match_body(mockito::Matcher::PartialJson(json!({"user_id": "bob", "message_id": 7})))
            .with_status(200)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(WebhookNotifier::new(format!("{}/push", server.url())));
        let consumer = PushConsumer::new(notifier, store.clone());

        consumer.handle(&envelope(&task(7))).await.unwrap();

        mock.assert_async().await;
        let log = store.push_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, PushStatus::Success);
        assert_eq!(log[0].channel, "webhook");
    }

    #[tokio::test]
    async fn test_webhook_failure_recorded_and_acked() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/push")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(WebhookNotifier::new(format!("{}/push", server.url())));
        let consumer = PushConsumer::new(notifier, store.clone());

        assert_eq!(settle(&consumer, &envelope(&task(8))).await, Disposition::Ack);

        let log = store.push_log();
        assert_eq!(log[0].status, PushStatus::Failed);
        assert!(log[0].error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn test_redelivered_task_not_pushed_twice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/push")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(WebhookNotifier::new(format!("{}/push", server.url())));
        let consumer = PushConsumer::new(notifier, store.clone());

        consumer.handle(&envelope(&task(9))).await.unwrap();
        consumer.handle(&envelope(&task(9))).await.unwrap();

        mock.assert_async().await;
        let statuses: Vec<_> = store.push_log().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![PushStatus::Success, PushStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_store_outage_requeues() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let consumer = PushConsumer::new(Arc::new(LogNotifier), store);

        assert_eq!(settle(&consumer, &envelope(&task(10))).await, Disposition::Requeue);
    }
}
