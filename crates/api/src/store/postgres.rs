//! Postgres-backed stores

use async_trait::async_trait;
use chatgate_shared::{
    ConversationSummary, GatewayResult, Message, OfflineIndexEntry, OfflineMessage, OfflinePage,
    PageRequest, PushStatus, PushTask, UnreadCount, UnreadSummary,
};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use super::{purge_cutoff, MessageStore, OfflineStore, PersistOutcome, PushLog, SyncedBatch};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn upsert_summary(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    target_id: &str,
    message: &Message,
    unread_increment: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO conversation
            (conversation_id, user_id, target_id, is_group, last_message, last_message_time, unread_count)
        VALUES ($1, $2, $3, FALSE, $4, $5, $6)
        ON CONFLICT (user_id, conversation_id) DO UPDATE SET
            last_message = EXCLUDED.last_message,
            last_message_time = EXCLUDED.last_message_time,
            unread_count = conversation.unread_count + $6,
            updated_at = NOW()
        "#,
    )
    .bind(&message.conversation_id)
    .bind(user_id)
    .bind(target_id)
    .bind(&message.content)
    .bind(message.timestamp)
    .bind(unread_increment)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl MessageStore for PgStore {
    async fn persist(&self, message: &Message) -> GatewayResult<PersistOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO message
                (id, conversation_id, sender_id, receiver_id, message_type, content, extra, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.message_type)
        .bind(&message.content)
        .bind(&message.extra)
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(PersistOutcome::Duplicate);
        }

        // Sender's unread count is unchanged, receiver's goes up by one
        if let Err(e) =
            upsert_summary(&mut tx, &message.sender_id, &message.receiver_id, message, 0).await
        {
            tx.rollback().await?;
            return Err(e.into());
        }
        if let Err(e) =
            upsert_summary(&mut tx, &message.receiver_id, &message.sender_id, message, 1).await
        {
            tx.rollback().await?;
            return Err(e.into());
        }

        tx.commit().await?;
        Ok(PersistOutcome::Inserted)
    }

    async fn summary(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> GatewayResult<Option<ConversationSummary>> {
        let summary = sqlx::query_as::<_, ConversationSummary>(
            r#"
            SELECT user_id, conversation_id, target_id, is_group, last_message,
                   last_message_time, unread_count
            FROM conversation
            WHERE user_id = $1 AND conversation_id = $2
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary)
    }

    async fn ping(&self) -> GatewayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OfflineStore for PgStore {
    async fn upsert_entry(
        &self,
        user_id: &str,
        message_id: i64,
        conversation_id: &str,
    ) -> GatewayResult<bool> {
        let created = sqlx::query(
            r#"
            INSERT INTO offline_message_index (user_id, message_id, conversation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, message_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(created > 0)
    }

    async fn entry(&self, user_id: &str, message_id: i64) -> GatewayResult<Option<OfflineIndexEntry>> {
        let entry = sqlx::query_as::<_, OfflineIndexEntry>(
            r#"
            SELECT user_id, message_id, conversation_id, created_at, synced, synced_at
            FROM offline_message_index
            WHERE user_id = $1 AND message_id = $2
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn list(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        page: PageRequest,
    ) -> GatewayResult<OfflinePage> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM offline_message_index
            WHERE user_id = $1 AND synced = FALSE
              AND ($2::TEXT IS NULL OR conversation_id = $2)
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;

        let messages = sqlx::query_as::<_, OfflineMessage>(
            r#"
            SELECT omi.message_id, omi.conversation_id, m.sender_id, m.content,
                   m.message_type, m.extra, m.timestamp, omi.created_at
            FROM offline_message_index omi
            JOIN message m ON m.id = omi.message_id
            WHERE omi.user_id = $1 AND omi.synced = FALSE
              AND ($2::TEXT IS NULL OR omi.conversation_id = $2)
            ORDER BY omi.created_at DESC, omi.message_id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(OfflinePage {
            messages,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn mark_synced(&self, user_id: &str, message_ids: &[i64]) -> GatewayResult<SyncedBatch> {
        if message_ids.is_empty() {
            return Ok(SyncedBatch::default());
        }

        let conversations: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE offline_message_index
            SET synced = TRUE, synced_at = NOW()
            WHERE user_id = $1 AND message_id = ANY($2) AND synced = FALSE
            RETURNING conversation_id
            "#,
        )
        .bind(user_id)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        let count = conversations.len() as u64;
        let mut conversation_ids = conversations;
        conversation_ids.sort();
        conversation_ids.dedup();
        Ok(SyncedBatch {
            count,
            conversation_ids,
        })
    }

    async fn unread_counts(&self, user_id: &str) -> GatewayResult<UnreadSummary> {
        let counts = sqlx::query_as::<_, UnreadCount>(
            r#"
            SELECT conversation_id, COUNT(*) AS count
            FROM offline_message_index
            WHERE user_id = $1 AND synced = FALSE
            GROUP BY conversation_id
            ORDER BY conversation_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(UnreadSummary::from_counts(counts))
    }

    async fn purge(&self, user_id: &str, older_than_days: i64) -> GatewayResult<u64> {
        let cutoff = purge_cutoff(OffsetDateTime::now_utc(), older_than_days)?;
        let deleted = sqlx::query(
            r#"
            DELETE FROM offline_message_index
            WHERE user_id = $1 AND synced = TRUE AND synced_at < $2
            "#,
        )
        .bind(user_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

#[async_trait]
impl PushLog for PgStore {
    async fn already_pushed(&self, user_id: &str, message_id: i64) -> GatewayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM push_log
                WHERE user_id = $1 AND message_id = $2 AND push_status = 'success'
            )
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_push(
        &self,
        task: &PushTask,
        channel: &str,
        status: PushStatus,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        let push_time = (status == PushStatus::Success).then(OffsetDateTime::now_utc);
        sqlx::query(
            r#"
            INSERT INTO push_log (user_id, message_id, push_type, push_status, push_time, error_msg)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&task.user_id)
        .bind(task.message_id)
        .bind(channel)
        .bind(status.as_str())
        .bind(push_time)
        .bind(error.unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_shared::{conversation_id, create_pool, run_migrations};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 2).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        PgStore::new(pool)
    }

    fn message(id: i64) -> Message {
        Message {
            id,
            conversation_id: conversation_id("pg-alice", "pg-bob"),
            sender_id: "pg-alice".into(),
            receiver_id: "pg-bob".into(),
            message_type: "text".into(),
            content: "hi".into(),
            extra: String::new(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_persist_is_idempotent() {
        let store = store().await;
        let id = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        let msg = message(id);

        let before = store
            .summary("pg-bob", &msg.conversation_id)
            .await
            .unwrap()
            .map(|s| s.unread_count)
            .unwrap_or(0);

        assert_eq!(store.persist(&msg).await.unwrap(), PersistOutcome::Inserted);
        assert_eq!(store.persist(&msg).await.unwrap(), PersistOutcome::Duplicate);

        let after = store
            .summary("pg-bob", &msg.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.unread_count, before + 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_offline_entry_lifecycle() {
        let store = store().await;
        let id = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        let msg = message(id);
        store.persist(&msg).await.unwrap();

        assert!(store.upsert_entry("pg-bob", id, &msg.conversation_id).await.unwrap());
        assert!(!store.upsert_entry("pg-bob", id, &msg.conversation_id).await.unwrap());

        assert_eq!(store.mark_synced("pg-bob", &[id]).await.unwrap().count, 1);
        assert_eq!(store.mark_synced("pg-bob", &[id]).await.unwrap().count, 0);
        assert!(store.entry("pg-bob", id).await.unwrap().unwrap().synced);
    }
}
