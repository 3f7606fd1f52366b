use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Error, UserId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deref, Display, From, FromStr, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct MessageId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Default, Serialize, Deserialize)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Queued,
    Processing,
    Sent,
    Failed,
    Bounced,
}

/// One submitted email. `raw_message` is never mutated once accepted;
/// `attempts` only ever grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_id: String,
    pub user_id: Option<UserId>,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub headers: serde_json::Value,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_message: Vec<u8>,
    pub size: i64,
    pub status: MessageStatus,
    pub priority: i32,
    pub attempts: i32,
    pub next_retry: DateTime<Utc>,
    pub spf_result: Option<String>,
    pub dkim_result: Option<String>,
    pub dmarc_result: Option<String>,
    pub spam_score: Option<f64>,
    pub remote_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewMessage {
    pub message_id: String,
    pub user_id: Option<UserId>,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub headers: HashMap<String, String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_message: Vec<u8>,
    pub remote_ip: Option<String>,
    pub spf_result: Option<String>,
    pub dkim_result: Option<String>,
    pub dmarc_result: Option<String>,
    pub spam_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, message: &NewMessage) -> Result<Message, Error> {
        let headers = serde_json::to_value(&message.headers)?;
        let size = message.raw_message.len() as i64;
        sqlx::query_as!(
            Message,
            r#"
            INSERT INTO messages
                (id, message_id, user_id, mail_from, rcpt_to, headers, body_text, body_html,
                 raw_message, size, status, priority, attempts, next_retry,
                 spf_result, dkim_result, dmarc_result, spam_score, remote_ip)
            VALUES
                (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', 5, 0, now(),
                 $10, $11, $12, $13, $14)
            RETURNING id, message_id, user_id, mail_from, rcpt_to, headers, body_text, body_html,
                      raw_message, size, status as "status: _", priority, attempts, next_retry,
                      spf_result, dkim_result, dmarc_result, spam_score, remote_ip, created_at, updated_at
            "#,
            message.message_id,
            message.user_id.map(|id| *id),
            message.mail_from,
            &message.rcpt_to,
            headers,
            message.body_text,
            message.body_html,
            message.raw_message,
            size,
            message.spf_result,
            message.dkim_result,
            message.dmarc_result,
            message.spam_score,
            message.remote_ip,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, Error> {
        sqlx::query_as!(
            Message,
            r#"
            SELECT id, message_id, user_id, mail_from, rcpt_to, headers, body_text, body_html,
                   raw_message, size, status as "status: _", priority, attempts, next_retry,
                   spf_result, dkim_result, dmarc_result, spam_score, remote_ip, created_at, updated_at
            FROM messages WHERE id = $1
            "#,
            *id,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn mark_sent(&self, id: MessageId) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE messages SET status = 'sent', updated_at = now() WHERE id = $1"#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: MessageId) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE messages SET status = 'failed', updated_at = now() WHERE id = $1"#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claims up to `limit` ready messages (status `queued`,
    /// `next_retry` due) and marks them `processing`. Backs the queue's
    /// exclusive `dequeue`: `FOR UPDATE SKIP LOCKED` guarantees no two
    /// workers can claim the same row.
    pub async fn dequeue(&self, limit: i64) -> Result<Vec<Message>, Error> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query_scalar!(
            r#"
            SELECT id as "id: MessageId"
            FROM messages
            WHERE status = 'queued' AND next_retry <= now()
            ORDER BY priority ASC, created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            limit,
        )
        .fetch_all(&mut *tx)
        .await?;

        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = claimed.iter().map(|id| **id).collect();

        let messages = sqlx::query_as!(
            Message,
            r#"
            UPDATE messages
            SET status = 'processing', updated_at = now()
            WHERE id = ANY($1)
            RETURNING id, message_id, user_id, mail_from, rcpt_to, headers, body_text, body_html,
                      raw_message, size, status as "status: _", priority, attempts, next_retry,
                      spf_result, dkim_result, dmarc_result, spam_score, remote_ip, created_at, updated_at
            "#,
            &ids,
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(messages)
    }

    /// Requeues any message stuck `processing` for longer than `timeout`
    /// (its worker presumably died). Returns the requeued ids.
    pub async fn reap_stale(&self, timeout: chrono::Duration) -> Result<Vec<MessageId>, Error> {
        let cutoff = Utc::now() - timeout;
        let ids = sqlx::query_scalar!(
            r#"
            UPDATE messages
            SET status = 'queued', updated_at = now()
            WHERE status = 'processing' AND updated_at < $1
            RETURNING id as "id: MessageId"
            "#,
            cutoff,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn record_spam_score(&self, id: MessageId, score: f64) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE messages SET spam_score = $2 WHERE id = $1"#,
            *id,
            score,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_attempts(&self, id: MessageId) -> Result<i32, Error> {
        let attempts = sqlx::query_scalar!(
            r#"SELECT attempts FROM messages WHERE id = $1"#,
            *id,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Deletes terminal (`sent`, `failed`, `bounced`) messages older than
    /// `retention`, backing `message_retention_days`. Returns the number
    /// of rows removed.
    pub async fn purge_older_than(&self, retention: chrono::Duration) -> Result<u64, Error> {
        let cutoff = Utc::now() - retention;
        let result = sqlx::query!(
            r#"
            DELETE FROM messages
            WHERE status IN ('sent', 'failed', 'bounced') AND updated_at < $1
            "#,
            cutoff,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Bumps `attempts` (monotonically) and schedules the next retry.
    pub async fn record_retry(
        &self,
        id: MessageId,
        attempts: i32,
        next_retry: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE messages
            SET attempts = $2, next_retry = $3, status = 'queued', updated_at = now()
            WHERE id = $1
            "#,
            *id,
            attempts,
            next_retry,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> NewMessage {
        NewMessage {
            message_id: "<abc@mail.example.com>".to_owned(),
            user_id: None,
            mail_from: "john@example.com".to_owned(),
            rcpt_to: vec!["james@test.com".to_owned(), "jane@example.com".to_owned()],
            headers: HashMap::new(),
            body_text: Some("Hello world!".to_owned()),
            body_html: Some("<h1>Hello, world!</h1>".to_owned()),
            raw_message: b"From: john@example.com\r\n\r\nHello world!".to_vec(),
            remote_ip: Some("203.0.113.9".to_owned()),
            spf_result: None,
            dkim_result: None,
            dmarc_result: None,
            spam_score: None,
        }
    }

    #[sqlx::test]
    async fn create_and_find_round_trips(pool: PgPool) {
        let repo = MessageRepository::new(pool);
        let created = repo.create(&sample()).await.unwrap();
        assert_eq!(created.status, MessageStatus::Queued);
        assert_eq!(created.attempts, 0);

        let fetched = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.mail_from, "john@example.com");
        assert_eq!(fetched.rcpt_to.len(), 2);
    }

    #[sqlx::test]
    async fn attempts_never_decrease_across_retries(pool: PgPool) {
        let repo = MessageRepository::new(pool);
        let created = repo.create(&sample()).await.unwrap();

        repo.record_retry(created.id, 1, Utc::now()).await.unwrap();
        repo.record_retry(created.id, 2, Utc::now()).await.unwrap();
        let fetched = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.status, MessageStatus::Queued);
    }

    #[sqlx::test]
    async fn purge_removes_old_terminal_messages_only(pool: PgPool) {
        let repo = MessageRepository::new(pool);
        let sent = repo.create(&sample()).await.unwrap();
        repo.mark_sent(sent.id).await.unwrap();
        let still_queued = repo.create(&sample()).await.unwrap();

        let removed = repo.purge_older_than(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(removed, 1);

        assert!(repo.find_by_id(sent.id).await.unwrap().is_none());
        assert!(repo.find_by_id(still_queued.id).await.unwrap().is_some());
    }
}
