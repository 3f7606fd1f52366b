use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::Error;

/// A (sender_ip, sender_email, recipient_email) triple tracked for greylisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreylistEntry {
    pub id: Uuid,
    pub sender_ip: String,
    pub sender_email: String,
    pub recipient_email: String,
    pub first_seen: DateTime<Utc>,
    pub pass_count: i32,
    pub whitelisted: bool,
}

#[derive(Debug, Clone)]
pub struct GreylistRepository {
    pool: PgPool,
}

impl GreylistRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Checks the triple against `delay`. If it has never been seen, it is
    /// recorded and the call reports "not yet passed" (caller should `451`
    /// the transaction). If it has been seen before but `delay` hasn't
    /// elapsed since `first_seen`, it still reports "not yet passed" — a
    /// retry arriving too soon looks exactly like a spam bot's first
    /// attempt. Once `first_seen + delay` has passed (or the triple is
    /// whitelisted), it passes.
    pub async fn check_and_record(
        &self,
        sender_ip: &str,
        sender_email: &str,
        recipient_email: &str,
        delay: chrono::Duration,
    ) -> Result<bool, Error> {
        let existing = sqlx::query_as!(
            GreylistEntry,
            r#"
            SELECT id, sender_ip, sender_email, recipient_email, first_seen, pass_count, whitelisted
            FROM greylist
            WHERE sender_ip = $1 AND sender_email = $2 AND recipient_email = $3
            "#,
            sender_ip,
            sender_email,
            recipient_email,
        )
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(entry) if entry.whitelisted => Ok(true),
            Some(entry) if Utc::now() >= entry.first_seen + delay => {
                sqlx::query!(
                    r#"UPDATE greylist SET pass_count = pass_count + 1 WHERE id = $1"#,
                    entry.id,
                )
                .execute(&self.pool)
                .await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                sqlx::query!(
                    r#"
                    INSERT INTO greylist (id, sender_ip, sender_email, recipient_email, first_seen, pass_count, whitelisted)
                    VALUES (gen_random_uuid(), $1, $2, $3, now(), 0, false)
                    "#,
                    sender_ip,
                    sender_email,
                    recipient_email,
                )
                .execute(&self.pool)
                .await?;
                Ok(false)
            }
        }
    }
}
