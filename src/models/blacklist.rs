use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "blacklist_entry_type", rename_all = "lowercase")]
pub enum BlacklistEntryType {
    Ip,
    Domain,
    Email,
}

/// A locally managed denylist entry, keyed by value and kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub entry_type: BlacklistEntryType,
    pub value: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlacklistRepository {
    pool: PgPool,
}

impl BlacklistRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add(
        &self,
        entry_type: BlacklistEntryType,
        value: &str,
        reason: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlacklistEntry, Error> {
        sqlx::query_as!(
            BlacklistEntry,
            r#"
            INSERT INTO blacklist (id, entry_type, value, reason, expires_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4)
            ON CONFLICT (entry_type, value) DO UPDATE
                SET reason = excluded.reason, expires_at = excluded.expires_at
            RETURNING id, entry_type as "entry_type: _", value, reason, expires_at, created_at
            "#,
            entry_type as BlacklistEntryType,
            value,
            reason,
            expires_at,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Checks whether `value` is currently blacklisted (not yet expired).
    pub async fn is_listed(
        &self,
        entry_type: BlacklistEntryType,
        value: &str,
    ) -> Result<bool, Error> {
        let found = sqlx::query_scalar!(
            r#"
            SELECT true as "found!"
            FROM blacklist
            WHERE entry_type = $1 AND value = $2 AND (expires_at IS NULL OR expires_at > now())
            "#,
            entry_type as BlacklistEntryType,
            value,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.unwrap_or(false))
    }
}
