use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Error, UserId};

/// Append-only record of every authentication attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationLog {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub username: String,
    pub remote_ip: String,
    pub auth_method: String,
    pub success: bool,
    pub reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthenticationLogRepository {
    pool: PgPool,
}

impl AuthenticationLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        user_id: Option<UserId>,
        username: &str,
        remote_ip: &str,
        auth_method: &str,
        success: bool,
        reason: Option<&str>,
    ) -> Result<AuthenticationLog, Error> {
        sqlx::query_as!(
            AuthenticationLog,
            r#"
            INSERT INTO authentication_log
                (id, user_id, username, remote_ip, auth_method, success, reason, attempted_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, now())
            RETURNING id, user_id, username, remote_ip, auth_method, success, reason, attempted_at
            "#,
            user_id.map(|id| *id),
            username,
            remote_ip,
            auth_method,
            success,
            reason,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn recent_failures(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let count = sqlx::query_scalar!(
            r#"
            SELECT count(*) as "count!"
            FROM authentication_log
            WHERE username = $1 AND NOT success AND attempted_at >= $2
            "#,
            username,
            since,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
