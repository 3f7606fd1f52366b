use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Error, UserId};

/// One inbound TCP session, from accept to disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub id: Uuid,
    pub peer_addr: String,
    pub helo_name: Option<String>,
    pub used_tls: bool,
    pub authenticated_user_id: Option<UserId>,
    pub commands_received: i32,
    pub bytes_received: i64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ConnectionLogRepository {
    pool: PgPool,
}

impl ConnectionLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn open(&self, peer_addr: &str) -> Result<ConnectionLog, Error> {
        sqlx::query_as!(
            ConnectionLog,
            r#"
            INSERT INTO connections
                (id, peer_addr, helo_name, used_tls, authenticated_user_id, commands_received,
                 bytes_received, connected_at, disconnected_at)
            VALUES (gen_random_uuid(), $1, NULL, false, NULL, 0, 0, now(), NULL)
            RETURNING id, peer_addr, helo_name, used_tls, authenticated_user_id, commands_received,
                      bytes_received, connected_at, disconnected_at
            "#,
            peer_addr,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn close(
        &self,
        id: Uuid,
        helo_name: Option<&str>,
        used_tls: bool,
        authenticated_user_id: Option<UserId>,
        commands_received: i32,
        bytes_received: i64,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE connections
            SET helo_name = $2, used_tls = $3, authenticated_user_id = $4,
                commands_received = $5, bytes_received = $6, disconnected_at = now()
            WHERE id = $1
            "#,
            id,
            helo_name,
            used_tls,
            authenticated_user_id.map(|id| *id),
            commands_received,
            bytes_received,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
