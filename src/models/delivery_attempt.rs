use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Error, MessageId};

/// One (message, target host) delivery try. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub mx_hostname: String,
    pub remote_ip: Option<String>,
    pub status_code: Option<i32>,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub success: bool,
    pub connection_time_ms: Option<i32>,
    pub delivery_time_ms: Option<i32>,
    pub tls_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct NewDeliveryAttempt {
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub mx_hostname: String,
    pub remote_ip: Option<String>,
    pub status_code: Option<i32>,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub success: bool,
    pub connection_time_ms: Option<i32>,
    pub delivery_time_ms: Option<i32>,
    pub tls_version: Option<String>,
    pub cipher_suite: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryAttemptRepository {
    pool: PgPool,
}

impl DeliveryAttemptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, attempt: &NewDeliveryAttempt) -> Result<DeliveryAttempt, Error> {
        sqlx::query_as!(
            DeliveryAttempt,
            r#"
            INSERT INTO delivery_attempts
                (id, message_id, attempt_number, mx_hostname, remote_ip, status_code, response,
                 error_message, success, connection_time_ms, delivery_time_ms, tls_version,
                 cipher_suite, attempted_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
            RETURNING id, message_id, attempt_number, mx_hostname, remote_ip, status_code,
                      response, error_message, success, connection_time_ms, delivery_time_ms,
                      tls_version, cipher_suite, attempted_at
            "#,
            *attempt.message_id,
            attempt.attempt_number,
            attempt.mx_hostname,
            attempt.remote_ip,
            attempt.status_code,
            attempt.response,
            attempt.error_message,
            attempt.success,
            attempt.connection_time_ms,
            attempt.delivery_time_ms,
            attempt.tls_version,
            attempt.cipher_suite,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn for_message(&self, message_id: MessageId) -> Result<Vec<DeliveryAttempt>, Error> {
        sqlx::query_as!(
            DeliveryAttempt,
            r#"
            SELECT id, message_id, attempt_number, mx_hostname, remote_ip, status_code,
                   response, error_message, success, connection_time_ms, delivery_time_ms,
                   tls_version, cipher_suite, attempted_at
            FROM delivery_attempts WHERE message_id = $1 ORDER BY attempted_at ASC
            "#,
            *message_id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }
}
