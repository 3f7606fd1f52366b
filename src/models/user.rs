use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deref, Display, From, FromStr, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct UserId(Uuid);

/// An authenticated sender. `cram_secret`, when present, is the reversible
/// shared secret used only by CRAM-MD5 challenge/response; PLAIN and LOGIN
/// never consult it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub cram_secret: Option<String>,
    pub message_quota: i32,
    pub messages_sent_today: i32,
    pub storage_quota: i64,
    pub failed_auth_attempts: i32,
    pub last_failed_auth: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        message_quota: i32,
        storage_quota: i64,
    ) -> Result<User, Error> {
        sqlx::query_as!(
            User,
            r#"
            INSERT INTO users (id, username, email, password_hash, cram_secret, message_quota,
                                messages_sent_today, storage_quota, failed_auth_attempts,
                                last_failed_auth, last_login, is_active)
            VALUES (gen_random_uuid(), $1, $2, $3, NULL, $4, 0, $5, 0, NULL, NULL, true)
            RETURNING id, username, email, password_hash, cram_secret, message_quota,
                      messages_sent_today, storage_quota, failed_auth_attempts,
                      last_failed_auth, last_login, is_active, created_at, updated_at
            "#,
            username,
            email,
            password_hash,
            message_quota,
            storage_quota,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Looks a user up by username or email, as the reference authenticator does.
    pub async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, Error> {
        sqlx::query_as!(
            User,
            r#"
            SELECT id, username, email, password_hash, cram_secret, message_quota,
                   messages_sent_today, storage_quota, failed_auth_attempts,
                   last_failed_auth, last_login, is_active, created_at, updated_at
            FROM users
            WHERE (username = $1 OR email = $1) AND is_active
            "#,
            identifier,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn record_auth_success(&self, id: UserId) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE users
            SET failed_auth_attempts = 0, last_login = now(), updated_at = now()
            WHERE id = $1
            "#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_auth_failure(&self, id: UserId) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE users
            SET failed_auth_attempts = failed_auth_attempts + 1,
                last_failed_auth = now(),
                updated_at = now()
            WHERE id = $1
            "#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_lockout(&self, id: UserId) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE users SET failed_auth_attempts = 0, updated_at = now() WHERE id = $1"#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upgrades a verified legacy SHA-256 hash to bcrypt in place.
    pub async fn upgrade_password_hash(&self, id: UserId, bcrypt_hash: &str) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1"#,
            *id,
            bcrypt_hash,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_message_count(&self, id: UserId) -> Result<(), Error> {
        sqlx::query!(
            r#"UPDATE users SET messages_sent_today = messages_sent_today + 1 WHERE id = $1"#,
            *id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_daily_quotas(&self) -> Result<(), Error> {
        sqlx::query!(r#"UPDATE users SET messages_sent_today = 0"#)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("users")))]
    async fn finds_user_by_username_or_email(pool: PgPool) {
        let repo = UserRepository::new(pool);
        assert!(repo.find_by_identifier("alice").await.unwrap().is_some());
        assert!(
            repo.find_by_identifier("alice@example.com")
                .await
                .unwrap()
                .is_some()
        );
        assert!(repo.find_by_identifier("nobody").await.unwrap().is_none());
    }

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("users")))]
    async fn success_resets_failure_counter(pool: PgPool) {
        let repo = UserRepository::new(pool);
        let user = repo.find_by_identifier("alice").await.unwrap().unwrap();
        repo.record_auth_failure(user.id).await.unwrap();
        repo.record_auth_failure(user.id).await.unwrap();
        repo.record_auth_success(user.id).await.unwrap();
        let user = repo.find_by_identifier("alice").await.unwrap().unwrap();
        assert_eq!(user.failed_auth_attempts, 0);
        assert!(user.last_login.is_some());
    }
}
