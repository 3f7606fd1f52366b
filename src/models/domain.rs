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
pub struct DomainId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "dmarc_policy", rename_all = "lowercase")]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

/// A local sending domain: its identity on the wire and its DKIM key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub dkim_selector: String,
    pub dkim_private_key: String,
    pub dkim_public_key: String,
    pub dmarc_policy: Option<DmarcPolicy>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DomainRepository {
    pool: PgPool,
}

impl DomainRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        dkim_selector: &str,
        dkim_private_key: &str,
        dkim_public_key: &str,
    ) -> Result<Domain, Error> {
        sqlx::query_as!(
            Domain,
            r#"
            INSERT INTO domains (id, name, dkim_selector, dkim_private_key, dkim_public_key, dmarc_policy, active)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, NULL, true)
            RETURNING id, name, dkim_selector, dkim_private_key, dkim_public_key,
                      dmarc_policy as "dmarc_policy: _", active, created_at
            "#,
            name,
            dkim_selector,
            dkim_private_key,
            dkim_public_key,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, Error> {
        sqlx::query_as!(
            Domain,
            r#"
            SELECT id, name, dkim_selector, dkim_private_key, dkim_public_key,
                   dmarc_policy as "dmarc_policy: _", active, created_at
            FROM domains
            WHERE name = $1
            "#,
            name,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn is_local_domain(&self, name: &str) -> Result<bool, Error> {
        Ok(self
            .find_by_name(name)
            .await?
            .is_some_and(|domain| domain.active))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("domains")))]
    async fn finds_active_domain_by_name(pool: PgPool) {
        let repo = DomainRepository::new(pool);
        let domain = repo
            .find_by_name("example.com")
            .await
            .unwrap()
            .expect("fixture domain should exist");
        assert!(domain.active);
        assert_eq!(domain.dkim_selector, "default");
    }

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("domains")))]
    async fn unknown_domain_is_not_local(pool: PgPool) {
        let repo = DomainRepository::new(pool);
        assert!(!repo.is_local_domain("not-registered.example").await.unwrap());
    }
}
