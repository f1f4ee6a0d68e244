use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::KeyRepository;
use crate::error::{from_sqlx, Error, ErrorKind};
use crate::models::{Key, KeyKind, Role};

#[derive(Debug, FromRow)]
struct KeyRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: i16,
    issuer: String,
    subject: String,
    user_id: String,
    domain_id: String,
    role: i16,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<KeyRow> for Key {
    type Error = Error;

    fn try_from(row: KeyRow) -> Result<Self, Self::Error> {
        let invalid = |what: &str| {
            Error::wrap(
                ErrorKind::ViewEntity,
                Error::new(ErrorKind::MalformedEntity).with_context(format!("stored {what}")),
            )
        };
        let kind = u32::try_from(row.kind)
            .ok()
            .and_then(KeyKind::from_u32)
            .ok_or_else(|| invalid("key type"))?;
        let role = u32::try_from(row.role)
            .ok()
            .and_then(Role::from_u32)
            .ok_or_else(|| invalid("role"))?;

        Ok(Key {
            id: row.id,
            kind,
            issuer: row.issuer,
            subject: row.subject,
            user: row.user_id,
            domain: row.domain_id,
            role,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Clone)]
pub struct PgKeyRepository {
    pool: PgPool,
}

impl PgKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyRepository for PgKeyRepository {
    async fn save(&self, key: &Key) -> Result<String, Error> {
        let id = if key.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            key.id.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO keys (id, type, issuer, subject, user_id, domain_id, role, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&id)
        .bind(key.kind.as_u32() as i16)
        .bind(&key.issuer)
        .bind(&key.subject)
        .bind(&key.user)
        .bind(&key.domain)
        .bind(key.role.as_u32() as i16)
        .bind(key.issued_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

        Ok(id)
    }

    async fn retrieve(&self, issuer: &str, id: &str) -> Result<Key, Error> {
        let row = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT id, type, issuer, subject, user_id, domain_id, role, issued_at, expires_at
            FROM keys WHERE issuer = $1 AND id = $2
            "#,
        )
        .bind(issuer)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        row.try_into()
    }

    async fn remove(&self, issuer: &str, id: &str) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM keys WHERE issuer = $1 AND id = $2")
            .bind(issuer)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::wrap(
                ErrorKind::RemoveEntity,
                Error::new(ErrorKind::NotFound),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{create_pool, run_migrations};
    use chrono::Duration;

    async fn repo() -> PgKeyRepository {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/tenant_auth_test".to_string());
        let pool = create_pool(&DatabaseConfig {
            url,
            max_connections: 2,
            min_connections: 1,
        })
        .await
        .expect("database");
        run_migrations(&pool).await.expect("migrations");
        PgKeyRepository::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_save_retrieve_remove() {
        let repo = repo().await;
        let mut key = Key::new(KeyKind::Api);
        key.issuer = Uuid::new_v4().to_string();
        key.subject = key.issuer.clone();
        key.expires_at = Some(key.issued_at + Duration::days(1));

        let id = repo.save(&key).await.unwrap();
        assert!(!id.is_empty());

        let stored = repo.retrieve(&key.issuer, &id).await.unwrap();
        assert_eq!(stored.kind, KeyKind::Api);
        assert_eq!(stored.subject, key.subject);

        key.id = id.clone();
        let dup = repo.save(&key).await.unwrap_err();
        assert!(dup.contains(ErrorKind::Conflict));

        repo.remove(&key.issuer, &id).await.unwrap();
        let missing = repo.retrieve(&key.issuer, &id).await.unwrap_err();
        assert!(missing.contains(ErrorKind::NotFound));
        let again = repo.remove(&key.issuer, &id).await.unwrap_err();
        assert!(again.contains(ErrorKind::NotFound));
    }
}
