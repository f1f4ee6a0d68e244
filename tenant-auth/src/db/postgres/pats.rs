use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::db::PatsRepository;
use crate::error::{from_sqlx, Error, ErrorKind};
use crate::models::domain::DEFAULT_LIMIT;
use crate::models::pat::ANY_IDS;
use crate::models::{
    DomainEntityType, OperationType, Pat, PatStatus, PatsPage, PatsPageMeta, PlatformEntityType,
    Scope, ScopesPage, SecretStatus,
};

const PAT_COLUMNS: &str = "id, user_id, name, description, secret, issued_at, expires_at, \
                           updated_at, last_used_at, revoked, revoked_at";

#[derive(Debug, FromRow)]
struct PatRow {
    id: String,
    user_id: String,
    name: String,
    description: String,
    secret: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    revoked: bool,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<PatRow> for Pat {
    fn from(row: PatRow) -> Self {
        Pat {
            id: row.id,
            user: row.user_id,
            name: row.name,
            description: row.description,
            secret: row.secret,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
            last_used_at: row.last_used_at,
            revoked: row.revoked,
            revoked_at: row.revoked_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ScopeRow {
    id: String,
    pat_id: String,
    platform_entity_type: String,
    optional_domain_id: String,
    optional_domain_entity_type: String,
    operation: String,
    entity_ids: Vec<String>,
}

impl TryFrom<ScopeRow> for Scope {
    type Error = Error;

    fn try_from(row: ScopeRow) -> Result<Self, Self::Error> {
        let domain_entity_type = match row.optional_domain_entity_type.as_str() {
            "" => None,
            other => Some(other.parse::<DomainEntityType>()?),
        };
        Ok(Scope {
            id: row.id,
            pat_id: row.pat_id,
            platform_entity_type: row.platform_entity_type.parse()?,
            domain_id: Some(row.optional_domain_id).filter(|d| !d.is_empty()),
            domain_entity_type,
            operation: row.operation.parse()?,
            entity_ids: row.entity_ids,
        })
    }
}

fn not_found(kind: ErrorKind) -> Error {
    Error::wrap(kind, Error::new(ErrorKind::NotFound))
}

#[derive(Clone)]
pub struct PgPatsRepository {
    pool: PgPool,
}

impl PgPatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_column(
        &self,
        user_id: &str,
        pat_id: &str,
        column: &'static str,
        value: &str,
    ) -> Result<Pat, Error> {
        let row = sqlx::query_as::<_, PatRow>(&format!(
            "UPDATE pats SET {column} = $3, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 RETURNING {PAT_COLUMNS}"
        ))
        .bind(pat_id)
        .bind(user_id)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        Ok(row.into())
    }

    async fn ensure_owner(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        pat_id: &str,
    ) -> Result<(), Error> {
        let owned: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pats WHERE id = $1 AND user_id = $2)")
                .bind(pat_id)
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        if !owned {
            return Err(not_found(ErrorKind::ViewEntity));
        }
        Ok(())
    }
}

fn push_scope_key(query: &mut QueryBuilder<'_, Postgres>, scope: &Scope) {
    query
        .push(" WHERE pat_id = ")
        .push_bind(scope.pat_id.clone())
        .push(" AND platform_entity_type = ")
        .push_bind(scope.platform_entity_type.as_str())
        .push(" AND optional_domain_id = ")
        .push_bind(scope.domain_id.clone().unwrap_or_default())
        .push(" AND optional_domain_entity_type = ")
        .push_bind(scope.domain_entity_type.map(|t| t.as_str()).unwrap_or_default())
        .push(" AND operation = ")
        .push_bind(scope.operation.as_str());
}

fn push_pat_filters(query: &mut QueryBuilder<'_, Postgres>, user_id: &str, meta: &PatsPageMeta) {
    query.push(" WHERE user_id = ").push_bind(user_id.to_string());

    if let Some(name) = &meta.name {
        query.push(" AND name ILIKE ").push_bind(format!("%{name}%"));
    }
    if let Some(id) = &meta.id {
        query.push(" AND id = ").push_bind(id.clone());
    }
    match meta.status {
        Some(PatStatus::Active) => {
            query.push(" AND NOT revoked AND expires_at > NOW()");
        }
        Some(PatStatus::Revoked) => {
            query.push(" AND revoked");
        }
        Some(PatStatus::Expired) => {
            query.push(" AND NOT revoked AND expires_at <= NOW()");
        }
        None => {}
    }
}

#[async_trait]
impl PatsRepository for PgPatsRepository {
    async fn save(&self, pat: &Pat) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO pats (id, user_id, name, description, secret, issued_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&pat.id)
        .bind(&pat.user)
        .bind(&pat.name)
        .bind(&pat.description)
        .bind(&pat.secret)
        .bind(pat.issued_at)
        .bind(pat.expires_at)
        .bind(pat.revoked)
        .execute(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

        Ok(())
    }

    async fn retrieve(&self, user_id: &str, pat_id: &str) -> Result<Pat, Error> {
        let row = sqlx::query_as::<_, PatRow>(&format!(
            "SELECT {PAT_COLUMNS} FROM pats WHERE id = $1 AND user_id = $2"
        ))
        .bind(pat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        Ok(row.into())
    }

    async fn retrieve_all(&self, user_id: &str, meta: &PatsPageMeta) -> Result<PatsPage, Error> {
        let limit = if meta.limit == 0 { DEFAULT_LIMIT } else { meta.limit };

        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {PAT_COLUMNS} FROM pats"));
        push_pat_filters(&mut query, user_id, meta);
        query
            .push(" ORDER BY issued_at DESC, id LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(meta.offset as i64);

        let rows = query
            .build_query_as::<PatRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM pats");
        push_pat_filters(&mut count, user_id, meta);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        Ok(PatsPage {
            total: total as u64,
            offset: meta.offset,
            limit,
            pats: rows.into_iter().map(Pat::from).collect(),
        })
    }

    async fn retrieve_secret_and_revoke_status(
        &self,
        user_id: &str,
        pat_id: &str,
    ) -> Result<SecretStatus, Error> {
        let (hash, revoked, expired): (String, bool, bool) = sqlx::query_as(
            "SELECT secret, revoked, expires_at <= NOW() FROM pats WHERE id = $1 AND user_id = $2",
        )
        .bind(pat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        Ok(SecretStatus {
            hash,
            revoked,
            expired,
        })
    }

    async fn update_name(&self, user_id: &str, pat_id: &str, name: &str) -> Result<Pat, Error> {
        self.update_column(user_id, pat_id, "name", name).await
    }

    async fn update_description(
        &self,
        user_id: &str,
        pat_id: &str,
        description: &str,
    ) -> Result<Pat, Error> {
        self.update_column(user_id, pat_id, "description", description)
            .await
    }

    async fn update_token_hash(
        &self,
        user_id: &str,
        pat_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Pat, Error> {
        let row = sqlx::query_as::<_, PatRow>(&format!(
            "UPDATE pats SET secret = $3, expires_at = $4, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 RETURNING {PAT_COLUMNS}"
        ))
        .bind(pat_id)
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        Ok(row.into())
    }

    async fn update_last_used(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE pats SET last_used_at = NOW() WHERE id = $1 AND user_id = $2")
            .bind(pat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        Ok(())
    }

    async fn revoke(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE pats SET revoked = TRUE, revoked_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(pat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        if result.rows_affected() == 0 {
            return Err(not_found(ErrorKind::UpdateEntity));
        }
        Ok(())
    }

    async fn reactivate(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE pats SET revoked = FALSE, revoked_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(pat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        if result.rows_affected() == 0 {
            return Err(not_found(ErrorKind::UpdateEntity));
        }
        Ok(())
    }

    async fn remove(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM pats WHERE id = $1 AND user_id = $2")
            .bind(pat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;

        if result.rows_affected() == 0 {
            return Err(not_found(ErrorKind::RemoveEntity));
        }
        Ok(())
    }

    async fn remove_all_pat(&self, user_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM pats WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;
        Ok(())
    }

    async fn add_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

        for scope in scopes {
            Self::ensure_owner(&mut tx, user_id, &scope.pat_id).await?;

            let ids: Vec<String> = if scope.is_wildcard() {
                let mut clear = QueryBuilder::<Postgres>::new("DELETE FROM pat_scopes");
                push_scope_key(&mut clear, scope);
                clear
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;
                vec![ANY_IDS.to_string()]
            } else {
                let mut wildcard = QueryBuilder::<Postgres>::new("SELECT EXISTS (SELECT 1 FROM pat_scopes");
                push_scope_key(&mut wildcard, scope);
                wildcard.push(" AND entity_id = ").push_bind(ANY_IDS).push(")");
                let covered: bool = wildcard
                    .build_query_scalar()
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;
                if covered {
                    continue;
                }
                scope.entity_ids.clone()
            };

            for entity_id in ids {
                sqlx::query(
                    r#"
                    INSERT INTO pat_scopes (id, pat_id, platform_entity_type, optional_domain_id,
                        optional_domain_entity_type, operation, entity_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&scope.pat_id)
                .bind(scope.platform_entity_type.as_str())
                .bind(scope.domain_id.clone().unwrap_or_default())
                .bind(scope.domain_entity_type.map(|t| t.as_str()).unwrap_or_default())
                .bind(scope.operation.as_str())
                .bind(entity_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))
    }

    async fn remove_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;

        for scope in scopes {
            Self::ensure_owner(&mut tx, user_id, &scope.pat_id).await?;

            let mut query = QueryBuilder::<Postgres>::new("DELETE FROM pat_scopes");
            push_scope_key(&mut query, scope);
            if !scope.is_wildcard() {
                query
                    .push(" AND entity_id = ANY(")
                    .push_bind(scope.entity_ids.clone())
                    .push(")");
            }
            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))
    }

    async fn remove_all_scope_entry(&self, pat_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM pat_scopes WHERE pat_id = $1")
            .bind(pat_id)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;
        Ok(())
    }

    async fn check_scope_entry(
        &self,
        user_id: &str,
        pat_id: &str,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_id: &str,
    ) -> Result<(), Error> {
        let allowed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pat_scopes s
                JOIN pats p ON p.id = s.pat_id
                WHERE p.id = $1 AND p.user_id = $2
                  AND NOT p.revoked AND p.expires_at > NOW()
                  AND s.platform_entity_type = $3
                  AND (s.optional_domain_id = '' OR s.optional_domain_id = $4)
                  AND s.operation = $5
                  AND s.entity_id IN ($6, $7)
            )
            "#,
        )
        .bind(pat_id)
        .bind(user_id)
        .bind(platform_entity_type.as_str())
        .bind(domain_id.unwrap_or_default())
        .bind(operation.as_str())
        .bind(entity_id)
        .bind(ANY_IDS)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        if !allowed {
            return Err(Error::new(ErrorKind::Authorization).with_context(format!(
                "no scope grants {} on {} {entity_id}",
                operation.as_str(),
                platform_entity_type.as_str()
            )));
        }
        Ok(())
    }

    async fn retrieve_scope(
        &self,
        pat_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<ScopesPage, Error> {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };

        let rows = sqlx::query_as::<_, ScopeRow>(
            r#"
            SELECT MIN(id) AS id, pat_id, platform_entity_type, optional_domain_id,
                   optional_domain_entity_type, operation,
                   ARRAY_AGG(entity_id ORDER BY entity_id) AS entity_ids
            FROM pat_scopes
            WHERE pat_id = $1
            GROUP BY pat_id, platform_entity_type, optional_domain_id,
                     optional_domain_entity_type, operation
            ORDER BY platform_entity_type, optional_domain_id, optional_domain_entity_type, operation
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pat_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT 1 FROM pat_scopes WHERE pat_id = $1
                GROUP BY platform_entity_type, optional_domain_id,
                         optional_domain_entity_type, operation
            ) grouped
            "#,
        )
        .bind(pat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let scopes = rows
            .into_iter()
            .map(Scope::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScopesPage {
            total: total as u64,
            offset,
            limit,
            scopes,
        })
    }
}
