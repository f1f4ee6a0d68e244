use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::db::RolesRepository;
use crate::error::{from_sqlx, Error, ErrorKind};
use crate::models::domain::{Capability, DEFAULT_LIMIT};
use crate::models::{DomainRole, MembersPage, RolePage, RoleProvision};

const ROLE_COLUMNS: &str = "id, name, entity_id, created_by, created_at, updated_by, updated_at";

#[derive(Debug, FromRow)]
struct RoleRow {
    id: String,
    name: String,
    entity_id: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<RoleRow> for DomainRole {
    fn from(row: RoleRow) -> Self {
        DomainRole {
            id: row.id,
            name: row.name,
            entity_id: row.entity_id,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_by: row.updated_by,
            updated_at: row.updated_at,
        }
    }
}

fn capability_names(capabilities: &[Capability]) -> Vec<String> {
    capabilities.iter().map(|c| c.as_str().to_string()).collect()
}

fn effective_limit(limit: u64) -> u64 {
    if limit == 0 {
        DEFAULT_LIMIT
    } else {
        limit
    }
}

#[derive(Clone)]
pub struct PgRolesRepository {
    pool: PgPool,
}

impl PgRolesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, Error> {
        self.pool
            .begin()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    /// Record the update stamp; a missing role is `NotFound`.
    async fn touch(tx: &mut Transaction<'_, Postgres>, role: &DomainRole) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE domain_roles SET updated_by = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(&role.updated_by)
        .bind(role.updated_at)
        .bind(&role.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::wrap(
                ErrorKind::UpdateEntity,
                Error::new(ErrorKind::NotFound),
            ));
        }
        Ok(())
    }

    async fn insert_capabilities(
        tx: &mut Transaction<'_, Postgres>,
        role_id: &str,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO domain_role_capabilities (role_id, capability)
            SELECT $1, UNNEST($2::text[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(capability_names(capabilities))
        .execute(&mut **tx)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        Ok(())
    }

    async fn insert_members(
        tx: &mut Transaction<'_, Postgres>,
        role_id: &str,
        members: &[String],
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO domain_role_members (role_id, member_id)
            SELECT $1, UNNEST($2::text[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(members)
        .execute(&mut **tx)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        Ok(())
    }
}

#[async_trait]
impl RolesRepository for PgRolesRepository {
    async fn add_roles(&self, provisions: &[RoleProvision]) -> Result<Vec<DomainRole>, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

        let mut roles = Vec::with_capacity(provisions.len());
        for p in provisions {
            let row = sqlx::query_as::<_, RoleRow>(&format!(
                r#"
                INSERT INTO domain_roles (id, name, entity_id, created_by, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {ROLE_COLUMNS}
                "#
            ))
            .bind(&p.role.id)
            .bind(&p.role.name)
            .bind(&p.role.entity_id)
            .bind(&p.role.created_by)
            .bind(p.role.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

            Self::insert_capabilities(&mut tx, &p.role.id, &p.optional_capabilities).await?;
            Self::insert_members(&mut tx, &p.role.id, &p.optional_members).await?;
            roles.push(row.into());
        }

        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;
        Ok(roles)
    }

    async fn remove_roles(&self, role_ids: &[String]) -> Result<(), Error> {
        sqlx::query("DELETE FROM domain_roles WHERE id = ANY($1)")
            .bind(role_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::RemoveEntity, e))?;
        Ok(())
    }

    async fn update_role(&self, role: &DomainRole) -> Result<DomainRole, Error> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            r#"
            UPDATE domain_roles SET name = $1, updated_by = $2, updated_at = $3
            WHERE id = $4
            RETURNING {ROLE_COLUMNS}
            "#
        ))
        .bind(&role.name)
        .bind(&role.updated_by)
        .bind(role.updated_at)
        .bind(&role.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        Ok(row.into())
    }

    async fn retrieve_role(&self, role_id: &str) -> Result<DomainRole, Error> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {ROLE_COLUMNS} FROM domain_roles WHERE id = $1"
        ))
        .bind(role_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        Ok(row.into())
    }

    async fn retrieve_role_by_entity_and_name(
        &self,
        entity_id: &str,
        name: &str,
    ) -> Result<DomainRole, Error> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {ROLE_COLUMNS} FROM domain_roles WHERE entity_id = $1 AND name = $2"
        ))
        .bind(entity_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        Ok(row.into())
    }

    async fn retrieve_all_roles(
        &self,
        entity_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<RolePage, Error> {
        let limit = effective_limit(limit);
        let rows = sqlx::query_as::<_, RoleRow>(&format!(
            r#"
            SELECT {ROLE_COLUMNS} FROM domain_roles WHERE entity_id = $1
            ORDER BY created_at, name
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(entity_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM domain_roles WHERE entity_id = $1")
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        Ok(RolePage {
            total: total as u64,
            offset,
            limit,
            roles: rows.into_iter().map(DomainRole::from).collect(),
        })
    }

    async fn retrieve_entity_roles(&self, entity_id: &str) -> Result<Vec<DomainRole>, Error> {
        let rows = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {ROLE_COLUMNS} FROM domain_roles WHERE entity_id = $1 ORDER BY created_at, name"
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        Ok(rows.into_iter().map(DomainRole::from).collect())
    }

    async fn role_add_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        Self::insert_capabilities(&mut tx, &role.id, capabilities).await?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn role_list_capabilities(&self, role_id: &str) -> Result<Vec<Capability>, Error> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT capability FROM domain_role_capabilities WHERE role_id = $1 ORDER BY capability",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        names.iter().map(|name| name.parse()).collect()
    }

    async fn role_check_capabilities_exists(
        &self,
        role_id: &str,
        capabilities: &[Capability],
    ) -> Result<bool, Error> {
        let names = capability_names(capabilities);
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM domain_role_capabilities
            WHERE role_id = $1 AND capability = ANY($2)
            "#,
        )
        .bind(role_id)
        .bind(&names)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        Ok(found as usize == names.len())
    }

    async fn role_remove_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        sqlx::query(
            "DELETE FROM domain_role_capabilities WHERE role_id = $1 AND capability = ANY($2)",
        )
        .bind(&role.id)
        .bind(capability_names(capabilities))
        .execute(&mut *tx)
        .await
        .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn role_remove_all_capabilities(&self, role: &DomainRole) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        sqlx::query("DELETE FROM domain_role_capabilities WHERE role_id = $1")
            .bind(&role.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn role_add_members(&self, role: &DomainRole, members: &[String]) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        Self::insert_members(&mut tx, &role.id, members).await?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn role_list_members(
        &self,
        role_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<MembersPage, Error> {
        let limit = effective_limit(limit);
        let members: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT member_id FROM domain_role_members WHERE role_id = $1
            ORDER BY member_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(role_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM domain_role_members WHERE role_id = $1")
                .bind(role_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        Ok(MembersPage {
            total: total as u64,
            offset,
            limit,
            members,
        })
    }

    async fn role_check_members_exists(
        &self,
        role_id: &str,
        members: &[String],
    ) -> Result<bool, Error> {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM domain_role_members WHERE role_id = $1 AND member_id = ANY($2)",
        )
        .bind(role_id)
        .bind(members)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;
        Ok(found as usize == members.len())
    }

    async fn role_remove_members(
        &self,
        role: &DomainRole,
        members: &[String],
    ) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        sqlx::query("DELETE FROM domain_role_members WHERE role_id = $1 AND member_id = ANY($2)")
            .bind(&role.id)
            .bind(members)
            .execute(&mut *tx)
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn role_remove_all_members(&self, role: &DomainRole) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::touch(&mut tx, role).await?;
        sqlx::query("DELETE FROM domain_role_members WHERE role_id = $1")
            .bind(&role.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;
        tx.commit()
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))
    }

    async fn member_entity_ids(&self, member_id: &str) -> Result<Vec<String>, Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT r.entity_id FROM domain_roles r
            JOIN domain_role_members m ON m.role_id = r.id
            WHERE m.member_id = $1
            ORDER BY r.entity_id
            "#,
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))
    }
}
