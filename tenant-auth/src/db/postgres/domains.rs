use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::db::DomainsRepository;
use crate::error::{from_sqlx, Error, ErrorKind};
use crate::models::{Domain, DomainReq, DomainStatus, DomainsPage, Metadata, Page};

const DOMAIN_COLUMNS: &str =
    "id, name, alias, tags, metadata, status, created_by, created_at, updated_by, updated_at";

#[derive(Debug, FromRow)]
struct DomainRow {
    id: String,
    name: String,
    alias: Option<String>,
    tags: Vec<String>,
    metadata: Json<Metadata>,
    status: i16,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DomainRow> for Domain {
    type Error = Error;

    fn try_from(row: DomainRow) -> Result<Self, Self::Error> {
        Ok(Domain {
            id: row.id,
            name: row.name,
            alias: row.alias,
            tags: row.tags,
            metadata: row.metadata.0,
            status: DomainStatus::from_i16(row.status)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_by: row.updated_by,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgDomainsRepository {
    pool: PgPool,
}

impl PgDomainsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn page(&self, page: &Page, by_ids: bool) -> Result<DomainsPage, Error> {
        let limit = page.effective_limit();

        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {DOMAIN_COLUMNS} FROM domains"));
        push_filters(&mut query, page, by_ids);
        query
            .push(" ORDER BY ")
            .push(page.order.column())
            .push(" ")
            .push(page.dir.as_sql())
            .push(" LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = query
            .build_query_as::<DomainRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM domains");
        push_filters(&mut count, page, by_ids);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        let domains = rows
            .into_iter()
            .map(Domain::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DomainsPage {
            total: total as u64,
            offset: page.offset,
            limit,
            domains,
        })
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Postgres>, page: &Page, by_ids: bool) {
    query.push(" WHERE TRUE");

    if by_ids {
        query.push(" AND id = ANY(").push_bind(page.ids.clone()).push(")");
    } else if let Some(subject) = &page.subject_id {
        query
            .push(" AND (created_by = ")
            .push_bind(subject.clone())
            .push(" OR id = ANY(")
            .push_bind(page.ids.clone())
            .push("))");
    }
    if let Some(name) = &page.name {
        query.push(" AND name ILIKE ").push_bind(format!("%{name}%"));
    }
    if let Some(tag) = &page.tag {
        query.push(" AND ").push_bind(tag.clone()).push(" = ANY(tags)");
    }
    if let Some(metadata) = &page.metadata {
        query
            .push(" AND metadata @> ")
            .push_bind(Json(metadata.clone()));
    }
    if page.status != DomainStatus::All {
        query.push(" AND status = ").push_bind(page.status.as_i16());
    }
}

#[async_trait]
impl DomainsRepository for PgDomainsRepository {
    async fn save(&self, domain: &Domain) -> Result<Domain, Error> {
        if !domain.status.is_storable() {
            return Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::InvalidStatus),
            ));
        }

        let row = sqlx::query_as::<_, DomainRow>(&format!(
            r#"
            INSERT INTO domains (id, name, alias, tags, metadata, status, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {DOMAIN_COLUMNS}
            "#
        ))
        .bind(&domain.id)
        .bind(&domain.name)
        .bind(domain.alias.as_ref().map(|a| a.to_lowercase()))
        .bind(&domain.tags)
        .bind(Json(&domain.metadata))
        .bind(domain.status.as_i16())
        .bind(&domain.created_by)
        .bind(domain.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::CreateEntity, e))?;

        row.try_into()
    }

    async fn retrieve_by_id(&self, id: &str) -> Result<Domain, Error> {
        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| from_sqlx(ErrorKind::ViewEntity, e))?;

        row.try_into()
    }

    async fn retrieve_all_by_ids(&self, page: &Page) -> Result<DomainsPage, Error> {
        if page.ids.is_empty() {
            return Ok(DomainsPage {
                offset: page.offset,
                limit: page.effective_limit(),
                ..DomainsPage::default()
            });
        }
        self.page(page, true).await
    }

    async fn update(&self, id: &str, user_id: &str, req: &DomainReq) -> Result<Domain, Error> {
        if req.status == Some(DomainStatus::All) {
            return Err(Error::wrap(
                ErrorKind::UpdateEntity,
                Error::new(ErrorKind::InvalidStatus),
            ));
        }

        let mut query = QueryBuilder::<Postgres>::new("UPDATE domains SET ");
        {
            let mut set = query.separated(", ");
            if let Some(name) = &req.name {
                set.push("name = ").push_bind_unseparated(name.clone());
            }
            if let Some(alias) = &req.alias {
                set.push("alias = ")
                    .push_bind_unseparated(alias.to_lowercase());
            }
            if let Some(tags) = &req.tags {
                set.push("tags = ").push_bind_unseparated(tags.clone());
            }
            if let Some(metadata) = &req.metadata {
                set.push("metadata = ")
                    .push_bind_unseparated(Json(metadata.clone()));
            }
            if let Some(status) = req.status {
                set.push("status = ").push_bind_unseparated(status.as_i16());
            }
            set.push("updated_by = ")
                .push_bind_unseparated(user_id.to_string());
            set.push("updated_at = ").push_bind_unseparated(Utc::now());
        }
        query
            .push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(format!(" RETURNING {DOMAIN_COLUMNS}"));

        let row = query
            .build_query_as::<DomainRow>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| from_sqlx(ErrorKind::UpdateEntity, e))?;

        row.try_into()
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM domains WHERE id = $1")
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

    async fn list_domains(&self, page: &Page) -> Result<DomainsPage, Error> {
        self.page(page, false).await
    }
}
