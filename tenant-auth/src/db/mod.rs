//! Persistence contracts and their backends.
//!
//! Each store owns its rows exclusively. The Postgres backends are used in
//! production; the in-memory ones honor the same contracts for development
//! and tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::Error;
use crate::models::domain::Capability;
use crate::models::{
    Domain, DomainReq, DomainRole, DomainsPage, Key, MembersPage, OperationType, Page, Pat,
    PatsPage, PatsPageMeta, PlatformEntityType, RolePage, RoleProvision, Scope, ScopesPage,
    SecretStatus,
};

/// Stored API keys.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Persist `key`, returning its id. A server-chosen id is assigned when
    /// the key has none.
    async fn save(&self, key: &Key) -> Result<String, Error>;

    async fn retrieve(&self, issuer: &str, id: &str) -> Result<Key, Error>;

    async fn remove(&self, issuer: &str, id: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait DomainsRepository: Send + Sync {
    async fn save(&self, domain: &Domain) -> Result<Domain, Error>;

    async fn retrieve_by_id(&self, id: &str) -> Result<Domain, Error>;

    async fn retrieve_all_by_ids(&self, page: &Page) -> Result<DomainsPage, Error>;

    async fn update(&self, id: &str, user_id: &str, req: &DomainReq) -> Result<Domain, Error>;

    async fn delete(&self, id: &str) -> Result<(), Error>;

    async fn list_domains(&self, page: &Page) -> Result<DomainsPage, Error>;
}

/// Domain roles with their capabilities and members.
///
/// Members are plain user ids. The `role` argument of the mutating calls
/// carries the `updated_by`/`updated_at` stamp to record.
#[async_trait]
pub trait RolesRepository: Send + Sync {
    /// Stores every provision or none. A duplicate name within a domain is
    /// a conflict.
    async fn add_roles(&self, provisions: &[RoleProvision]) -> Result<Vec<DomainRole>, Error>;

    async fn remove_roles(&self, role_ids: &[String]) -> Result<(), Error>;

    async fn update_role(&self, role: &DomainRole) -> Result<DomainRole, Error>;

    async fn retrieve_role(&self, role_id: &str) -> Result<DomainRole, Error>;

    async fn retrieve_role_by_entity_and_name(
        &self,
        entity_id: &str,
        name: &str,
    ) -> Result<DomainRole, Error>;

    async fn retrieve_all_roles(
        &self,
        entity_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<RolePage, Error>;

    /// Every role of the domain, unpaged.
    async fn retrieve_entity_roles(&self, entity_id: &str) -> Result<Vec<DomainRole>, Error>;

    async fn role_add_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error>;

    async fn role_list_capabilities(&self, role_id: &str) -> Result<Vec<Capability>, Error>;

    /// True only when the role holds every listed capability.
    async fn role_check_capabilities_exists(
        &self,
        role_id: &str,
        capabilities: &[Capability],
    ) -> Result<bool, Error>;

    async fn role_remove_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error>;

    async fn role_remove_all_capabilities(&self, role: &DomainRole) -> Result<(), Error>;

    async fn role_add_members(&self, role: &DomainRole, members: &[String]) -> Result<(), Error>;

    async fn role_list_members(
        &self,
        role_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<MembersPage, Error>;

    /// True only when every listed user is a member.
    async fn role_check_members_exists(
        &self,
        role_id: &str,
        members: &[String],
    ) -> Result<bool, Error>;

    async fn role_remove_members(&self, role: &DomainRole, members: &[String])
        -> Result<(), Error>;

    async fn role_remove_all_members(&self, role: &DomainRole) -> Result<(), Error>;

    /// Domains in which `member_id` holds at least one role.
    async fn member_entity_ids(&self, member_id: &str) -> Result<Vec<String>, Error>;
}

#[async_trait]
pub trait PatsRepository: Send + Sync {
    async fn save(&self, pat: &Pat) -> Result<(), Error>;

    async fn retrieve(&self, user_id: &str, pat_id: &str) -> Result<Pat, Error>;

    async fn retrieve_all(&self, user_id: &str, meta: &PatsPageMeta) -> Result<PatsPage, Error>;

    async fn retrieve_secret_and_revoke_status(
        &self,
        user_id: &str,
        pat_id: &str,
    ) -> Result<SecretStatus, Error>;

    async fn update_name(&self, user_id: &str, pat_id: &str, name: &str) -> Result<Pat, Error>;

    async fn update_description(
        &self,
        user_id: &str,
        pat_id: &str,
        description: &str,
    ) -> Result<Pat, Error>;

    async fn update_token_hash(
        &self,
        user_id: &str,
        pat_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Pat, Error>;

    async fn update_last_used(&self, user_id: &str, pat_id: &str) -> Result<(), Error>;

    async fn revoke(&self, user_id: &str, pat_id: &str) -> Result<(), Error>;

    async fn reactivate(&self, user_id: &str, pat_id: &str) -> Result<(), Error>;

    async fn remove(&self, user_id: &str, pat_id: &str) -> Result<(), Error>;

    async fn remove_all_pat(&self, user_id: &str) -> Result<(), Error>;

    async fn add_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error>;

    async fn remove_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error>;

    async fn remove_all_scope_entry(&self, pat_id: &str) -> Result<(), Error>;

    async fn check_scope_entry(
        &self,
        user_id: &str,
        pat_id: &str,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_id: &str,
    ) -> Result<(), Error>;

    async fn retrieve_scope(
        &self,
        pat_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<ScopesPage, Error>;
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check database health.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_create_pool() {
        let config = DatabaseConfig {
            url: "postgres://localhost/tenant_auth_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        };

        let result = create_pool(&config).await;
        assert!(result.is_ok());
    }
}
