use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::db::RolesRepository;
use crate::error::{Error, ErrorKind};
use crate::models::domain::{Capability, DEFAULT_LIMIT};
use crate::models::{DomainRole, MembersPage, RolePage, RoleProvision};

#[derive(Debug, Clone)]
struct RoleRecord {
    role: DomainRole,
    capabilities: BTreeSet<Capability>,
    members: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryRolesRepository {
    roles: DashMap<String, RoleRecord>,
}

fn not_found(kind: ErrorKind) -> Error {
    Error::wrap(kind, Error::new(ErrorKind::NotFound))
}

fn effective_limit(limit: u64) -> u64 {
    if limit == 0 {
        DEFAULT_LIMIT
    } else {
        limit
    }
}

impl InMemoryRolesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn name_taken(&self, entity_id: &str, name: &str, except: &str) -> bool {
        self.roles.iter().any(|entry| {
            let role = &entry.value().role;
            role.entity_id == entity_id && role.name == name && role.id != except
        })
    }

    fn with_role<T>(
        &self,
        role: &DomainRole,
        f: impl FnOnce(&mut RoleRecord) -> T,
    ) -> Result<T, Error> {
        let mut record = self
            .roles
            .get_mut(&role.id)
            .ok_or_else(|| not_found(ErrorKind::UpdateEntity))?;
        let record = record.value_mut();
        record.role.updated_by = role.updated_by.clone();
        record.role.updated_at = role.updated_at;
        Ok(f(record))
    }

    fn read_role<T>(&self, role_id: &str, f: impl FnOnce(&RoleRecord) -> T) -> Result<T, Error> {
        self.roles
            .get(role_id)
            .map(|record| f(record.value()))
            .ok_or_else(|| not_found(ErrorKind::ViewEntity))
    }
}

#[async_trait]
impl RolesRepository for InMemoryRolesRepository {
    async fn add_roles(&self, provisions: &[RoleProvision]) -> Result<Vec<DomainRole>, Error> {
        let mut batch: BTreeSet<(&str, &str)> = BTreeSet::new();
        for p in provisions {
            let role = &p.role;
            if self.roles.contains_key(&role.id)
                || self.name_taken(&role.entity_id, &role.name, "")
                || !batch.insert((role.entity_id.as_str(), role.name.as_str()))
            {
                return Err(Error::wrap(
                    ErrorKind::CreateEntity,
                    Error::new(ErrorKind::Conflict),
                )
                .with_context(format!("role {} in {}", role.name, role.entity_id)));
            }
        }

        for p in provisions {
            self.roles.insert(
                p.role.id.clone(),
                RoleRecord {
                    role: p.role.clone(),
                    capabilities: p.optional_capabilities.iter().copied().collect(),
                    members: p.optional_members.iter().cloned().collect(),
                },
            );
        }
        Ok(provisions.iter().map(|p| p.role.clone()).collect())
    }

    async fn remove_roles(&self, role_ids: &[String]) -> Result<(), Error> {
        for id in role_ids {
            self.roles.remove(id);
        }
        Ok(())
    }

    async fn update_role(&self, role: &DomainRole) -> Result<DomainRole, Error> {
        if self.name_taken(&role.entity_id, &role.name, &role.id) {
            return Err(Error::wrap(
                ErrorKind::UpdateEntity,
                Error::new(ErrorKind::Conflict),
            ));
        }
        self.with_role(role, |record| {
            record.role.name = role.name.clone();
            record.role.clone()
        })
    }

    async fn retrieve_role(&self, role_id: &str) -> Result<DomainRole, Error> {
        self.read_role(role_id, |record| record.role.clone())
    }

    async fn retrieve_role_by_entity_and_name(
        &self,
        entity_id: &str,
        name: &str,
    ) -> Result<DomainRole, Error> {
        self.roles
            .iter()
            .find(|entry| entry.value().role.entity_id == entity_id && entry.value().role.name == name)
            .map(|entry| entry.value().role.clone())
            .ok_or_else(|| not_found(ErrorKind::ViewEntity))
    }

    async fn retrieve_all_roles(
        &self,
        entity_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<RolePage, Error> {
        let limit = effective_limit(limit);
        let roles = self.retrieve_entity_roles(entity_id).await?;
        Ok(RolePage {
            total: roles.len() as u64,
            offset,
            limit,
            roles: roles
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
        })
    }

    async fn retrieve_entity_roles(&self, entity_id: &str) -> Result<Vec<DomainRole>, Error> {
        let mut roles: Vec<DomainRole> = self
            .roles
            .iter()
            .filter(|entry| entry.value().role.entity_id == entity_id)
            .map(|entry| entry.value().role.clone())
            .collect();
        roles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(roles)
    }

    async fn role_add_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        self.with_role(role, |record| {
            record.capabilities.extend(capabilities.iter().copied())
        })
    }

    async fn role_list_capabilities(&self, role_id: &str) -> Result<Vec<Capability>, Error> {
        self.read_role(role_id, |record| {
            record.capabilities.iter().copied().collect()
        })
    }

    async fn role_check_capabilities_exists(
        &self,
        role_id: &str,
        capabilities: &[Capability],
    ) -> Result<bool, Error> {
        self.read_role(role_id, |record| {
            capabilities.iter().all(|c| record.capabilities.contains(c))
        })
    }

    async fn role_remove_capabilities(
        &self,
        role: &DomainRole,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        self.with_role(role, |record| {
            for c in capabilities {
                record.capabilities.remove(c);
            }
        })
    }

    async fn role_remove_all_capabilities(&self, role: &DomainRole) -> Result<(), Error> {
        self.with_role(role, |record| record.capabilities.clear())
    }

    async fn role_add_members(&self, role: &DomainRole, members: &[String]) -> Result<(), Error> {
        self.with_role(role, |record| record.members.extend(members.iter().cloned()))
    }

    async fn role_list_members(
        &self,
        role_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<MembersPage, Error> {
        let limit = effective_limit(limit);
        self.read_role(role_id, |record| MembersPage {
            total: record.members.len() as u64,
            offset,
            limit,
            members: record
                .members
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }

    async fn role_check_members_exists(
        &self,
        role_id: &str,
        members: &[String],
    ) -> Result<bool, Error> {
        self.read_role(role_id, |record| {
            members.iter().all(|m| record.members.contains(m))
        })
    }

    async fn role_remove_members(
        &self,
        role: &DomainRole,
        members: &[String],
    ) -> Result<(), Error> {
        self.with_role(role, |record| {
            for m in members {
                record.members.remove(m);
            }
        })
    }

    async fn role_remove_all_members(&self, role: &DomainRole) -> Result<(), Error> {
        self.with_role(role, |record| record.members.clear())
    }

    async fn member_entity_ids(&self, member_id: &str) -> Result<Vec<String>, Error> {
        let ids: BTreeSet<String> = self
            .roles
            .iter()
            .filter(|entry| entry.value().members.contains(member_id))
            .map(|entry| entry.value().role.entity_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn provision(id: &str, name: &str, entity: &str, members: &[&str]) -> RoleProvision {
        RoleProvision {
            role: DomainRole {
                id: id.to_string(),
                name: name.to_string(),
                entity_id: entity.to_string(),
                created_by: "u1".to_string(),
                created_at: Utc::now(),
                updated_by: None,
                updated_at: None,
            },
            optional_capabilities: vec![Capability::Read],
            optional_members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_role_names_are_unique_per_domain() -> Result<(), anyhow::Error> {
        let repo = InMemoryRolesRepository::new();
        repo.add_roles(&[provision("r1", "viewer", "d1", &[])]).await?;
        repo.add_roles(&[provision("r2", "viewer", "d2", &[])]).await?;

        let err = repo
            .add_roles(&[
                provision("r3", "editor", "d1", &[]),
                provision("r4", "viewer", "d1", &[]),
            ])
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::Conflict));
        assert!(repo.retrieve_role("r3").await.is_err());

        let mut renamed = repo.retrieve_role("r2").await?;
        renamed.entity_id = "d1".to_string();
        assert!(repo
            .update_role(&renamed)
            .await
            .unwrap_err()
            .contains(ErrorKind::Conflict));
        Ok(())
    }

    #[tokio::test]
    async fn test_members_and_capabilities() -> Result<(), anyhow::Error> {
        let repo = InMemoryRolesRepository::new();
        let role = repo
            .add_roles(&[provision("r1", "ops", "d1", &["u2"])])
            .await?
            .remove(0);
        repo.add_roles(&[provision("r2", "ops", "d2", &["u2", "u3"])])
            .await?;

        repo.role_add_members(&role, &["u4".to_string(), "u2".to_string()])
            .await?;
        let page = repo.role_list_members("r1", 0, 0).await?;
        assert_eq!(page.members, vec!["u2".to_string(), "u4".to_string()]);
        assert_eq!(page.limit, DEFAULT_LIMIT);
        assert!(repo.role_check_members_exists("r1", &["u2".to_string()]).await?);
        assert!(!repo.role_check_members_exists("r1", &["u3".to_string()]).await?);

        assert_eq!(
            repo.member_entity_ids("u2").await?,
            vec!["d1".to_string(), "d2".to_string()]
        );
        repo.role_remove_members(&role, &["u2".to_string()]).await?;
        assert_eq!(repo.member_entity_ids("u2").await?, vec!["d2".to_string()]);

        repo.role_add_capabilities(&role, &[Capability::Update]).await?;
        assert!(repo
            .role_check_capabilities_exists("r1", &[Capability::Read, Capability::Update])
            .await?);
        repo.role_remove_all_capabilities(&role).await?;
        assert!(repo.role_list_capabilities("r1").await?.is_empty());

        repo.remove_roles(&["r1".to_string()]).await?;
        assert!(repo
            .retrieve_role("r1")
            .await
            .unwrap_err()
            .contains(ErrorKind::NotFound));
        Ok(())
    }
}
