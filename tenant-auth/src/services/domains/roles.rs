//! Domain roles: named capability sets whose members act with those
//! capabilities inside the domain.
//!
//! A capability is written as `domain:{id}#{capability}@role:{role}#member`
//! and a member as `role:{role}#member@user:{domain}_{user}`, so the relation
//! store resolves a member's rights through the role.

use chrono::Utc;
use std::collections::BTreeSet;
use validator::Validate;

use super::{user_of, DomainService};
use crate::error::{Error, ErrorKind};
use crate::models::domain::{Capability, READ_PERMISSION};
use crate::models::policy::{encode_domain_user_id, MEMBER_RELATION};
use crate::models::{
    DomainRole, EntityType, Key, MembersPage, PolicyRequest, RolePage, RoleProvision, SubjectKind,
};

pub fn role_capability_policies(
    domain_id: &str,
    role_id: &str,
    capabilities: &[Capability],
) -> Vec<PolicyRequest> {
    capabilities
        .iter()
        .map(|capability| PolicyRequest {
            subject: role_id.to_string(),
            subject_type: Some(EntityType::Role),
            subject_relation: MEMBER_RELATION.to_string(),
            relation: capability.as_str().to_string(),
            object: domain_id.to_string(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        })
        .collect()
}

pub fn role_member_policies(
    domain_id: &str,
    role_id: &str,
    members: &[String],
) -> Vec<PolicyRequest> {
    members
        .iter()
        .map(|member| PolicyRequest {
            subject: encode_domain_user_id(domain_id, member),
            subject_type: Some(EntityType::User),
            subject_kind: Some(SubjectKind::Users),
            relation: MEMBER_RELATION.to_string(),
            object: role_id.to_string(),
            object_type: Some(EntityType::Role),
            ..Default::default()
        })
        .collect()
}

fn dedup<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    items
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn non_empty<T>(items: &[T], what: &str) -> Result<(), Error> {
    if items.is_empty() {
        return Err(Error::new(ErrorKind::MalformedEntity).with_context(format!("no {what} given")));
    }
    Ok(())
}

fn stamped(key: &Key, mut role: DomainRole) -> DomainRole {
    role.updated_by = Some(user_of(key).to_string());
    role.updated_at = Some(Utc::now());
    role
}

impl DomainService {
    async fn domain_role(&self, domain_id: &str, name: &str) -> Result<DomainRole, Error> {
        self.roles
            .retrieve_role_by_entity_and_name(domain_id, name)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Identify the bearer, check `permission` on the domain and load the
    /// named role.
    async fn role_access(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        permission: &str,
    ) -> Result<(Key, DomainRole), Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, domain_id, permission).await?;
        let role = self.domain_role(domain_id, name).await?;
        Ok((key, role))
    }

    /// Write the role's tuples, then the role. The tuples are removed again
    /// if the role cannot be stored.
    pub(super) async fn provision_role(
        &self,
        key: &Key,
        domain_id: &str,
        name: &str,
        capabilities: Vec<Capability>,
        members: Vec<String>,
    ) -> Result<RoleProvision, Error> {
        let role = DomainRole {
            id: self
                .id_provider
                .id()
                .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?,
            name: name.to_string(),
            entity_id: domain_id.to_string(),
            created_by: user_of(key).to_string(),
            created_at: Utc::now(),
            updated_by: None,
            updated_at: None,
        };
        role.validate()
            .map_err(|e| Error::wrap(ErrorKind::MalformedEntity, e))?;

        let capabilities = dedup(&capabilities);
        let members = dedup(&members);
        let mut policies = role_capability_policies(domain_id, &role.id, &capabilities);
        policies.extend(role_member_policies(domain_id, &role.id, &members));
        if !policies.is_empty() {
            self.auth.add_policies(&policies).await?;
        }

        let provision = RoleProvision {
            role,
            optional_capabilities: capabilities,
            optional_members: members,
        };
        if let Err(err) = self.roles.add_roles(std::slice::from_ref(&provision)).await {
            return Err(self
                .rollback(Error::wrap(ErrorKind::CreateEntity, err), &policies)
                .await);
        }

        tracing::info!(
            domain_id = %domain_id,
            role_id = %provision.role.id,
            role = %provision.role.name,
            "Role added"
        );
        Ok(provision)
    }

    pub(super) async fn add_members(
        &self,
        key: &Key,
        domain_id: &str,
        role: &DomainRole,
        members: &[String],
    ) -> Result<Vec<String>, Error> {
        non_empty(members, "members")?;
        let members = dedup(members);
        let policies = role_member_policies(domain_id, &role.id, &members);
        self.auth.add_policies(&policies).await?;

        if let Err(err) = self
            .roles
            .role_add_members(&stamped(key, role.clone()), &members)
            .await
        {
            return Err(self
                .rollback(Error::wrap(ErrorKind::UpdateEntity, err), &policies)
                .await);
        }
        Ok(members)
    }

    pub(super) async fn remove_members(
        &self,
        key: &Key,
        domain_id: &str,
        role: &DomainRole,
        members: &[String],
    ) -> Result<(), Error> {
        non_empty(members, "members")?;
        self.auth
            .delete_policies(&role_member_policies(domain_id, &role.id, members))
            .await?;
        self.roles
            .role_remove_members(&stamped(key, role.clone()), members)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    /// Create a role on the domain, optionally with capabilities and members.
    #[tracing::instrument(skip(self, token, capabilities, members), fields(domain_id = %domain_id, role = %name))]
    pub async fn add_role(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        capabilities: Vec<Capability>,
        members: Vec<String>,
    ) -> Result<RoleProvision, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, domain_id, &Capability::ManageRole.permission())
            .await?;
        self.provision_role(&key, domain_id, name, capabilities, members)
            .await
    }

    /// Remove the role and every tuple it appears in.
    #[tracing::instrument(skip(self, token), fields(domain_id = %domain_id, role = %name))]
    pub async fn remove_role(&self, token: &str, domain_id: &str, name: &str) -> Result<(), Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, &Capability::ManageRole.permission())
            .await?;

        self.auth
            .delete_policy_filter(&PolicyRequest {
                subject: role.id.clone(),
                subject_type: Some(EntityType::Role),
                ..Default::default()
            })
            .await?;
        self.auth
            .delete_policy_filter(&PolicyRequest {
                object: role.id.clone(),
                object_type: Some(EntityType::Role),
                ..Default::default()
            })
            .await?;

        self.roles
            .remove_roles(std::slice::from_ref(&role.id))
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        tracing::info!(role_id = %role.id, "Role removed");
        Ok(())
    }

    pub async fn update_role_name(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        new_name: &str,
    ) -> Result<DomainRole, Error> {
        let (key, role) = self
            .role_access(token, domain_id, name, &Capability::ManageRole.permission())
            .await?;

        let mut role = stamped(&key, role);
        role.name = new_name.to_string();
        role.validate()
            .map_err(|e| Error::wrap(ErrorKind::MalformedEntity, e))?;

        self.roles
            .update_role(&role)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    pub async fn retrieve_role(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
    ) -> Result<DomainRole, Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, READ_PERMISSION)
            .await?;
        Ok(role)
    }

    pub async fn retrieve_all_roles(
        &self,
        token: &str,
        domain_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<RolePage, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, domain_id, READ_PERMISSION).await?;
        self.roles
            .retrieve_all_roles(domain_id, limit, offset)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn role_add_capabilities(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        capabilities: &[Capability],
    ) -> Result<Vec<Capability>, Error> {
        let (key, role) = self
            .role_access(token, domain_id, name, &Capability::ManageRole.permission())
            .await?;
        non_empty(capabilities, "capabilities")?;

        let capabilities = dedup(capabilities);
        let policies = role_capability_policies(domain_id, &role.id, &capabilities);
        self.auth.add_policies(&policies).await?;

        if let Err(err) = self
            .roles
            .role_add_capabilities(&stamped(&key, role), &capabilities)
            .await
        {
            return Err(self
                .rollback(Error::wrap(ErrorKind::UpdateEntity, err), &policies)
                .await);
        }
        Ok(capabilities)
    }

    pub async fn role_list_capabilities(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
    ) -> Result<Vec<Capability>, Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, READ_PERMISSION)
            .await?;
        self.roles
            .role_list_capabilities(&role.id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn role_check_capabilities_exists(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        capabilities: &[Capability],
    ) -> Result<bool, Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, READ_PERMISSION)
            .await?;
        self.roles
            .role_check_capabilities_exists(&role.id, capabilities)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn role_remove_capabilities(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        capabilities: &[Capability],
    ) -> Result<(), Error> {
        let (key, role) = self
            .role_access(token, domain_id, name, &Capability::ManageRole.permission())
            .await?;
        non_empty(capabilities, "capabilities")?;

        self.auth
            .delete_policies(&role_capability_policies(domain_id, &role.id, capabilities))
            .await?;
        self.roles
            .role_remove_capabilities(&stamped(&key, role), capabilities)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    pub async fn role_remove_all_capabilities(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
    ) -> Result<(), Error> {
        let (key, role) = self
            .role_access(token, domain_id, name, &Capability::ManageRole.permission())
            .await?;

        self.auth
            .delete_policy_filter(&PolicyRequest {
                subject: role.id.clone(),
                subject_type: Some(EntityType::Role),
                object: domain_id.to_string(),
                object_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await?;
        self.roles
            .role_remove_all_capabilities(&stamped(&key, role))
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    pub async fn role_add_members(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        members: &[String],
    ) -> Result<Vec<String>, Error> {
        let (key, role) = self
            .role_access(token, domain_id, name, &Capability::AddRoleUsers.permission())
            .await?;
        self.add_members(&key, domain_id, &role, members).await
    }

    pub async fn role_list_members(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        limit: u64,
        offset: u64,
    ) -> Result<MembersPage, Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, &Capability::ViewRoleUsers.permission())
            .await?;
        self.roles
            .role_list_members(&role.id, limit, offset)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn role_check_members_exists(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        members: &[String],
    ) -> Result<bool, Error> {
        let (_, role) = self
            .role_access(token, domain_id, name, &Capability::ViewRoleUsers.permission())
            .await?;
        self.roles
            .role_check_members_exists(&role.id, members)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn role_remove_members(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
        members: &[String],
    ) -> Result<(), Error> {
        let (key, role) = self
            .role_access(
                token,
                domain_id,
                name,
                &Capability::RemoveRoleUsers.permission(),
            )
            .await?;
        self.remove_members(&key, domain_id, &role, members).await
    }

    pub async fn role_remove_all_members(
        &self,
        token: &str,
        domain_id: &str,
        name: &str,
    ) -> Result<(), Error> {
        let (key, role) = self
            .role_access(
                token,
                domain_id,
                name,
                &Capability::RemoveRoleUsers.permission(),
            )
            .await?;

        self.auth
            .delete_policy_filter(&PolicyRequest {
                object: role.id.clone(),
                object_type: Some(EntityType::Role),
                ..Default::default()
            })
            .await?;
        self.roles
            .role_remove_all_members(&stamped(&key, role))
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }
}
