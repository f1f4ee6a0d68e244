//! Tenant lifecycle on top of the domain store and the policy layer.

mod roles;

pub use roles::{role_capability_policies, role_member_policies};

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use validator::Validate;

use crate::db::{DomainsRepository, RolesRepository};
use crate::error::{Error, ErrorKind};
use crate::models::domain::{
    built_in_roles, Capability, BUILTIN_ROLE_ADMIN, BUILTIN_ROLE_MEMBERSHIP, DEFAULT_LIMIT, DELETE_PERMISSION,
    READ_PERMISSION, UPDATE_PERMISSION,
};
use crate::models::policy::{
    encode_domain_user_id, ADMINISTRATOR_RELATION, ADMIN_PERMISSION, MEMBERSHIP_PERMISSION,
    MEMBER_RELATION, PLATFORM_OBJECT, PLATFORM_RELATION,
};
use crate::models::{
    Domain, DomainReq, DomainRole, DomainStatus, DomainsPage, EntityType, Key, Page,
    Permissions, PolicyRequest, SubjectKind,
};
use crate::services::auth::AuthService;
use crate::services::id::IdProvider;

/// Tuples written when a domain is created: the creator administers it and
/// the platform is its parent.
pub fn domain_policies(user_id: &str, domain_id: &str) -> Vec<PolicyRequest> {
    vec![
        PolicyRequest {
            subject: encode_domain_user_id(domain_id, user_id),
            subject_type: Some(EntityType::User),
            subject_kind: Some(SubjectKind::Users),
            relation: ADMINISTRATOR_RELATION.to_string(),
            object: domain_id.to_string(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        },
        PolicyRequest {
            subject: PLATFORM_OBJECT.to_string(),
            subject_type: Some(EntityType::Platform),
            relation: PLATFORM_RELATION.to_string(),
            object: domain_id.to_string(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        },
    ]
}

fn user_of(key: &Key) -> &str {
    if key.user.is_empty() {
        &key.subject
    } else {
        &key.user
    }
}

/// Subject the key acts as inside `domain_id`.
fn domain_subject(key: &Key, domain_id: &str) -> String {
    if key.subject.is_empty() {
        encode_domain_user_id(domain_id, &key.user)
    } else {
        key.subject.clone()
    }
}

/// Built-in role a legacy relation assignment lands in.
fn built_in_role_for(relation: &str) -> Result<&'static str, Error> {
    match relation {
        ADMINISTRATOR_RELATION => Ok(BUILTIN_ROLE_ADMIN),
        MEMBER_RELATION => Ok(BUILTIN_ROLE_MEMBERSHIP),
        other => Err(Error::new(ErrorKind::MalformedEntity)
            .with_context(format!("cannot assign relation {other}"))),
    }
}

#[derive(Clone)]
pub struct DomainService {
    repo: Arc<dyn DomainsRepository>,
    roles: Arc<dyn RolesRepository>,
    auth: AuthService,
    id_provider: Arc<dyn IdProvider>,
}

impl DomainService {
    pub fn new(
        repo: Arc<dyn DomainsRepository>,
        roles: Arc<dyn RolesRepository>,
        auth: AuthService,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            repo,
            roles,
            auth,
            id_provider,
        }
    }

    async fn identify(&self, token: &str) -> Result<Key, Error> {
        self.auth
            .identify(token)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authentication, e))
    }

    async fn authorize(&self, key: &Key, domain_id: &str, permission: &str) -> Result<(), Error> {
        self.auth
            .authorize(&PolicyRequest {
                subject: domain_subject(key, domain_id),
                subject_type: Some(EntityType::User),
                subject_kind: Some(SubjectKind::Users),
                object: domain_id.to_string(),
                object_type: Some(EntityType::Domain),
                permission: permission.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authorization, e))
    }

    async fn is_platform_admin(&self, user_id: &str) -> bool {
        self.auth
            .authorize(&PolicyRequest {
                subject: user_id.to_string(),
                subject_type: Some(EntityType::User),
                permission: ADMIN_PERMISSION.to_string(),
                object: PLATFORM_OBJECT.to_string(),
                object_type: Some(EntityType::Platform),
                ..Default::default()
            })
            .await
            .is_ok()
    }

    /// Undo written tuples after a failed store write, keeping both errors
    /// when the undo fails too.
    async fn rollback(&self, err: Error, policies: &[PolicyRequest]) -> Error {
        if policies.is_empty() {
            return err;
        }
        match self.auth.delete_policies(policies).await {
            Ok(()) => err,
            Err(rollback) => {
                tracing::error!(error = %rollback, "Failed to roll back policies");
                Error::compose(err, Error::wrap(ErrorKind::RollbackPolicy, rollback))
            }
        }
    }

    /// Create `domain` owned by the bearer. The ownership tuples are written
    /// first and removed again if the row cannot be stored.
    #[tracing::instrument(skip(self, token, domain), fields(name = %domain.name))]
    pub async fn create_domain(&self, token: &str, mut domain: Domain) -> Result<Domain, Error> {
        let key = self.identify(token).await?;
        let user_id = user_of(&key).to_string();
        domain.created_by = user_id.clone();

        domain.id = self
            .id_provider
            .id()
            .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?;

        if !matches!(domain.status, DomainStatus::Enabled | DomainStatus::Disabled) {
            return Err(Error::new(ErrorKind::InvalidStatus)
                .with_context(format!("cannot create a {} domain", domain.status)));
        }
        domain
            .validate()
            .map_err(|e| Error::wrap(ErrorKind::MalformedEntity, e))?;
        domain.created_at = Utc::now();

        let policies = domain_policies(&user_id, &domain.id);
        self.auth
            .add_policies(&policies)
            .await
            .map_err(|e| Error::wrap(ErrorKind::CreateDomainPolicy, e))?;

        match self.repo.save(&domain).await {
            Ok(saved) => {
                tracing::info!(domain_id = %saved.id, user_id = %user_id, "Domain created");
                Ok(saved)
            }
            Err(err) => Err(self
                .rollback(Error::wrap(ErrorKind::CreateEntity, err), &policies)
                .await),
        }
    }

    pub async fn retrieve_domain(&self, token: &str, id: &str) -> Result<Domain, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, READ_PERMISSION).await?;
        self.repo
            .retrieve_by_id(id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    #[tracing::instrument(skip(self, token, req), fields(domain_id = %id))]
    pub async fn update_domain(
        &self,
        token: &str,
        id: &str,
        req: &DomainReq,
    ) -> Result<Domain, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, UPDATE_PERMISSION).await?;
        req.validate()
            .map_err(|e| Error::wrap(ErrorKind::MalformedEntity, e))?;

        self.repo
            .update(id, user_of(&key), req)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    /// Update only the status, under the same permission as an update.
    #[tracing::instrument(skip(self, token), fields(domain_id = %id, status = %status))]
    pub async fn change_domain_status(
        &self,
        token: &str,
        id: &str,
        status: DomainStatus,
    ) -> Result<Domain, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, UPDATE_PERMISSION).await?;

        let req = DomainReq {
            status: Some(status),
            ..Default::default()
        };
        let domain = self
            .repo
            .update(id, user_of(&key), &req)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))?;

        tracing::info!(domain_id = %id, status = %status, "Domain status changed");
        Ok(domain)
    }

    /// Domains visible to the bearer: every domain for a platform admin,
    /// otherwise the ones it created or holds a role or relation in.
    pub async fn list_domains(&self, token: &str, mut page: Page) -> Result<DomainsPage, Error> {
        let key = self.identify(token).await?;
        let user_id = user_of(&key).to_string();

        if self.is_platform_admin(&user_id).await {
            page.subject_id = None;
        } else {
            page.ids = self.visible_domain_ids(&key, &user_id).await?;
            page.subject_id = Some(user_id);
        }

        self.repo
            .list_domains(&page)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Role memberships are keyed by the plain user id, so they resolve
    /// whether or not the token is bound to a domain.
    async fn visible_domain_ids(&self, key: &Key, user_id: &str) -> Result<Vec<String>, Error> {
        let mut ids: BTreeSet<String> = self
            .roles
            .member_entity_ids(user_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?
            .into_iter()
            .collect();

        let subject = if key.subject.is_empty() {
            user_id.to_string()
        } else {
            key.subject.clone()
        };
        let memberships = self
            .auth
            .list_all_objects(&PolicyRequest {
                subject,
                subject_type: Some(EntityType::User),
                permission: MEMBERSHIP_PERMISSION.to_string(),
                object_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await?;
        ids.extend(memberships.policies);
        Ok(ids.into_iter().collect())
    }

    /// Domains `user_id` created or holds a role in. Listing someone else's
    /// domains takes a platform admin.
    pub async fn list_user_domains(
        &self,
        token: &str,
        user_id: &str,
        mut page: Page,
    ) -> Result<DomainsPage, Error> {
        let key = self.identify(token).await?;
        let requester = user_of(&key);
        if requester != user_id && !self.is_platform_admin(requester).await {
            return Err(Error::new(ErrorKind::Authorization)
                .with_context(format!("{requester} cannot list domains of {user_id}")));
        }

        page.ids = self
            .roles
            .member_entity_ids(user_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        page.subject_id = Some(user_id.to_string());

        self.repo
            .list_domains(&page)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Capability permissions the bearer holds on the domain.
    pub async fn retrieve_domain_permissions(
        &self,
        token: &str,
        id: &str,
    ) -> Result<Permissions, Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, MEMBERSHIP_PERMISSION).await?;

        let filter: Vec<String> = Capability::ALL.iter().map(|c| c.permission()).collect();
        self.auth
            .list_permissions(
                &PolicyRequest {
                    subject: domain_subject(&key, id),
                    subject_type: Some(EntityType::User),
                    object: id.to_string(),
                    object_type: Some(EntityType::Domain),
                    ..Default::default()
                },
                &filter,
            )
            .await
    }

    /// Put users into the built-in role matching `relation`, provisioning
    /// the role on first use.
    #[tracing::instrument(skip(self, token, user_ids), fields(domain_id = %id, relation = %relation))]
    pub async fn assign_users(
        &self,
        token: &str,
        id: &str,
        user_ids: &[String],
        relation: &str,
    ) -> Result<(), Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, &Capability::AddRoleUsers.permission())
            .await?;
        let role_name = built_in_role_for(relation)?;
        if user_ids.is_empty() {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("no users to assign"));
        }

        let role = match self.roles.retrieve_role_by_entity_and_name(id, role_name).await {
            Ok(role) => role,
            Err(err) if err.contains(ErrorKind::NotFound) => {
                let capabilities = built_in_roles()
                    .remove(role_name)
                    .unwrap_or_default();
                self.provision_role(&key, id, role_name, capabilities, Vec::new())
                    .await?
                    .role
            }
            Err(err) => return Err(Error::wrap(ErrorKind::ViewEntity, err)),
        };
        self.add_members(&key, id, &role, user_ids).await?;
        Ok(())
    }

    /// Take the user out of every role of the domain and drop the relations
    /// it holds on the domain directly.
    #[tracing::instrument(skip(self, token), fields(domain_id = %id, user_id = %user_id))]
    pub async fn unassign_user(&self, token: &str, id: &str, user_id: &str) -> Result<(), Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, &Capability::RemoveRoleUsers.permission())
            .await?;

        let member = [user_id.to_string()];
        let roles = self
            .roles
            .retrieve_entity_roles(id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        for role in &roles {
            let holds = self
                .roles
                .role_check_members_exists(&role.id, &member)
                .await
                .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
            if holds {
                self.remove_members(&key, id, role, &member).await?;
            }
        }

        self.auth
            .delete_policy_filter(&PolicyRequest {
                subject: encode_domain_user_id(id, user_id),
                subject_type: Some(EntityType::User),
                object: id.to_string(),
                object_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await
    }

    /// Delete the domain, its roles, every tuple that names it and every
    /// tuple held by a domain-user subject of it, then the row.
    #[tracing::instrument(skip(self, token), fields(domain_id = %id))]
    pub async fn delete_domain(&self, token: &str, id: &str) -> Result<(), Error> {
        let key = self.identify(token).await?;
        self.authorize(&key, id, DELETE_PERMISSION).await?;

        let roles = self
            .roles
            .retrieve_entity_roles(id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;

        for subject in self.domain_user_subjects(id, &roles).await? {
            self.auth
                .delete_policy_filter(&PolicyRequest {
                    subject,
                    subject_type: Some(EntityType::User),
                    ..Default::default()
                })
                .await?;
        }
        for role in &roles {
            self.auth
                .delete_policy_filter(&PolicyRequest {
                    object: role.id.clone(),
                    object_type: Some(EntityType::Role),
                    ..Default::default()
                })
                .await?;
        }

        self.auth
            .delete_policy_filter(&PolicyRequest {
                object: id.to_string(),
                object_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await?;
        self.auth
            .delete_policy_filter(&PolicyRequest {
                subject: id.to_string(),
                subject_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await?;

        if !roles.is_empty() {
            let role_ids: Vec<String> = roles.into_iter().map(|r| r.id).collect();
            self.roles
                .remove_roles(&role_ids)
                .await
                .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        }

        self.repo
            .delete(id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;

        tracing::info!(domain_id = %id, "Domain deleted");
        Ok(())
    }

    /// Every `{domain}_{user}` subject known for the domain: relation holders
    /// on the domain itself plus every role member.
    async fn domain_user_subjects(
        &self,
        id: &str,
        roles: &[DomainRole],
    ) -> Result<BTreeSet<String>, Error> {
        let prefix = format!("{id}_");
        let holders = self
            .auth
            .list_all_subjects(&PolicyRequest {
                subject_type: Some(EntityType::User),
                permission: MEMBERSHIP_PERMISSION.to_string(),
                object: id.to_string(),
                object_type: Some(EntityType::Domain),
                ..Default::default()
            })
            .await?;
        let mut subjects: BTreeSet<String> = holders
            .policies
            .into_iter()
            .filter(|s| s.starts_with(&prefix))
            .collect();

        for role in roles {
            let mut offset = 0;
            loop {
                let page = self
                    .roles
                    .role_list_members(&role.id, DEFAULT_LIMIT, offset)
                    .await
                    .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
                let fetched = page.members.len() as u64;
                subjects.extend(
                    page.members
                        .iter()
                        .map(|member| encode_domain_user_id(id, member)),
                );
                offset += fetched;
                if fetched == 0 || offset >= page.total {
                    break;
                }
            }
        }
        Ok(subjects)
    }
}
