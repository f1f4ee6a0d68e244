use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::RwLock;

use super::{denied, validate_filter, validate_tuple, PolicyAgent};
use crate::error::{Error, ErrorKind};
use crate::models::policy::{
    ADMINISTRATOR_RELATION, ADMIN_PERMISSION, CONTRIBUTOR_RELATION, DOMAIN_RELATION,
    EDITOR_RELATION, EDIT_PERMISSION, GROUP_RELATION, GUEST_RELATION, MEMBERSHIP_PERMISSION,
    MEMBER_RELATION, PARENT_GROUP_RELATION, PLATFORM_RELATION, SHARE_PERMISSION, VIEW_PERMISSION,
};
use crate::models::domain::{READ_PERMISSION, UPDATE_PERMISSION};
use crate::models::{EntityType, PolicyRequest};

const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Tuple {
    object_type: EntityType,
    object: String,
    relation: String,
    subject_type: EntityType,
    subject: String,
    subject_relation: String,
}

impl Tuple {
    fn from_request(pr: &PolicyRequest) -> Result<Self, Error> {
        validate_tuple(pr)?;
        let (Some(object_type), Some(subject_type)) = (pr.object_type, pr.subject_type) else {
            return Err(Error::new(ErrorKind::MalformedEntity));
        };
        Ok(Self {
            object_type,
            object: pr.object.clone(),
            relation: pr.relation.clone(),
            subject_type,
            subject: pr.subject.clone(),
            subject_relation: pr.subject_relation.clone(),
        })
    }

    fn matches_filter(&self, pr: &PolicyRequest) -> bool {
        (pr.subject.is_empty() || self.subject == pr.subject)
            && pr.subject_type.map_or(true, |t| self.subject_type == t)
            && (pr.object.is_empty() || self.object == pr.object)
            && pr.object_type.map_or(true, |t| self.object_type == t)
            && (pr.relation.is_empty() || self.relation == pr.relation)
    }
}

/// Relations whose subject is a parent object whose rights flow down.
fn is_structural(relation: &str) -> bool {
    matches!(
        relation,
        PLATFORM_RELATION | DOMAIN_RELATION | PARENT_GROUP_RELATION | GROUP_RELATION
    )
}

fn relation_grants(relation: &str, permission: &str) -> bool {
    if relation == permission {
        return true;
    }
    // Role capabilities are stored under the bare capability name.
    if permission
        .strip_suffix("_permission")
        .is_some_and(|capability| capability == relation)
    {
        return true;
    }
    match relation {
        ADMINISTRATOR_RELATION | ADMIN_PERMISSION => true,
        EDITOR_RELATION => matches!(
            permission,
            EDIT_PERMISSION
                | VIEW_PERMISSION
                | SHARE_PERMISSION
                | MEMBERSHIP_PERMISSION
                | UPDATE_PERMISSION
                | READ_PERMISSION
        ),
        CONTRIBUTOR_RELATION | GUEST_RELATION => {
            matches!(permission, VIEW_PERMISSION | READ_PERMISSION)
        }
        MEMBER_RELATION => matches!(
            permission,
            MEMBERSHIP_PERMISSION | VIEW_PERMISSION | READ_PERMISSION
        ),
        _ => false,
    }
}

/// Tuple store with a fixed relation-to-permission table.
#[derive(Debug, Default)]
pub struct InMemoryPolicyAgent {
    tuples: RwLock<BTreeSet<Tuple>>,
}

impl InMemoryPolicyAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tuples.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tuples.read().await.is_empty()
    }
}

fn has_permission(
    tuples: &BTreeSet<Tuple>,
    object_type: EntityType,
    object: &str,
    permission: &str,
    subject_type: Option<EntityType>,
    subject: &str,
    depth: usize,
) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }

    tuples
        .iter()
        .filter(|t| t.object_type == object_type && t.object == object)
        .any(|t| {
            let direct = t.subject == subject
                && subject_type.map_or(true, |st| st == t.subject_type)
                && t.subject_relation.is_empty()
                && relation_grants(&t.relation, permission);
            if direct {
                return true;
            }

            if !t.subject_relation.is_empty() && relation_grants(&t.relation, permission) {
                return has_permission(
                    tuples,
                    t.subject_type,
                    &t.subject,
                    &t.subject_relation,
                    subject_type,
                    subject,
                    depth + 1,
                );
            }

            is_structural(&t.relation)
                && has_permission(
                    tuples,
                    t.subject_type,
                    &t.subject,
                    permission,
                    subject_type,
                    subject,
                    depth + 1,
                )
        })
}

fn parse_cursor(token: &str) -> Result<usize, Error> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse().map_err(|_| {
        Error::new(ErrorKind::MalformedEntity).with_context(format!("invalid page token {token}"))
    })
}

fn paginate(
    items: Vec<PolicyRequest>,
    next_page_token: &str,
    limit: u64,
) -> Result<(Vec<PolicyRequest>, String), Error> {
    let start = parse_cursor(next_page_token)?;
    let limit = limit.max(1) as usize;
    let end = start.saturating_add(limit).min(items.len());
    let next = if end < items.len() {
        end.to_string()
    } else {
        String::new()
    };
    let page = items.into_iter().skip(start).take(limit).collect();
    Ok((page, next))
}

fn object_type_of(pr: &PolicyRequest) -> Result<EntityType, Error> {
    pr.object_type.ok_or_else(|| {
        Error::new(ErrorKind::MalformedEntity).with_context("object type is required")
    })
}

impl InMemoryPolicyAgent {
    async fn lookup_objects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        let object_type = object_type_of(pr)?;
        let tuples = self.tuples.read().await;

        let candidates: BTreeSet<&str> = tuples
            .iter()
            .filter(|t| t.object_type == object_type)
            .map(|t| t.object.as_str())
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|object| {
                has_permission(
                    &tuples,
                    object_type,
                    object,
                    pr.action(),
                    pr.subject_type,
                    &pr.subject,
                    0,
                )
            })
            .map(|object| PolicyRequest {
                object: object.to_string(),
                ..pr.clone()
            })
            .collect())
    }

    async fn lookup_subjects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        let object_type = object_type_of(pr)?;
        let tuples = self.tuples.read().await;

        let candidates: BTreeSet<(EntityType, &str)> = tuples
            .iter()
            .filter(|t| pr.subject_type.map_or(true, |st| st == t.subject_type))
            .map(|t| (t.subject_type, t.subject.as_str()))
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|(subject_type, subject)| {
                has_permission(
                    &tuples,
                    object_type,
                    &pr.object,
                    pr.action(),
                    Some(*subject_type),
                    subject,
                    0,
                )
            })
            .map(|(subject_type, subject)| PolicyRequest {
                subject: subject.to_string(),
                subject_type: Some(subject_type),
                ..pr.clone()
            })
            .collect())
    }
}

#[async_trait]
impl PolicyAgent for InMemoryPolicyAgent {
    async fn check_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        let object_type = object_type_of(pr)?;
        let tuples = self.tuples.read().await;
        if has_permission(
            &tuples,
            object_type,
            &pr.object,
            pr.action(),
            pr.subject_type,
            &pr.subject,
            0,
        ) {
            Ok(())
        } else {
            Err(denied(pr))
        }
    }

    async fn add_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        let batch = prs
            .iter()
            .map(Tuple::from_request)
            .collect::<Result<Vec<_>, _>>()?;
        let mut tuples = self.tuples.write().await;
        tuples.extend(batch);
        Ok(())
    }

    async fn delete_policy_filter(&self, pr: &PolicyRequest) -> Result<(), Error> {
        validate_filter(pr)?;
        let mut tuples = self.tuples.write().await;
        tuples.retain(|t| !t.matches_filter(pr));
        Ok(())
    }

    async fn delete_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        let batch = prs
            .iter()
            .map(Tuple::from_request)
            .collect::<Result<Vec<_>, _>>()?;
        let mut tuples = self.tuples.write().await;
        for tuple in &batch {
            tuples.remove(tuple);
        }
        Ok(())
    }

    async fn retrieve_objects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        paginate(self.lookup_objects(pr).await?, next_page_token, limit)
    }

    async fn retrieve_all_objects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        self.lookup_objects(pr).await
    }

    async fn retrieve_subjects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        paginate(self.lookup_subjects(pr).await?, next_page_token, limit)
    }

    async fn retrieve_all_subjects(&self, pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        self.lookup_subjects(pr).await
    }

    async fn retrieve_permissions(
        &self,
        pr: &PolicyRequest,
        filter: &[String],
    ) -> Result<Vec<String>, Error> {
        let object_type = object_type_of(pr)?;
        let tuples = self.tuples.read().await;
        Ok(filter
            .iter()
            .filter(|permission| {
                has_permission(
                    &tuples,
                    object_type,
                    &pr.object,
                    permission,
                    pr.subject_type,
                    &pr.subject,
                    0,
                )
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{DELETE_PERMISSION, PLATFORM_OBJECT};

    fn tuple(
        subject_type: EntityType,
        subject: &str,
        relation: &str,
        object_type: EntityType,
        object: &str,
    ) -> PolicyRequest {
        PolicyRequest {
            subject: subject.to_string(),
            subject_type: Some(subject_type),
            relation: relation.to_string(),
            object: object.to_string(),
            object_type: Some(object_type),
            ..Default::default()
        }
    }

    fn check(subject: &str, permission: &str, object_type: EntityType, object: &str) -> PolicyRequest {
        PolicyRequest {
            subject: subject.to_string(),
            subject_type: Some(EntityType::User),
            permission: permission.to_string(),
            object: object.to_string(),
            object_type: Some(object_type),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_relation_table() -> Result<(), anyhow::Error> {
        let agent = InMemoryPolicyAgent::new();
        agent
            .add_policies(&[
                tuple(EntityType::User, "admin", ADMINISTRATOR_RELATION, EntityType::Domain, "d1"),
                tuple(EntityType::User, "guest", GUEST_RELATION, EntityType::Domain, "d1"),
                tuple(EntityType::User, "member", MEMBER_RELATION, EntityType::Domain, "d1"),
            ])
            .await?;

        agent.check_policy(&check("admin", DELETE_PERMISSION, EntityType::Domain, "d1")).await?;
        agent.check_policy(&check("guest", VIEW_PERMISSION, EntityType::Domain, "d1")).await?;
        agent.check_policy(&check("member", MEMBERSHIP_PERMISSION, EntityType::Domain, "d1")).await?;

        let err = agent
            .check_policy(&check("guest", EDIT_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::Authorization));
        Ok(())
    }

    #[tokio::test]
    async fn test_platform_admin_inherits_domain_rights() -> Result<(), anyhow::Error> {
        let agent = InMemoryPolicyAgent::new();
        agent
            .add_policies(&[
                tuple(EntityType::User, "root", ADMINISTRATOR_RELATION, EntityType::Platform, PLATFORM_OBJECT),
                tuple(EntityType::Platform, PLATFORM_OBJECT, PLATFORM_RELATION, EntityType::Domain, "d1"),
                tuple(EntityType::Domain, "d1", DOMAIN_RELATION, EntityType::Thing, "t1"),
            ])
            .await?;

        agent.check_policy(&check("root", ADMIN_PERMISSION, EntityType::Domain, "d1")).await?;
        agent.check_policy(&check("root", DELETE_PERMISSION, EntityType::Thing, "t1")).await?;
        assert!(agent
            .check_policy(&check("other", VIEW_PERMISSION, EntityType::Thing, "t1"))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let agent = InMemoryPolicyAgent::new();
        let mut broken = tuple(EntityType::User, "u1", MEMBER_RELATION, EntityType::Domain, "d1");
        broken.relation.clear();

        let err = agent
            .add_policies(&[
                tuple(EntityType::User, "u1", MEMBER_RELATION, EntityType::Domain, "d2"),
                broken,
            ])
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::MalformedEntity));
        assert!(agent.is_empty().await);
    }

    #[tokio::test]
    async fn test_filter_delete_and_lookup() -> Result<(), anyhow::Error> {
        let agent = InMemoryPolicyAgent::new();
        agent
            .add_policies(&[
                tuple(EntityType::User, "u1", MEMBER_RELATION, EntityType::Domain, "d1"),
                tuple(EntityType::User, "u1", MEMBER_RELATION, EntityType::Domain, "d2"),
                tuple(EntityType::User, "u1", MEMBER_RELATION, EntityType::Domain, "d3"),
                tuple(EntityType::User, "u2", MEMBER_RELATION, EntityType::Domain, "d1"),
            ])
            .await?;

        let lookup = check("u1", MEMBERSHIP_PERMISSION, EntityType::Domain, "");
        let (page, next) = agent.retrieve_objects(&lookup, "", 2).await?;
        assert_eq!(page.iter().map(|p| p.object.as_str()).collect::<Vec<_>>(), vec!["d1", "d2"]);
        assert_eq!(next, "2");
        let (page, next) = agent.retrieve_objects(&lookup, &next, 2).await?;
        assert_eq!(page.len(), 1);
        assert!(next.is_empty());

        let subjects = check("", MEMBERSHIP_PERMISSION, EntityType::Domain, "d1");
        assert_eq!(agent.retrieve_all_subjects_count(&subjects).await?, 2);

        assert!(agent
            .delete_policy_filter(&PolicyRequest::default())
            .await
            .unwrap_err()
            .contains(ErrorKind::MalformedEntity));

        agent
            .delete_policy_filter(&PolicyRequest {
                subject: "u1".to_string(),
                ..Default::default()
            })
            .await?;
        assert_eq!(agent.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retrieve_permissions_intersects_filter() -> Result<(), anyhow::Error> {
        let agent = InMemoryPolicyAgent::new();
        agent
            .add_policy(&tuple(EntityType::User, "u1", EDITOR_RELATION, EntityType::Thing, "t1"))
            .await?;

        let filter: Vec<String> = [ADMIN_PERMISSION, EDIT_PERMISSION, VIEW_PERMISSION, DELETE_PERMISSION]
            .iter()
            .map(|p| p.to_string())
            .collect();
        let held = agent
            .retrieve_permissions(&check("u1", "", EntityType::Thing, "t1"), &filter)
            .await?;
        assert_eq!(held, vec![EDIT_PERMISSION.to_string(), VIEW_PERMISSION.to_string()]);
        Ok(())
    }
}
