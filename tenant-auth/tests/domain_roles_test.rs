//! Domain roles and member management over the in-memory relation store.

mod common;

use common::TestAuth;
use std::sync::Arc;
use tenant_auth::{
    error::ErrorKind,
    models::{
        domain::Capability,
        policy::{ADMINISTRATOR_RELATION, MEMBER_RELATION, PLATFORM_OBJECT},
        Domain, DomainReq, DomainStatus, EntityType, Page, PolicyRequest,
    },
    services::{InMemoryPolicyAgent, PolicyAgent},
};

fn all_statuses() -> Page {
    Page {
        status: DomainStatus::All,
        ..Default::default()
    }
}

fn users(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn role_member_with_unbound_token_sees_domain() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");
    let member = t.token_for("u2");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    assert_eq!(domains.list_domains(&member, all_statuses()).await?.total, 0);

    domains
        .add_role(
            &owner,
            &domain.id,
            "viewer",
            vec![Capability::Membership, Capability::Read],
            users(&["u2"]),
        )
        .await?;

    let listed = domains.list_domains(&member, all_statuses()).await?;
    assert_eq!(listed.total, 1);
    assert_eq!(listed.domains[0].id, domain.id);

    let fetched = domains.retrieve_domain(&member, &domain.id).await?;
    assert_eq!(fetched.name, "Acme");

    let err = domains
        .update_domain(
            &member,
            &domain.id,
            &DomainReq {
                name: Some("Taken".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));
    Ok(())
}

#[tokio::test]
async fn assign_and_unassign_users() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");
    let member = t.token_for("u2");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    domains
        .assign_users(&owner, &domain.id, &users(&["u2"]), MEMBER_RELATION)
        .await?;

    assert_eq!(domains.list_domains(&member, all_statuses()).await?.total, 1);
    let held = domains
        .retrieve_domain_permissions(&member, &domain.id)
        .await?;
    assert_eq!(held, vec![Capability::Membership.permission()]);

    let owner_held = domains
        .retrieve_domain_permissions(&owner, &domain.id)
        .await?;
    assert_eq!(owner_held.len(), Capability::ALL.len());

    let err = domains
        .assign_users(&owner, &domain.id, &users(&["u3"]), "owner")
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));

    let err = domains
        .assign_users(&member, &domain.id, &users(&["u3"]), MEMBER_RELATION)
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));

    domains.unassign_user(&owner, &domain.id, "u2").await?;
    assert_eq!(domains.list_domains(&member, all_statuses()).await?.total, 0);
    assert!(domains
        .retrieve_domain_permissions(&member, &domain.id)
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn role_capabilities_and_members_drive_access() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");
    let operator = t.token_for("u3");
    let rename = DomainReq {
        name: Some("Renamed".to_string()),
        ..Default::default()
    };

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    let id = domain.id.as_str();

    let provision = domains
        .add_role(
            &owner,
            id,
            "ops",
            vec![Capability::Membership, Capability::Read],
            users(&["u3"]),
        )
        .await?;
    assert_eq!(provision.role.entity_id, id);
    assert_eq!(provision.role.created_by, "u1");

    domains.retrieve_domain(&operator, id).await?;
    assert!(domains.update_domain(&operator, id, &rename).await.is_err());

    domains
        .role_add_capabilities(&owner, id, "ops", &[Capability::Update])
        .await?;
    assert!(domains
        .role_check_capabilities_exists(&owner, id, "ops", &[Capability::Read, Capability::Update])
        .await?);
    assert_eq!(
        domains.role_list_capabilities(&owner, id, "ops").await?.len(),
        3
    );
    domains.update_domain(&operator, id, &rename).await?;

    domains
        .role_remove_capabilities(&owner, id, "ops", &[Capability::Update])
        .await?;
    assert!(domains.update_domain(&operator, id, &rename).await.is_err());

    let err = domains
        .role_add_capabilities(&owner, id, "ops", &[])
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));

    let renamed = domains
        .update_role_name(&owner, id, "ops", "operators")
        .await?;
    assert_eq!(renamed.name, "operators");
    assert_eq!(renamed.updated_by.as_deref(), Some("u1"));
    assert!(domains
        .retrieve_role(&owner, id, "ops")
        .await
        .unwrap_err()
        .contains(ErrorKind::NotFound));
    assert_eq!(domains.retrieve_all_roles(&owner, id, 0, 0).await?.total, 1);

    let members = domains
        .role_list_members(&owner, id, "operators", 10, 0)
        .await?;
    assert_eq!(members.members, users(&["u3"]));
    assert!(domains
        .role_check_members_exists(&owner, id, "operators", &users(&["u3"]))
        .await?);

    domains
        .role_remove_all_members(&owner, id, "operators")
        .await?;
    assert!(domains.retrieve_domain(&operator, id).await.is_err());

    domains
        .role_add_members(&owner, id, "operators", &users(&["u3"]))
        .await?;
    domains.retrieve_domain(&operator, id).await?;
    domains
        .role_remove_members(&owner, id, "operators", &users(&["u3"]))
        .await?;
    assert!(domains.retrieve_domain(&operator, id).await.is_err());

    domains.role_remove_all_capabilities(&owner, id, "operators").await?;
    domains.remove_role(&owner, id, "operators").await?;
    assert_eq!(domains.retrieve_all_roles(&owner, id, 0, 0).await?.total, 0);
    assert_eq!(agent.len().await, 2);
    Ok(())
}

#[tokio::test]
async fn duplicate_role_name_rolls_back_tuples() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    domains
        .add_role(&owner, &domain.id, "ops", vec![Capability::Read], Vec::new())
        .await?;
    let before = agent.len().await;

    let err = domains
        .add_role(
            &owner,
            &domain.id,
            "ops",
            vec![Capability::Update],
            users(&["u2"]),
        )
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::CreateEntity));
    assert!(err.contains(ErrorKind::Conflict));
    assert_eq!(agent.len().await, before);

    let err = domains
        .add_role(&t.token_for("u9"), &domain.id, "intruders", Vec::new(), Vec::new())
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));
    Ok(())
}

#[tokio::test]
async fn user_domains_are_listed_for_self_or_platform_admin() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    agent
        .add_policy(&PolicyRequest {
            subject: "root".to_string(),
            subject_type: Some(EntityType::User),
            relation: ADMINISTRATOR_RELATION.to_string(),
            object: PLATFORM_OBJECT.to_string(),
            object_type: Some(EntityType::Platform),
            ..Default::default()
        })
        .await?;
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    domains
        .create_domain(&t.token_for("u4"), Domain::new("Other"))
        .await?;
    domains
        .assign_users(&owner, &domain.id, &users(&["u2"]), ADMINISTRATOR_RELATION)
        .await?;

    let own = domains
        .list_user_domains(&owner, "u1", all_statuses())
        .await?;
    assert_eq!(own.total, 1);

    let err = domains
        .list_user_domains(&owner, "u2", all_statuses())
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));

    let theirs = domains
        .list_user_domains(&t.token_for("root"), "u2", all_statuses())
        .await?;
    assert_eq!(theirs.total, 1);
    assert_eq!(theirs.domains[0].id, domain.id);
    Ok(())
}
