//! Domain lifecycle, including the policy rollback on a failed save.

mod common;

use common::{FailingDomainsRepository, FixedIdProvider, MockPolicyAgent, TestAuth};
use std::sync::Arc;
use tenant_auth::{
    error::ErrorKind,
    models::{
        domain::Capability,
        policy::{encode_domain_user_id, ADMINISTRATOR_RELATION, EDITOR_RELATION, PLATFORM_OBJECT},
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

#[tokio::test]
async fn failed_save_rolls_back_and_keeps_both_errors() -> Result<(), anyhow::Error> {
    let agent = Arc::new(MockPolicyAgent::new());
    agent.fail_delete();
    let t = TestAuth::new(agent.clone());
    let domains = t.domain_service(
        Arc::new(FailingDomainsRepository),
        Arc::new(FixedIdProvider::new("d1")),
    );

    let err = domains
        .create_domain(&t.token_for("u1"), Domain::new("acme"))
        .await
        .unwrap_err();

    assert!(err.contains(ErrorKind::CreateEntity));
    assert!(err.contains(ErrorKind::MalformedEntity));
    assert!(err.contains(ErrorKind::RollbackPolicy));
    assert!(err.secondary().is_some());

    let msg = err.to_string();
    assert!(msg.contains("mock store failure"));
    assert!(msg.contains("mock delete failure"));
    assert_eq!(agent.add_calls(), 1);
    assert_eq!(agent.delete_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_save_removes_written_policies() -> Result<(), anyhow::Error> {
    let agent = Arc::new(MockPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.domain_service(
        Arc::new(FailingDomainsRepository),
        Arc::new(FixedIdProvider::new("d1")),
    );

    let err = domains
        .create_domain(&t.token_for("u1"), Domain::new("acme"))
        .await
        .unwrap_err();

    assert!(err.contains(ErrorKind::CreateEntity));
    assert!(!err.contains(ErrorKind::RollbackPolicy));
    assert!(err.secondary().is_none());

    let added = agent.added();
    assert_eq!(added.len(), 2);
    assert!(added.iter().all(|pr| pr.object == "d1"));
    assert_eq!(agent.deleted(), added);
    Ok(())
}

#[tokio::test]
async fn create_rejects_unstorable_status() -> Result<(), anyhow::Error> {
    let agent = Arc::new(MockPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();

    for status in [DomainStatus::Freeze, DomainStatus::All] {
        let mut domain = Domain::new("acme");
        domain.status = status;
        let err = domains
            .create_domain(&t.token_for("u1"), domain)
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::InvalidStatus));
    }
    assert_eq!(agent.add_calls(), 0);

    let err = domains
        .create_domain(&t.token_for("u1"), Domain::new(""))
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));
    Ok(())
}

#[tokio::test]
async fn create_requires_valid_token() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let domains = t.in_memory_domains();

    let err = domains
        .create_domain("not-a-token", Domain::new("acme"))
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authentication));
    Ok(())
}

#[tokio::test]
async fn domain_lifecycle_with_in_memory_agent() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");
    let stranger = t.token_for("u2");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    assert_eq!(domain.created_by, "u1");
    assert_eq!(agent.len().await, 2);

    let fetched = domains.retrieve_domain(&owner, &domain.id).await?;
    assert_eq!(fetched.name, "Acme");

    let err = domains
        .retrieve_domain(&stranger, &domain.id)
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::DomainAuthorization));

    let req = DomainReq {
        name: Some("Acme Corp".to_string()),
        ..Default::default()
    };
    let updated = domains.update_domain(&owner, &domain.id, &req).await?;
    assert_eq!(updated.name, "Acme Corp");

    let listed = domains.list_domains(&owner, all_statuses()).await?;
    assert_eq!(listed.total, 1);
    assert_eq!(listed.domains[0].id, domain.id);
    assert_eq!(domains.list_domains(&stranger, all_statuses()).await?.total, 0);

    let disabled = domains
        .change_domain_status(&owner, &domain.id, DomainStatus::Disabled)
        .await?;
    assert_eq!(disabled.status, DomainStatus::Disabled);
    assert_eq!(disabled.name, "Acme Corp");

    let err = domains
        .change_domain_status(&stranger, &domain.id, DomainStatus::Enabled)
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));

    domains.delete_domain(&owner, &domain.id).await?;
    assert!(agent.is_empty().await);
    assert!(domains.retrieve_domain(&owner, &domain.id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn platform_admin_lists_every_domain() -> Result<(), anyhow::Error> {
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

    domains
        .create_domain(&t.token_for("u1"), Domain::new("one"))
        .await?;
    domains
        .create_domain(&t.token_for("u2"), Domain::new("two"))
        .await?;

    let listed = domains
        .list_domains(&t.token_for("root"), all_statuses())
        .await?;
    assert_eq!(listed.total, 2);

    let own = domains
        .list_domains(&t.token_for("u1"), all_statuses())
        .await?;
    assert_eq!(own.total, 1);
    assert_eq!(own.domains[0].name, "one");
    Ok(())
}

#[tokio::test]
async fn delete_removes_domain_user_tuples_on_other_objects() -> Result<(), anyhow::Error> {
    let agent = Arc::new(InMemoryPolicyAgent::new());
    let t = TestAuth::new(agent.clone());
    let domains = t.in_memory_domains();
    let owner = t.token_for("u1");

    let domain = domains.create_domain(&owner, Domain::new("Acme")).await?;
    domains
        .add_role(
            &owner,
            &domain.id,
            "ops",
            vec![Capability::Membership],
            vec!["u2".to_string()],
        )
        .await?;

    let held = |subject: String, relation: &str, object_type, object: &str| PolicyRequest {
        subject,
        subject_type: Some(EntityType::User),
        relation: relation.to_string(),
        object: object.to_string(),
        object_type: Some(object_type),
        ..Default::default()
    };
    agent
        .add_policies(&[
            held(
                encode_domain_user_id(&domain.id, "u1"),
                ADMINISTRATOR_RELATION,
                EntityType::Group,
                "g1",
            ),
            held(
                encode_domain_user_id(&domain.id, "u2"),
                EDITOR_RELATION,
                EntityType::Thing,
                "t1",
            ),
            held("u9".to_string(), ADMINISTRATOR_RELATION, EntityType::Group, "g1"),
        ])
        .await?;

    domains.delete_domain(&owner, &domain.id).await?;

    assert_eq!(agent.len().await, 1);
    let survivor = PolicyRequest {
        subject: "u9".to_string(),
        subject_type: Some(EntityType::User),
        permission: ADMINISTRATOR_RELATION.to_string(),
        object: "g1".to_string(),
        object_type: Some(EntityType::Group),
        ..Default::default()
    };
    agent.check_policy(&survivor).await?;
    Ok(())
}
