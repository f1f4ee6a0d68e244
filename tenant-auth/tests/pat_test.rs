//! Personal access token lifecycle and scope checks.

mod common;

use chrono::Duration;
use common::{MockPolicyAgent, TestAuth};
use std::sync::Arc;
use tenant_auth::{
    error::ErrorKind,
    models::{
        pat::ANY_IDS, DomainEntityType, OperationType, PatAuthzRequest, PatStatus, PatsPageMeta,
        PlatformEntityType, Scope,
    },
    services::PatService,
};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

async fn allows(
    svc: &PatService,
    secret: &str,
    domain_id: Option<&str>,
    operation: OperationType,
    entity_id: &str,
) -> bool {
    svc.check_scope_entry(
        secret,
        PlatformEntityType::Domains,
        domain_id,
        operation,
        &ids(&[entity_id]),
    )
    .await
    .is_ok()
}

#[tokio::test]
async fn pat_round_trip_until_revoked() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let scope = Scope::new(PlatformEntityType::Things, OperationType::Create, ids(&[ANY_IDS]));
    let pat = svc
        .create(&token, "ci", "deploy bot", Duration::hours(1), vec![scope])
        .await?;
    assert!(!pat.secret.is_empty());

    let identified = svc.identify_pat(&pat.secret).await?;
    assert_eq!(identified.id, pat.id);
    assert_eq!(identified.user, "u1");
    assert!(identified.secret.is_empty());

    svc.check_scope_entry(
        &pat.secret,
        PlatformEntityType::Things,
        None,
        OperationType::Create,
        &ids(&["t1"]),
    )
    .await?;

    svc.revoke_secret(&token, &pat.id).await?;
    let err = svc
        .check_scope_entry(
            &pat.secret,
            PlatformEntityType::Things,
            None,
            OperationType::Create,
            &ids(&["t1"]),
        )
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authentication));

    svc.reactivate_secret(&token, &pat.id).await?;
    svc.identify_pat(&pat.secret).await?;
    Ok(())
}

#[tokio::test]
async fn scope_check_matches_type_domain_operation_and_id() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let pat = svc
        .create(&token, "reader", "", Duration::hours(1), Vec::new())
        .await?;
    let scope = Scope::new(PlatformEntityType::Domains, OperationType::Read, ids(&["t1", "t2"]))
        .in_domain("d1", DomainEntityType::Things);
    svc.add_scope_entry(&token, &pat.id, scope).await?;

    let secret = pat.secret.as_str();
    assert!(allows(&svc, secret, Some("d1"), OperationType::Read, "t1").await);
    assert!(!allows(&svc, secret, Some("d1"), OperationType::Read, "t3").await);
    assert!(!allows(&svc, secret, Some("d2"), OperationType::Read, "t1").await);
    assert!(!allows(&svc, secret, Some("d1"), OperationType::Delete, "t1").await);

    // Every id must be granted.
    let err = svc
        .check_scope_entry(
            &pat.secret,
            PlatformEntityType::Domains,
            Some("d1"),
            OperationType::Read,
            &ids(&["t1", "t9"]),
        )
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));
    Ok(())
}

#[tokio::test]
async fn wildcard_entry_collapses_same_key_entries() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let pat = svc
        .create(&token, "ops", "", Duration::hours(1), Vec::new())
        .await?;
    for entity in ["g1", "g2"] {
        let scope = Scope::new(PlatformEntityType::Groups, OperationType::Update, ids(&[entity]));
        svc.add_scope_entry(&token, &pat.id, scope).await?;
    }
    let scopes = svc.list_scopes(&token, &pat.id, 0, 0).await?;
    assert_eq!(scopes.total, 1);
    assert_eq!(scopes.scopes[0].entity_ids, ids(&["g1", "g2"]));

    let wildcard = Scope::new(PlatformEntityType::Groups, OperationType::Update, ids(&[ANY_IDS]));
    svc.add_scope_entry(&token, &pat.id, wildcard.clone()).await?;
    let scopes = svc.list_scopes(&token, &pat.id, 0, 0).await?;
    assert_eq!(scopes.total, 1);
    assert_eq!(scopes.scopes[0].entity_ids, ids(&[ANY_IDS]));

    svc.check_scope_entry(
        &pat.secret,
        PlatformEntityType::Groups,
        None,
        OperationType::Update,
        &ids(&["g42"]),
    )
    .await?;

    svc.remove_scope_entry(&token, &pat.id, wildcard).await?;
    assert_eq!(svc.list_scopes(&token, &pat.id, 0, 0).await?.total, 0);
    Ok(())
}

#[tokio::test]
async fn reset_secret_keeps_id_and_scopes() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let scope = Scope::new(PlatformEntityType::Channels, OperationType::Publish, ids(&["c1"]));
    let pat = svc
        .create(&token, "publisher", "", Duration::hours(1), vec![scope])
        .await?;

    let reset = svc.reset_secret(&token, &pat.id, Duration::days(30)).await?;
    assert_eq!(reset.id, pat.id);
    assert_ne!(reset.secret, pat.secret);
    assert!(reset.expires_at > pat.expires_at);

    let err = svc.identify_pat(&pat.secret).await.unwrap_err();
    assert!(err.contains(ErrorKind::Authentication));

    svc.check_scope_entry(
        &reset.secret,
        PlatformEntityType::Channels,
        None,
        OperationType::Publish,
        &ids(&["c1"]),
    )
    .await?;
    Ok(())
}

fn thing_read(user_id: &str, pat_id: &str, entity_id: &str) -> PatAuthzRequest {
    PatAuthzRequest {
        user_id: user_id.to_string(),
        pat_id: pat_id.to_string(),
        platform_entity_type: PlatformEntityType::Things,
        domain_id: None,
        operation: OperationType::Read,
        entity_ids: ids(&[entity_id]),
    }
}

#[tokio::test]
async fn authorize_pat_records_last_use() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let scope = Scope::new(PlatformEntityType::Things, OperationType::Read, ids(&["t1"]));
    let pat = svc
        .create(&token, "cli", "", Duration::hours(1), vec![scope])
        .await?;
    assert!(svc.retrieve(&token, &pat.id).await?.last_used_at.is_none());

    let authorized = svc
        .authorize_pat(&pat.secret, &thing_read("u1", &pat.id, "t1"))
        .await?;
    assert_eq!(authorized.id, pat.id);
    assert!(authorized.secret.is_empty());
    assert!(svc.retrieve(&token, &pat.id).await?.last_used_at.is_some());
    Ok(())
}

#[tokio::test]
async fn authorize_pat_rejects_other_callers_and_unscoped_use() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let scope = Scope::new(PlatformEntityType::Things, OperationType::Read, ids(&["t1"]));
    let pat = svc
        .create(&token, "cli", "", Duration::hours(1), vec![scope])
        .await?;

    let err = svc
        .authorize_pat(&pat.secret, &thing_read("u2", &pat.id, "t1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);

    let err = svc
        .authorize_pat(&pat.secret, &thing_read("u1", "another-pat", "t1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);

    let err = svc
        .authorize_pat(&pat.secret, &thing_read("u1", &pat.id, "t2"))
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authorization));

    assert!(svc.retrieve(&token, &pat.id).await?.last_used_at.is_none());
    Ok(())
}

#[tokio::test]
async fn update_list_and_delete() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let first = svc
        .create(&token, "first", "", Duration::hours(1), Vec::new())
        .await?;
    svc.create(&token, "second", "", Duration::hours(1), Vec::new())
        .await?;

    let renamed = svc.update_name(&token, &first.id, "renamed").await?;
    assert_eq!(renamed.name, "renamed");
    assert!(renamed.secret.is_empty());
    let described = svc.update_description(&token, &first.id, "nightly").await?;
    assert_eq!(described.description, "nightly");

    let page = svc.list(&token, &PatsPageMeta::default()).await?;
    assert_eq!(page.total, 2);
    assert!(page.pats.iter().all(|p| p.secret.is_empty()));

    svc.revoke_secret(&token, &first.id).await?;
    let revoked = PatsPageMeta {
        status: Some(PatStatus::Revoked),
        ..Default::default()
    };
    assert_eq!(svc.list(&token, &revoked).await?.total, 1);

    svc.delete(&token, &first.id).await?;
    let err = svc.retrieve(&token, &first.id).await.unwrap_err();
    assert!(err.contains(ErrorKind::NotFound));

    // PATs are listed per owner.
    let stranger = t.token_for("u2");
    assert_eq!(svc.list(&stranger, &PatsPageMeta::default()).await?.total, 0);
    Ok(())
}

#[tokio::test]
async fn create_rejects_bad_input() -> Result<(), anyhow::Error> {
    let t = TestAuth::new(Arc::new(MockPolicyAgent::new()));
    let svc = t.pat_service();
    let token = t.token_for("u1");

    let err = svc
        .create(&token, "", "", Duration::hours(1), Vec::new())
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));

    let err = svc
        .create(&token, "zero", "", Duration::zero(), Vec::new())
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));

    let empty = Scope::new(PlatformEntityType::Things, OperationType::Read, Vec::new());
    let err = svc
        .create(&token, "empty", "", Duration::hours(1), vec![empty])
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::MalformedEntity));

    let err = svc
        .create("garbage", "x", "", Duration::hours(1), Vec::new())
        .await
        .unwrap_err();
    assert!(err.contains(ErrorKind::Authentication));
    Ok(())
}
