//! Shared doubles and builders for tenant-auth integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tenant_auth::{
    db::{
        memory::{
            InMemoryDomainsRepository, InMemoryKeyRepository, InMemoryPatsRepository,
            InMemoryRolesRepository,
        },
        DomainsRepository,
    },
    error::{Error, ErrorKind},
    models::{key::now_utc, Domain, DomainReq, DomainsPage, Key, KeyKind, Page, PolicyRequest},
    services::{
        tokenizer::{KeyAlgorithm, SymmetricTokenizer},
        AuthService, Callout, DomainService, IdProvider, NoopCallout, PatService, PolicyAgent,
        TokenDurations, Tokenizer, UuidProvider,
    },
    AppState,
};

pub const TEST_SECRET: &[u8] = b"integration-test-secret-0123456789";

/// Policy agent that records every call and answers from configuration.
#[derive(Default)]
pub struct MockPolicyAgent {
    checks: Mutex<Vec<PolicyRequest>>,
    added: Mutex<Vec<PolicyRequest>>,
    deleted: Mutex<Vec<PolicyRequest>>,
    add_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    denied_actions: Mutex<HashSet<String>>,
    fail_add: AtomicBool,
    fail_delete: AtomicBool,
}

impl MockPolicyAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every check whose permission (or relation) is `action` is denied.
    pub fn deny(&self, action: &str) {
        self.denied_actions.lock().unwrap().insert(action.to_string());
    }

    pub fn fail_add(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn checks(&self) -> Vec<PolicyRequest> {
        self.checks.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<PolicyRequest> {
        self.added.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<PolicyRequest> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyAgent for MockPolicyAgent {
    async fn check_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        self.checks.lock().unwrap().push(pr.clone());
        if self.denied_actions.lock().unwrap().contains(pr.action()) {
            return Err(Error::new(ErrorKind::Authorization).with_context("mock denial"));
        }
        Ok(())
    }

    async fn add_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("mock add failure"));
        }
        self.added.lock().unwrap().extend_from_slice(prs);
        Ok(())
    }

    async fn delete_policy_filter(&self, pr: &PolicyRequest) -> Result<(), Error> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("mock delete failure"));
        }
        self.deleted.lock().unwrap().push(pr.clone());
        Ok(())
    }

    async fn delete_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("mock delete failure"));
        }
        self.deleted.lock().unwrap().extend_from_slice(prs);
        Ok(())
    }

    async fn retrieve_objects(
        &self,
        _pr: &PolicyRequest,
        _next_page_token: &str,
        _limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        Ok((Vec::new(), String::new()))
    }

    async fn retrieve_all_objects(&self, _pr: &PolicyRequest) -> Result<Vec<PolicyRequest>, Error> {
        Ok(Vec::new())
    }

    async fn retrieve_subjects(
        &self,
        _pr: &PolicyRequest,
        _next_page_token: &str,
        _limit: u64,
    ) -> Result<(Vec<PolicyRequest>, String), Error> {
        Ok((Vec::new(), String::new()))
    }

    async fn retrieve_all_subjects(
        &self,
        _pr: &PolicyRequest,
    ) -> Result<Vec<PolicyRequest>, Error> {
        Ok(Vec::new())
    }

    async fn retrieve_permissions(
        &self,
        _pr: &PolicyRequest,
        filter: &[String],
    ) -> Result<Vec<String>, Error> {
        Ok(filter.to_vec())
    }
}

/// Domain store whose writes always fail with a malformed-entity error.
#[derive(Default)]
pub struct FailingDomainsRepository;

fn malformed() -> Error {
    Error::new(ErrorKind::MalformedEntity).with_context("mock store failure")
}

#[async_trait]
impl DomainsRepository for FailingDomainsRepository {
    async fn save(&self, _domain: &Domain) -> Result<Domain, Error> {
        Err(malformed())
    }

    async fn retrieve_by_id(&self, _id: &str) -> Result<Domain, Error> {
        Err(Error::new(ErrorKind::NotFound))
    }

    async fn retrieve_all_by_ids(&self, _page: &Page) -> Result<DomainsPage, Error> {
        Ok(DomainsPage::default())
    }

    async fn update(&self, _id: &str, _user_id: &str, _req: &DomainReq) -> Result<Domain, Error> {
        Err(malformed())
    }

    async fn delete(&self, _id: &str) -> Result<(), Error> {
        Err(malformed())
    }

    async fn list_domains(&self, _page: &Page) -> Result<DomainsPage, Error> {
        Ok(DomainsPage::default())
    }
}

/// Hands out the same id on every call.
pub struct FixedIdProvider(pub String);

impl FixedIdProvider {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl IdProvider for FixedIdProvider {
    fn id(&self) -> Result<String, Error> {
        Ok(self.0.clone())
    }
}

pub fn tokenizer() -> Arc<dyn Tokenizer> {
    Arc::new(
        SymmetricTokenizer::new(KeyAlgorithm::Hs256, TEST_SECRET, None)
            .expect("Failed to create tokenizer"),
    )
}

/// Signed Access token for `user`, issued by `user` itself.
pub fn access_token(
    tokenizer: &dyn Tokenizer,
    user: &str,
    subject: &str,
    domain: &str,
) -> String {
    let mut key = Key::new(KeyKind::Access);
    key.id = uuid::Uuid::new_v4().to_string();
    key.issuer = user.to_string();
    key.user = user.to_string();
    key.subject = subject.to_string();
    key.domain = domain.to_string();
    key.expires_at = Some(now_utc() + Duration::hours(1));
    tokenizer.issue(&key).expect("Failed to sign access token")
}

/// Auth service over in-memory stores, with handles on everything it uses.
pub struct TestAuth {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub keys: Arc<InMemoryKeyRepository>,
    pub pats: Arc<InMemoryPatsRepository>,
    pub auth: AuthService,
}

impl TestAuth {
    pub fn new(agent: Arc<dyn PolicyAgent>) -> Self {
        Self::with_callout(agent, Arc::new(NoopCallout))
    }

    pub fn with_callout(agent: Arc<dyn PolicyAgent>, callout: Arc<dyn Callout>) -> Self {
        Self::with_parts(tokenizer(), agent, callout)
    }

    pub fn with_parts(
        tokenizer: Arc<dyn Tokenizer>,
        agent: Arc<dyn PolicyAgent>,
        callout: Arc<dyn Callout>,
    ) -> Self {
        let keys = Arc::new(InMemoryKeyRepository::new());
        let pats = Arc::new(InMemoryPatsRepository::new());
        let auth = AuthService::new(
            keys.clone(),
            pats.clone(),
            Arc::new(UuidProvider),
            tokenizer.clone(),
            agent,
            callout,
            TokenDurations::default(),
        );
        Self {
            tokenizer,
            keys,
            pats,
            auth,
        }
    }

    pub fn token_for(&self, user: &str) -> String {
        access_token(&*self.tokenizer, user, "", "")
    }

    pub fn domain_service(
        &self,
        repo: Arc<dyn DomainsRepository>,
        id_provider: Arc<dyn IdProvider>,
    ) -> DomainService {
        DomainService::new(
            repo,
            Arc::new(InMemoryRolesRepository::new()),
            self.auth.clone(),
            id_provider,
        )
    }

    pub fn in_memory_domains(&self) -> DomainService {
        self.domain_service(
            Arc::new(InMemoryDomainsRepository::new()),
            Arc::new(UuidProvider),
        )
    }

    pub fn pat_service(&self) -> PatService {
        PatService::new(self.pats.clone(), self.auth.clone(), Arc::new(UuidProvider))
    }

    /// Router state over in-memory stores, without a database pool.
    pub fn app_state(&self) -> AppState {
        AppState {
            service_name: "tenant-auth-test".to_string(),
            service_version: "0.0.0".to_string(),
            auth: self.auth.clone(),
            domains: self.in_memory_domains(),
            pats: self.pat_service(),
            pool: None,
        }
    }
}

pub fn expired_at() -> chrono::DateTime<Utc> {
    Utc::now() - Duration::minutes(1)
}
