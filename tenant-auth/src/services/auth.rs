//! Credential issuance, identification and policy-based authorization.

use chrono::Duration;
use std::sync::Arc;

use crate::config::TokenDurationConfig;
use crate::db::{KeyRepository, PatsRepository};
use crate::error::{Error, ErrorKind};
use crate::models::key::now_utc;
use crate::models::pat::is_pat_token;
use crate::models::policy::{
    encode_domain_user_id, ADMIN_PERMISSION, DELETE_PERMISSION, EDIT_PERMISSION,
    MEMBERSHIP_PERMISSION, PLATFORM_OBJECT, PUBLISH_PERMISSION, SHARE_PERMISSION,
    SUBSCRIBE_PERMISSION, VIEW_PERMISSION,
};
use crate::models::{
    EntityType, Key, KeyKind, Permissions, PolicyPage, PolicyRequest, PublicKeyInfo,
    SubjectKind, Token,
};
use crate::services::callout::{Callout, CalloutRequest};
use crate::services::id::IdProvider;
use crate::services::pats;
use crate::services::policy_agent::PolicyAgent;
use crate::services::tokenizer::{Tokenizer, TokenizerError};

const DEFAULT_LIMIT: u64 = 100;

const THING_PERMISSIONS: &[&str] = &[
    ADMIN_PERMISSION,
    DELETE_PERMISSION,
    EDIT_PERMISSION,
    VIEW_PERMISSION,
    SHARE_PERMISSION,
    PUBLISH_PERMISSION,
    SUBSCRIBE_PERMISSION,
];

const GROUP_PERMISSIONS: &[&str] = &[
    ADMIN_PERMISSION,
    DELETE_PERMISSION,
    EDIT_PERMISSION,
    VIEW_PERMISSION,
    MEMBERSHIP_PERMISSION,
    SHARE_PERMISSION,
];

const DOMAIN_PERMISSIONS: &[&str] = &[
    ADMIN_PERMISSION,
    EDIT_PERMISSION,
    VIEW_PERMISSION,
    MEMBERSHIP_PERMISSION,
    SHARE_PERMISSION,
];

const PLATFORM_PERMISSIONS: &[&str] = &[ADMIN_PERMISSION, MEMBERSHIP_PERMISSION];

/// Lifetimes of the stateless key kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDurations {
    pub access: Duration,
    pub refresh: Duration,
    pub invitation: Duration,
    pub recovery: Duration,
}

impl TokenDurations {
    pub fn from_config(config: &TokenDurationConfig) -> Self {
        Self {
            access: Duration::minutes(config.access_minutes),
            refresh: Duration::minutes(config.refresh_minutes),
            invitation: Duration::minutes(config.invitation_minutes),
            ..Self::default()
        }
    }
}

impl Default for TokenDurations {
    fn default() -> Self {
        Self {
            access: Duration::hours(1),
            refresh: Duration::hours(24),
            invitation: Duration::days(7),
            recovery: Duration::minutes(5),
        }
    }
}

/// `ObjectType = Platform` requires the platform singleton as object.
pub fn policy_validation(pr: &PolicyRequest) -> Result<(), Error> {
    if pr.object_type == Some(EntityType::Platform) && pr.object != PLATFORM_OBJECT {
        return Err(
            Error::new(ErrorKind::Platform).with_context(format!("object {}", pr.object))
        );
    }
    Ok(())
}

fn default_permissions(object_type: Option<EntityType>) -> Result<Vec<String>, Error> {
    let defaults = match object_type {
        Some(EntityType::Thing) => THING_PERMISSIONS,
        Some(EntityType::Group) => GROUP_PERMISSIONS,
        Some(EntityType::Platform) => PLATFORM_PERMISSIONS,
        Some(EntityType::Domain) => DOMAIN_PERMISSIONS,
        _ => {
            return Err(Error::new(ErrorKind::MalformedEntity)
                .with_context("no default permissions for object type"))
        }
    };
    Ok(defaults.iter().map(|p| p.to_string()).collect())
}

#[derive(Clone)]
pub struct AuthService {
    keys: Arc<dyn KeyRepository>,
    pats: Arc<dyn PatsRepository>,
    id_provider: Arc<dyn IdProvider>,
    tokenizer: Arc<dyn Tokenizer>,
    agent: Arc<dyn PolicyAgent>,
    callout: Arc<dyn Callout>,
    durations: TokenDurations,
}

impl AuthService {
    pub fn new(
        keys: Arc<dyn KeyRepository>,
        pats: Arc<dyn PatsRepository>,
        id_provider: Arc<dyn IdProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        agent: Arc<dyn PolicyAgent>,
        callout: Arc<dyn Callout>,
        durations: TokenDurations,
    ) -> Self {
        Self {
            keys,
            pats,
            id_provider,
            tokenizer,
            agent,
            callout,
            durations,
        }
    }

    /// Issue a credential of `key.kind`. `token` is the requester's bearer;
    /// only the API, PAT and Refresh kinds read it.
    #[tracing::instrument(
        skip(self, token, key),
        fields(kind = key.kind.as_str(), user_id = %key.user)
    )]
    pub async fn issue(&self, token: &str, mut key: Key) -> Result<Token, Error> {
        key.issued_at = now_utc();
        match key.kind {
            KeyKind::Access => self.access_key(key).await,
            KeyKind::Refresh => self.refresh_key(token, key).await,
            KeyKind::Recovery => self.tmp_key(self.durations.recovery, key),
            KeyKind::Api => self.user_key(token, key).await,
            KeyKind::Pat => self.pat_key(token, key).await,
            KeyKind::Invitation => self.invitation_key(key).await,
        }
    }

    /// Remove the API key `id` issued by the bearer's owner.
    #[tracing::instrument(skip(self, token), fields(key_id = %id))]
    pub async fn revoke(&self, token: &str, id: &str) -> Result<(), Error> {
        let requester = self
            .authenticate(token)
            .map_err(|e| Error::wrap(ErrorKind::Revoke, e))?;
        self.keys
            .remove(&requester.issuer, id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Revoke, e))?;
        tracing::info!(issuer = %requester.issuer, key_id = %id, "API key revoked");
        Ok(())
    }

    pub async fn retrieve_key(&self, token: &str, id: &str) -> Result<Key, Error> {
        let requester = self
            .authenticate(token)
            .map_err(|e| Error::wrap(ErrorKind::Retrieve, e))?;
        self.keys
            .retrieve(&requester.issuer, id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Resolve a bearer to its claims.
    ///
    /// An expired API key is evicted from the key store on the way out; PAT
    /// bearers are verified against the PAT store.
    pub async fn identify(&self, token: &str) -> Result<Key, Error> {
        if is_pat_token(token) {
            let pat = pats::verify_bearer(&*self.pats, token).await?;
            return Ok(pats::key_for(&pat));
        }

        let key = match self.tokenizer.parse(token) {
            Ok(key) => key,
            Err(TokenizerError::Expired(expired)) => {
                if expired.kind == KeyKind::Api {
                    if let Err(err) = self.keys.remove(&expired.issuer, &expired.id).await {
                        tracing::warn!(
                            key_id = %expired.id,
                            error = %err,
                            "Failed to evict expired API key"
                        );
                    }
                }
                return Err(Error::wrap(
                    ErrorKind::Authentication,
                    Error::new(ErrorKind::KeyExpired),
                ));
            }
            Err(err) => {
                return Err(Error::wrap(
                    ErrorKind::Authentication,
                    Error::wrap(ErrorKind::Identify, Error::from(err)),
                ))
            }
        };

        match key.kind {
            KeyKind::Access | KeyKind::Refresh | KeyKind::Recovery | KeyKind::Invitation => {
                Ok(key)
            }
            KeyKind::Api => {
                self.keys
                    .retrieve(&key.issuer, &key.id)
                    .await
                    .map_err(|e| Error::wrap(ErrorKind::Authentication, e))?;
                Ok(key)
            }
            KeyKind::Pat => Err(Error::new(ErrorKind::Authentication)
                .with_context("PAT claims must be presented as a PAT bearer")),
        }
    }

    /// Decide `pr`. Success is `Ok(())`; every denial is a typed error.
    #[tracing::instrument(
        skip(self, pr),
        fields(object = %pr.object, action = %pr.action())
    )]
    pub async fn authorize(&self, pr: &PolicyRequest) -> Result<(), Error> {
        let pr = self.resolve_subject(pr).await?;
        self.check_policy(&pr).await?;
        self.callout
            .callout(&CalloutRequest::from_policy(&pr))
            .await
    }

    async fn resolve_subject(&self, pr: &PolicyRequest) -> Result<PolicyRequest, Error> {
        policy_validation(pr).map_err(|e| Error::wrap(ErrorKind::InvalidPolicy, e))?;

        let mut pr = pr.clone();
        if pr.subject_kind == Some(SubjectKind::Token) {
            let key = self
                .identify(&pr.subject)
                .await
                .map_err(|e| Error::wrap(ErrorKind::Authentication, e))?;
            if key.subject.is_empty() {
                if pr.object_type.is_some_and(EntityType::is_domain_scoped) {
                    return Err(Error::new(ErrorKind::DomainAuthorization)
                        .with_context("token is not bound to a domain"));
                }
                return Err(Error::new(ErrorKind::Authentication).with_context("empty subject"));
            }
            pr.subject = key.subject;
            pr.domain = key.domain;
        }
        Ok(pr)
    }

    /// Validation, domain gate and policy check, without the callout.
    async fn check_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        if pr.subject_type == Some(EntityType::User)
            && pr.object_type.is_some_and(EntityType::is_domain_scoped)
        {
            let domain_id = if !pr.domain.is_empty() {
                pr.domain.as_str()
            } else if pr.object_type == Some(EntityType::Domain) {
                pr.object.as_str()
            } else {
                return Err(Error::new(ErrorKind::DomainAuthorization)
                    .with_context("request carries no domain"));
            };
            self.check_domain(&pr.subject, domain_id).await?;
        }

        self.agent
            .check_policy(pr)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authorization, e))
    }

    async fn check_domain(&self, subject: &str, domain_id: &str) -> Result<(), Error> {
        let membership = PolicyRequest {
            subject: subject.to_string(),
            subject_type: Some(EntityType::User),
            permission: MEMBERSHIP_PERMISSION.to_string(),
            object: domain_id.to_string(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        };
        self.agent
            .check_policy(&membership)
            .await
            .map_err(|e| Error::wrap(ErrorKind::DomainAuthorization, e))
    }

    /// Subject a key acts as inside its domain: the plain user id for a
    /// platform admin, the domain-user id for a member, empty when the key
    /// names no domain.
    pub async fn check_user_domain(&self, key: &Key) -> Result<String, Error> {
        if key.domain.is_empty() {
            return Ok(String::new());
        }

        let platform_admin = PolicyRequest {
            subject: key.user.clone(),
            subject_type: Some(EntityType::User),
            permission: ADMIN_PERMISSION.to_string(),
            object: PLATFORM_OBJECT.to_string(),
            object_type: Some(EntityType::Platform),
            ..Default::default()
        };
        if self.check_policy(&platform_admin).await.is_ok() {
            return Ok(key.user.clone());
        }

        let subject = encode_domain_user_id(&key.domain, &key.user);
        let membership = PolicyRequest {
            subject: subject.clone(),
            subject_type: Some(EntityType::User),
            permission: MEMBERSHIP_PERMISSION.to_string(),
            object: key.domain.clone(),
            object_type: Some(EntityType::Domain),
            ..Default::default()
        };
        self.check_policy(&membership).await?;
        Ok(subject)
    }

    pub async fn add_policy(&self, pr: &PolicyRequest) -> Result<(), Error> {
        policy_validation(pr).map_err(|e| Error::wrap(ErrorKind::InvalidPolicy, e))?;
        self.agent
            .add_policy(pr)
            .await
            .map_err(|e| Error::wrap(ErrorKind::AddPolicies, e))
    }

    /// Every request is validated before any is written.
    pub async fn add_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        for pr in prs {
            policy_validation(pr).map_err(|e| Error::wrap(ErrorKind::InvalidPolicy, e))?;
        }
        self.agent
            .add_policies(prs)
            .await
            .map_err(|e| Error::wrap(ErrorKind::AddPolicies, e))
    }

    pub async fn delete_policy_filter(&self, pr: &PolicyRequest) -> Result<(), Error> {
        self.agent
            .delete_policy_filter(pr)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemovePolicies, e))
    }

    pub async fn delete_policies(&self, prs: &[PolicyRequest]) -> Result<(), Error> {
        for pr in prs {
            policy_validation(pr).map_err(|e| Error::wrap(ErrorKind::InvalidPolicy, e))?;
        }
        self.agent
            .delete_policies(prs)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemovePolicies, e))
    }

    pub async fn list_objects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<PolicyPage, Error> {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        let (tuples, next_page_token) = self
            .agent
            .retrieve_objects(pr, next_page_token, limit)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        Ok(PolicyPage {
            policies: tuples.into_iter().map(|t| t.object).collect(),
            next_page_token,
        })
    }

    pub async fn list_all_objects(&self, pr: &PolicyRequest) -> Result<PolicyPage, Error> {
        let tuples = self
            .agent
            .retrieve_all_objects(pr)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        Ok(PolicyPage {
            policies: tuples.into_iter().map(|t| t.object).collect(),
            next_page_token: String::new(),
        })
    }

    pub async fn count_objects(&self, pr: &PolicyRequest) -> Result<u64, Error> {
        self.agent.retrieve_all_objects_count(pr).await
    }

    pub async fn list_subjects(
        &self,
        pr: &PolicyRequest,
        next_page_token: &str,
        limit: u64,
    ) -> Result<PolicyPage, Error> {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        let (tuples, next_page_token) = self
            .agent
            .retrieve_subjects(pr, next_page_token, limit)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        Ok(PolicyPage {
            policies: tuples.into_iter().map(|t| t.subject).collect(),
            next_page_token,
        })
    }

    pub async fn list_all_subjects(&self, pr: &PolicyRequest) -> Result<PolicyPage, Error> {
        let tuples = self
            .agent
            .retrieve_all_subjects(pr)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        Ok(PolicyPage {
            policies: tuples.into_iter().map(|t| t.subject).collect(),
            next_page_token: String::new(),
        })
    }

    pub async fn count_subjects(&self, pr: &PolicyRequest) -> Result<u64, Error> {
        self.agent.retrieve_all_subjects_count(pr).await
    }

    /// Permissions the subject holds on the object, restricted to `filter`.
    /// An empty filter falls back to the object type's default set.
    pub async fn list_permissions(
        &self,
        pr: &PolicyRequest,
        filter: &[String],
    ) -> Result<Permissions, Error> {
        let filter = if filter.is_empty() {
            default_permissions(pr.object_type)?
        } else {
            filter.to_vec()
        };
        self.agent
            .retrieve_permissions(pr, &filter)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Delete every tuple that names the entity on either side it can appear.
    #[tracing::instrument(skip(self), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn delete_entity_policies(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<(), Error> {
        match entity_type {
            EntityType::Thing => {
                self.delete_policy_filter(&PolicyRequest {
                    object: id.to_string(),
                    object_type: Some(EntityType::Thing),
                    ..Default::default()
                })
                .await
            }
            EntityType::User => {
                self.delete_policy_filter(&PolicyRequest {
                    subject: id.to_string(),
                    subject_type: Some(EntityType::User),
                    ..Default::default()
                })
                .await
            }
            EntityType::Group => {
                self.delete_policy_filter(&PolicyRequest {
                    subject: id.to_string(),
                    subject_type: Some(EntityType::Group),
                    ..Default::default()
                })
                .await?;
                self.delete_policy_filter(&PolicyRequest {
                    object: id.to_string(),
                    object_type: Some(EntityType::Group),
                    ..Default::default()
                })
                .await
            }
            other => Err(Error::new(ErrorKind::InvalidEntityType)
                .with_context(format!("cannot delete policies of {other}"))),
        }
    }

    /// JWKS entries of the signing key.
    pub fn public_keys(&self) -> Result<Vec<PublicKeyInfo>, Error> {
        Ok(self.tokenizer.public_keys()?)
    }

    /// Parse a login bearer. Only Access keys with an issuer qualify.
    fn authenticate(&self, token: &str) -> Result<Key, Error> {
        let key = self
            .tokenizer
            .parse(token)
            .map_err(|e| Error::wrap(ErrorKind::Authentication, Error::from(e)))?;
        if key.kind != KeyKind::Access || key.issuer.is_empty() {
            return Err(Error::new(ErrorKind::Authentication).with_context("not a login key"));
        }
        Ok(key)
    }

    fn sign(&self, key: &Key, kind: ErrorKind) -> Result<String, Error> {
        self.tokenizer
            .issue(key)
            .map_err(|e| Error::wrap(kind, Error::from(e)))
    }

    /// Access token plus its refresh companion.
    fn login_pair(&self, mut key: Key) -> Result<Token, Error> {
        key.kind = KeyKind::Access;
        key.expires_at = Some(key.issued_at + self.durations.access);
        let access = self.sign(&key, ErrorKind::IssueTmp)?;

        key.kind = KeyKind::Refresh;
        key.expires_at = Some(key.issued_at + self.durations.refresh);
        let refresh = self.sign(&key, ErrorKind::IssueTmp)?;

        Ok(Token::bearer(access, Some(refresh)))
    }

    async fn access_key(&self, mut key: Key) -> Result<Token, Error> {
        key.subject = self
            .check_user_domain(&key)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authorization, e))?;
        self.login_pair(key)
    }

    async fn refresh_key(&self, token: &str, mut key: Key) -> Result<Token, Error> {
        let refresh = self
            .tokenizer
            .parse(token)
            .map_err(|e| Error::wrap(ErrorKind::Retrieve, Error::from(e)))?;
        if refresh.kind != KeyKind::Refresh {
            return Err(Error::new(ErrorKind::IssueUser).with_context("not a refresh key"));
        }

        key.id = refresh.id;
        if key.domain.is_empty() {
            key.domain = refresh.domain;
        }
        key.user = refresh.user;
        key.issuer = refresh.issuer;

        key.subject = self
            .check_user_domain(&key)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authorization, e))?;
        self.login_pair(key)
    }

    fn tmp_key(&self, duration: Duration, mut key: Key) -> Result<Token, Error> {
        key.expires_at = Some(key.issued_at + duration);
        let token = self.sign(&key, ErrorKind::IssueTmp)?;
        Ok(Token::bearer(token, None))
    }

    async fn invitation_key(&self, mut key: Key) -> Result<Token, Error> {
        key.expires_at = Some(key.issued_at + self.durations.invitation);
        key.subject = self.check_user_domain(&key).await?;
        let token = self.sign(&key, ErrorKind::IssueTmp)?;
        Ok(Token::bearer(token, None))
    }

    async fn user_key(&self, token: &str, mut key: Key) -> Result<Token, Error> {
        let requester = self
            .authenticate(token)
            .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;

        key.issuer = requester.issuer;
        if key.subject.is_empty() {
            key.subject = requester.subject;
        }
        if key.user.is_empty() {
            key.user = requester.user;
        }
        key.id = self
            .id_provider
            .id()
            .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;

        self.keys
            .save(&key)
            .await
            .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;
        let token = self.sign(&key, ErrorKind::IssueUser)?;

        tracing::info!(issuer = %key.issuer, key_id = %key.id, "API key issued");
        Ok(Token::bearer(token, None))
    }

    /// Mint an unscoped PAT for the requester. Expiry comes from the key, or
    /// the refresh duration when the key carries none in the future.
    async fn pat_key(&self, token: &str, key: Key) -> Result<Token, Error> {
        let requester = self
            .authenticate(token)
            .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;
        let owner = if requester.user.is_empty() {
            requester.issuer
        } else {
            requester.user
        };

        let expires_at = key
            .expires_at
            .filter(|at| *at > key.issued_at)
            .unwrap_or(key.issued_at + self.durations.refresh);
        let name = self
            .id_provider
            .id()
            .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;

        let pat = pats::mint(
            &*self.pats,
            &*self.id_provider,
            &owner,
            &name,
            "",
            expires_at,
        )
        .await
        .map_err(|e| Error::wrap(ErrorKind::IssueUser, e))?;

        tracing::info!(user_id = %owner, pat_id = %pat.id, "PAT issued");
        Ok(Token::bearer(pat.secret, None))
    }
}
