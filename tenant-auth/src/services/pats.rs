//! Personal access tokens: lifecycle, secrets and scope entries.
//!
//! A PAT bearer embeds the owner id, the PAT id and the raw secret. Only the
//! secret's hash is stored; the plaintext bearer is handed out once, on
//! create and on secret reset.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::db::PatsRepository;
use crate::error::{Error, ErrorKind};
use crate::models::pat::{
    encode_pat_token, generate_secret, hash_secret, parse_pat_token, verify_secret,
};
use crate::models::{
    Key, KeyKind, OperationType, Pat, PatAuthzRequest, PatsPage, PatsPageMeta,
    PlatformEntityType, Role, Scope, ScopesPage,
};
use crate::services::auth::AuthService;
use crate::services::id::IdProvider;

/// Verify a PAT bearer against the stored hash and flags.
pub(crate) async fn verify_bearer(repo: &dyn PatsRepository, token: &str) -> Result<Pat, Error> {
    let parsed = parse_pat_token(token)?;

    let status = repo
        .retrieve_secret_and_revoke_status(&parsed.user_id, &parsed.pat_id)
        .await
        .map_err(|e| Error::wrap(ErrorKind::Authentication, e))?;

    if status.revoked {
        return Err(Error::new(ErrorKind::Authentication).with_context("PAT is revoked"));
    }
    if status.expired {
        return Err(Error::wrap(
            ErrorKind::Authentication,
            Error::new(ErrorKind::KeyExpired),
        ));
    }
    if !verify_secret(&parsed.secret, &status.hash) {
        return Err(Error::new(ErrorKind::Authentication).with_context("PAT secret mismatch"));
    }

    repo.retrieve(&parsed.user_id, &parsed.pat_id)
        .await
        .map_err(|e| Error::wrap(ErrorKind::Authentication, e))
}

/// Persist a new PAT and return it carrying its plaintext bearer.
pub(crate) async fn mint(
    repo: &dyn PatsRepository,
    id_provider: &dyn IdProvider,
    user_id: &str,
    name: &str,
    description: &str,
    expires_at: DateTime<Utc>,
) -> Result<Pat, Error> {
    let id = id_provider
        .id()
        .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?;
    let secret = generate_secret();

    let mut pat = Pat {
        id,
        user: user_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        secret: hash_secret(&secret),
        issued_at: Utc::now(),
        expires_at,
        updated_at: None,
        last_used_at: None,
        revoked: false,
        revoked_at: None,
    };
    repo.save(&pat)
        .await
        .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?;

    pat.secret = encode_pat_token(user_id, &pat.id, &secret);
    Ok(pat)
}

/// Claims presented by a verified PAT bearer.
pub(crate) fn key_for(pat: &Pat) -> Key {
    Key {
        id: pat.id.clone(),
        kind: KeyKind::Pat,
        issuer: pat.user.clone(),
        subject: pat.user.clone(),
        user: pat.user.clone(),
        domain: String::new(),
        role: Role::User,
        issued_at: pat.issued_at,
        expires_at: Some(pat.expires_at),
    }
}

fn clear_secret(mut pat: Pat) -> Pat {
    pat.secret.clear();
    pat
}

#[derive(Clone)]
pub struct PatService {
    repo: Arc<dyn PatsRepository>,
    auth: AuthService,
    id_provider: Arc<dyn IdProvider>,
}

impl PatService {
    pub fn new(
        repo: Arc<dyn PatsRepository>,
        auth: AuthService,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            repo,
            auth,
            id_provider,
        }
    }

    async fn identify(&self, token: &str) -> Result<String, Error> {
        let key = self
            .auth
            .identify(token)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Authentication, e))?;
        let user_id = if key.user.is_empty() {
            key.subject
        } else {
            key.user
        };
        if user_id.is_empty() {
            return Err(Error::new(ErrorKind::Authentication).with_context("token has no user"));
        }
        Ok(user_id)
    }

    /// Create a PAT and attach `scopes`. The returned secret is the only copy
    /// of the bearer.
    #[tracing::instrument(skip(self, token, description, scopes), fields(name = %name))]
    pub async fn create(
        &self,
        token: &str,
        name: &str,
        description: &str,
        duration: Duration,
        scopes: Vec<Scope>,
    ) -> Result<Pat, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("empty PAT name"));
        }
        if duration <= Duration::zero() {
            return Err(Error::new(ErrorKind::MalformedEntity)
                .with_context("non-positive PAT duration"));
        }
        for scope in &scopes {
            scope.validate()?;
        }

        let user_id = self.identify(token).await?;
        let pat = mint(
            &*self.repo,
            &*self.id_provider,
            &user_id,
            name,
            description,
            Utc::now() + duration,
        )
        .await?;

        if !scopes.is_empty() {
            let scopes: Vec<Scope> = scopes
                .into_iter()
                .map(|mut scope| {
                    scope.pat_id = pat.id.clone();
                    scope
                })
                .collect();
            self.repo
                .add_scope_entry(&user_id, &scopes)
                .await
                .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?;
        }

        tracing::info!(user_id = %user_id, pat_id = %pat.id, "PAT created");
        Ok(pat)
    }

    pub async fn update_name(&self, token: &str, pat_id: &str, name: &str) -> Result<Pat, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("empty PAT name"));
        }
        let user_id = self.identify(token).await?;
        self.repo
            .update_name(&user_id, pat_id, name)
            .await
            .map(clear_secret)
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    pub async fn update_description(
        &self,
        token: &str,
        pat_id: &str,
        description: &str,
    ) -> Result<Pat, Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .update_description(&user_id, pat_id, description)
            .await
            .map(clear_secret)
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))
    }

    pub async fn retrieve(&self, token: &str, pat_id: &str) -> Result<Pat, Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .retrieve(&user_id, pat_id)
            .await
            .map(clear_secret)
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    pub async fn list(&self, token: &str, meta: &PatsPageMeta) -> Result<PatsPage, Error> {
        let user_id = self.identify(token).await?;
        let mut page = self
            .repo
            .retrieve_all(&user_id, meta)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        page.pats = page.pats.into_iter().map(clear_secret).collect();
        Ok(page)
    }

    #[tracing::instrument(skip(self, token), fields(pat_id = %pat_id))]
    pub async fn delete(&self, token: &str, pat_id: &str) -> Result<(), Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .retrieve(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        self.repo
            .remove_all_scope_entry(pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        self.repo
            .remove(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;

        tracing::info!(user_id = %user_id, pat_id = %pat_id, "PAT deleted");
        Ok(())
    }

    /// Rotate the secret and push out the expiry. Id and scopes are kept.
    #[tracing::instrument(skip(self, token), fields(pat_id = %pat_id))]
    pub async fn reset_secret(
        &self,
        token: &str,
        pat_id: &str,
        duration: Duration,
    ) -> Result<Pat, Error> {
        if duration <= Duration::zero() {
            return Err(Error::new(ErrorKind::MalformedEntity)
                .with_context("non-positive PAT duration"));
        }
        let user_id = self.identify(token).await?;
        let secret = generate_secret();

        let mut pat = self
            .repo
            .update_token_hash(&user_id, pat_id, &hash_secret(&secret), Utc::now() + duration)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))?;
        pat.secret = encode_pat_token(&user_id, pat_id, &secret);

        tracing::info!(user_id = %user_id, pat_id = %pat_id, "PAT secret reset");
        Ok(pat)
    }

    pub async fn revoke_secret(&self, token: &str, pat_id: &str) -> Result<(), Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .revoke(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))?;
        tracing::info!(user_id = %user_id, pat_id = %pat_id, "PAT revoked");
        Ok(())
    }

    pub async fn reactivate_secret(&self, token: &str, pat_id: &str) -> Result<(), Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .reactivate(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))?;
        tracing::info!(user_id = %user_id, pat_id = %pat_id, "PAT reactivated");
        Ok(())
    }

    /// Add `scope` to the PAT. A scope holding the all-entities marker
    /// replaces every entry with the same key.
    pub async fn add_scope_entry(
        &self,
        token: &str,
        pat_id: &str,
        mut scope: Scope,
    ) -> Result<Scope, Error> {
        scope.validate()?;
        let user_id = self.identify(token).await?;
        scope.pat_id = pat_id.to_string();

        self.repo
            .add_scope_entry(&user_id, std::slice::from_ref(&scope))
            .await
            .map_err(|e| Error::wrap(ErrorKind::CreateEntity, e))?;
        Ok(scope)
    }

    pub async fn remove_scope_entry(
        &self,
        token: &str,
        pat_id: &str,
        mut scope: Scope,
    ) -> Result<Scope, Error> {
        scope.validate()?;
        let user_id = self.identify(token).await?;
        scope.pat_id = pat_id.to_string();

        self.repo
            .remove_scope_entry(&user_id, std::slice::from_ref(&scope))
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        Ok(scope)
    }

    pub async fn clear_all_scope_entry(&self, token: &str, pat_id: &str) -> Result<(), Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .retrieve(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))?;
        self.repo
            .remove_all_scope_entry(pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::RemoveEntity, e))
    }

    pub async fn list_scopes(
        &self,
        token: &str,
        pat_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<ScopesPage, Error> {
        let user_id = self.identify(token).await?;
        self.repo
            .retrieve(&user_id, pat_id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))?;
        self.repo
            .retrieve_scope(pat_id, offset, limit)
            .await
            .map_err(|e| Error::wrap(ErrorKind::ViewEntity, e))
    }

    /// Resolve a PAT bearer to its PAT.
    pub async fn identify_pat(&self, pa_token: &str) -> Result<Pat, Error> {
        verify_bearer(&*self.repo, pa_token).await.map(clear_secret)
    }

    /// Resolve a PAT bearer presented by `req.user_id` for the use `req`
    /// describes, then record the use. A PAT presented by anyone but its
    /// owner, or under another PAT id, fails authentication.
    #[tracing::instrument(skip(self, pa_token, req), fields(user_id = %req.user_id, pat_id = %req.pat_id))]
    pub async fn authorize_pat(&self, pa_token: &str, req: &PatAuthzRequest) -> Result<Pat, Error> {
        let pat = verify_bearer(&*self.repo, pa_token).await?;
        if pat.user != req.user_id || pat.id != req.pat_id {
            return Err(Error::new(ErrorKind::Authentication)
                .with_context("PAT does not belong to the caller"));
        }

        self.check_scopes(
            &pat,
            req.platform_entity_type,
            req.domain_id.as_deref(),
            req.operation,
            &req.entity_ids,
        )
        .await?;

        self.repo
            .update_last_used(&pat.user, &pat.id)
            .await
            .map_err(|e| Error::wrap(ErrorKind::UpdateEntity, e))?;
        Ok(clear_secret(pat))
    }

    /// Whether the bearer's scopes allow `operation` on every id in
    /// `entity_ids`.
    pub async fn check_scope_entry(
        &self,
        pa_token: &str,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_ids: &[String],
    ) -> Result<(), Error> {
        let pat = verify_bearer(&*self.repo, pa_token).await?;
        self.check_scopes(&pat, platform_entity_type, domain_id, operation, entity_ids)
            .await
    }

    async fn check_scopes(
        &self,
        pat: &Pat,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_ids: &[String],
    ) -> Result<(), Error> {
        if entity_ids.is_empty() {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("no entity ids"));
        }
        for entity_id in entity_ids {
            self.repo
                .check_scope_entry(
                    &pat.user,
                    &pat.id,
                    platform_entity_type,
                    domain_id,
                    operation,
                    entity_id,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryPatsRepository;
    use crate::services::id::UuidProvider;

    #[tokio::test]
    async fn test_minted_bearer_verifies_until_revoked() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        let pat = mint(
            &repo,
            &UuidProvider,
            "u1",
            "ci",
            "",
            Utc::now() + Duration::hours(1),
        )
        .await?;

        let stored = repo.retrieve("u1", &pat.id).await?;
        assert_ne!(stored.secret, pat.secret);

        let verified = verify_bearer(&repo, &pat.secret).await?;
        assert_eq!(verified.id, pat.id);
        assert_eq!(key_for(&verified).kind, KeyKind::Pat);

        repo.revoke("u1", &pat.id).await?;
        let err = verify_bearer(&repo, &pat.secret).await.unwrap_err();
        assert!(err.contains(ErrorKind::Authentication));
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_secret_is_rejected() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        let pat = mint(
            &repo,
            &UuidProvider,
            "u1",
            "ci",
            "",
            Utc::now() + Duration::hours(1),
        )
        .await?;

        let forged = encode_pat_token("u1", &pat.id, "not-the-secret");
        let err = verify_bearer(&repo, &forged).await.unwrap_err();
        assert!(err.contains(ErrorKind::Authentication));
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_pat_is_rejected() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        let pat = mint(
            &repo,
            &UuidProvider,
            "u1",
            "old",
            "",
            Utc::now() - Duration::seconds(1),
        )
        .await?;

        let err = verify_bearer(&repo, &pat.secret).await.unwrap_err();
        assert!(err.contains(ErrorKind::KeyExpired));
        Ok(())
    }
}
