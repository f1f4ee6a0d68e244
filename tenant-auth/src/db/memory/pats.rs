use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::db::PatsRepository;
use crate::error::{Error, ErrorKind};
use crate::models::domain::DEFAULT_LIMIT;
use crate::models::pat::ANY_IDS;
use crate::models::{
    OperationType, Pat, PatsPage, PatsPageMeta, PlatformEntityType, Scope, ScopesPage,
    SecretStatus,
};

#[derive(Debug, Clone)]
struct PatRecord {
    pat: Pat,
    /// One entry per scope key; entity ids deduplicated.
    scopes: Vec<Scope>,
}

#[derive(Debug, Default)]
pub struct InMemoryPatsRepository {
    pats: DashMap<String, PatRecord>,
}

fn not_found(kind: ErrorKind) -> Error {
    Error::wrap(kind, Error::new(ErrorKind::NotFound))
}

impl InMemoryPatsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_owned<T>(
        &self,
        user_id: &str,
        pat_id: &str,
        kind: ErrorKind,
        f: impl FnOnce(&mut PatRecord) -> T,
    ) -> Result<T, Error> {
        match self.pats.get_mut(pat_id) {
            Some(mut record) if record.pat.user == user_id => Ok(f(record.value_mut())),
            _ => Err(not_found(kind)),
        }
    }
}

fn merge_scope(scopes: &mut Vec<Scope>, incoming: &Scope) {
    match scopes.iter_mut().find(|s| s.same_key(incoming)) {
        Some(existing) if incoming.is_wildcard() => {
            existing.entity_ids = vec![ANY_IDS.to_string()];
        }
        Some(existing) if existing.is_wildcard() => {}
        Some(existing) => {
            for id in &incoming.entity_ids {
                if !existing.entity_ids.contains(id) {
                    existing.entity_ids.push(id.clone());
                }
            }
        }
        None => {
            let mut entry = incoming.clone();
            if entry.id.is_empty() {
                entry.id = Uuid::new_v4().to_string();
            }
            if entry.is_wildcard() {
                entry.entity_ids = vec![ANY_IDS.to_string()];
            } else {
                let mut ids: Vec<String> = Vec::with_capacity(entry.entity_ids.len());
                for id in entry.entity_ids.drain(..) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                entry.entity_ids = ids;
            }
            scopes.push(entry);
        }
    }
}

fn strip_scope(scopes: &mut Vec<Scope>, outgoing: &Scope) {
    if outgoing.is_wildcard() {
        scopes.retain(|s| !s.same_key(outgoing));
        return;
    }
    for existing in scopes.iter_mut().filter(|s| s.same_key(outgoing)) {
        existing
            .entity_ids
            .retain(|id| !outgoing.entity_ids.contains(id));
    }
    scopes.retain(|s| !s.entity_ids.is_empty());
}

#[async_trait]
impl PatsRepository for InMemoryPatsRepository {
    async fn save(&self, pat: &Pat) -> Result<(), Error> {
        let duplicate_name = self
            .pats
            .iter()
            .any(|r| r.pat.user == pat.user && r.pat.name == pat.name);
        if duplicate_name {
            return Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::Conflict),
            ));
        }

        match self.pats.entry(pat.id.clone()) {
            Entry::Occupied(_) => Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::Conflict),
            )),
            Entry::Vacant(slot) => {
                slot.insert(PatRecord {
                    pat: pat.clone(),
                    scopes: Vec::new(),
                });
                Ok(())
            }
        }
    }

    async fn retrieve(&self, user_id: &str, pat_id: &str) -> Result<Pat, Error> {
        self.with_owned(user_id, pat_id, ErrorKind::ViewEntity, |r| r.pat.clone())
    }

    async fn retrieve_all(&self, user_id: &str, meta: &PatsPageMeta) -> Result<PatsPage, Error> {
        let limit = if meta.limit == 0 { DEFAULT_LIMIT } else { meta.limit };
        let now = Utc::now();

        let mut pats: Vec<Pat> = self
            .pats
            .iter()
            .map(|r| r.pat.clone())
            .filter(|p| p.user == user_id)
            .filter(|p| {
                meta.name
                    .as_ref()
                    .map_or(true, |n| p.name.to_lowercase().contains(&n.to_lowercase()))
            })
            .filter(|p| meta.id.as_ref().map_or(true, |id| &p.id == id))
            .filter(|p| meta.status.map_or(true, |s| p.status_at(now) == s))
            .collect();
        pats.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then_with(|| a.id.cmp(&b.id)));

        let total = pats.len() as u64;
        let pats = pats
            .into_iter()
            .skip(meta.offset as usize)
            .take(limit as usize)
            .collect();

        Ok(PatsPage {
            total,
            offset: meta.offset,
            limit,
            pats,
        })
    }

    async fn retrieve_secret_and_revoke_status(
        &self,
        user_id: &str,
        pat_id: &str,
    ) -> Result<SecretStatus, Error> {
        let now = Utc::now();
        self.with_owned(user_id, pat_id, ErrorKind::ViewEntity, |r| SecretStatus {
            hash: r.pat.secret.clone(),
            revoked: r.pat.revoked,
            expired: r.pat.expires_at <= now,
        })
    }

    async fn update_name(&self, user_id: &str, pat_id: &str, name: &str) -> Result<Pat, Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            r.pat.name = name.to_string();
            r.pat.updated_at = Some(Utc::now());
            r.pat.clone()
        })
    }

    async fn update_description(
        &self,
        user_id: &str,
        pat_id: &str,
        description: &str,
    ) -> Result<Pat, Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            r.pat.description = description.to_string();
            r.pat.updated_at = Some(Utc::now());
            r.pat.clone()
        })
    }

    async fn update_token_hash(
        &self,
        user_id: &str,
        pat_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Pat, Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            r.pat.secret = token_hash.to_string();
            r.pat.expires_at = expires_at;
            r.pat.updated_at = Some(Utc::now());
            r.pat.clone()
        })
    }

    async fn update_last_used(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            r.pat.last_used_at = Some(Utc::now());
        })
    }

    async fn revoke(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            let now = Utc::now();
            r.pat.revoked = true;
            r.pat.revoked_at = Some(now);
            r.pat.updated_at = Some(now);
        })
    }

    async fn reactivate(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        self.with_owned(user_id, pat_id, ErrorKind::UpdateEntity, |r| {
            r.pat.revoked = false;
            r.pat.revoked_at = None;
            r.pat.updated_at = Some(Utc::now());
        })
    }

    async fn remove(&self, user_id: &str, pat_id: &str) -> Result<(), Error> {
        self.pats
            .remove_if(pat_id, |_, r| r.pat.user == user_id)
            .map(|_| ())
            .ok_or_else(|| not_found(ErrorKind::RemoveEntity))
    }

    async fn remove_all_pat(&self, user_id: &str) -> Result<(), Error> {
        self.pats.retain(|_, r| r.pat.user != user_id);
        Ok(())
    }

    async fn add_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error> {
        for scope in scopes {
            self.with_owned(user_id, &scope.pat_id, ErrorKind::CreateEntity, |_| ())?;
        }
        for scope in scopes {
            self.with_owned(user_id, &scope.pat_id, ErrorKind::CreateEntity, |r| {
                merge_scope(&mut r.scopes, scope)
            })?;
        }
        Ok(())
    }

    async fn remove_scope_entry(&self, user_id: &str, scopes: &[Scope]) -> Result<(), Error> {
        for scope in scopes {
            self.with_owned(user_id, &scope.pat_id, ErrorKind::RemoveEntity, |_| ())?;
        }
        for scope in scopes {
            self.with_owned(user_id, &scope.pat_id, ErrorKind::RemoveEntity, |r| {
                strip_scope(&mut r.scopes, scope)
            })?;
        }
        Ok(())
    }

    async fn remove_all_scope_entry(&self, pat_id: &str) -> Result<(), Error> {
        if let Some(mut record) = self.pats.get_mut(pat_id) {
            record.scopes.clear();
        }
        Ok(())
    }

    async fn check_scope_entry(
        &self,
        user_id: &str,
        pat_id: &str,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_id: &str,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let allowed = self
            .pats
            .get(pat_id)
            .filter(|r| r.pat.user == user_id && !r.pat.revoked && r.pat.expires_at > now)
            .is_some_and(|r| {
                r.scopes
                    .iter()
                    .any(|s| s.authorizes(platform_entity_type, domain_id, operation, entity_id))
            });

        if !allowed {
            return Err(Error::new(ErrorKind::Authorization).with_context(format!(
                "no scope grants {} on {} {entity_id}",
                operation.as_str(),
                platform_entity_type.as_str()
            )));
        }
        Ok(())
    }

    async fn retrieve_scope(
        &self,
        pat_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<ScopesPage, Error> {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        let mut scopes = self
            .pats
            .get(pat_id)
            .map(|r| r.scopes.clone())
            .unwrap_or_default();
        scopes.sort_by(|a, b| {
            (
                a.platform_entity_type,
                &a.domain_id,
                a.domain_entity_type,
                a.operation,
            )
                .cmp(&(
                    b.platform_entity_type,
                    &b.domain_id,
                    b.domain_entity_type,
                    b.operation,
                ))
        });

        let total = scopes.len() as u64;
        let scopes = scopes
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();

        Ok(ScopesPage {
            total,
            offset,
            limit,
            scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pat::hash_secret;
    use crate::models::{DomainEntityType, PatStatus};
    use chrono::Duration;

    fn pat(id: &str, user: &str, name: &str) -> Pat {
        let now = Utc::now();
        Pat {
            id: id.to_string(),
            user: user.to_string(),
            name: name.to_string(),
            description: String::new(),
            secret: hash_secret("secret"),
            issued_at: now,
            expires_at: now + Duration::days(1),
            updated_at: None,
            last_used_at: None,
            revoked: false,
            revoked_at: None,
        }
    }

    fn scope(pat_id: &str, ids: &[&str]) -> Scope {
        let mut scope = Scope::new(
            PlatformEntityType::Things,
            OperationType::Read,
            ids.iter().map(|s| s.to_string()).collect(),
        );
        scope.pat_id = pat_id.to_string();
        scope
    }

    async fn check(repo: &InMemoryPatsRepository, domain: Option<&str>) -> Result<(), Error> {
        repo.check_scope_entry(
            "u1",
            "p1",
            PlatformEntityType::Things,
            domain,
            OperationType::Read,
            "t1",
        )
        .await
    }

    #[tokio::test]
    async fn test_wildcard_collapses_same_key_entries() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        repo.save(&pat("p1", "u1", "ci")).await?;

        repo.add_scope_entry("u1", &[scope("p1", &["t1", "t2"])]).await?;
        repo.add_scope_entry("u1", &[scope("p1", &["t2", "t3"])]).await?;
        let page = repo.retrieve_scope("p1", 0, 0).await?;
        assert_eq!(page.total, 1);
        assert_eq!(page.scopes[0].entity_ids, vec!["t1", "t2", "t3"]);

        repo.add_scope_entry("u1", &[scope("p1", &[ANY_IDS])]).await?;
        repo.add_scope_entry("u1", &[scope("p1", &["t9"])]).await?;
        let page = repo.retrieve_scope("p1", 0, 0).await?;
        assert_eq!(page.scopes[0].entity_ids, vec![ANY_IDS]);

        repo.check_scope_entry("u1", "p1", PlatformEntityType::Things, None, OperationType::Read, "zz")
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_check_respects_domain_and_revocation() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        repo.save(&pat("p1", "u1", "ci")).await?;
        let bound = scope("p1", &["t1"]).in_domain("d1", DomainEntityType::Things);
        repo.add_scope_entry("u1", &[bound]).await?;

        assert!(check(&repo, Some("d1")).await.is_ok());
        assert!(check(&repo, Some("d2")).await.is_err());
        assert!(check(&repo, None).await.is_err());

        repo.revoke("u1", "p1").await?;
        let err = check(&repo, Some("d1")).await.unwrap_err();
        assert!(err.contains(ErrorKind::Authorization));
        assert_eq!(repo.retrieve("u1", "p1").await?.status(), PatStatus::Revoked);

        repo.reactivate("u1", "p1").await?;
        assert!(check(&repo, Some("d1")).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_scope_entry_drops_ids() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        repo.save(&pat("p1", "u1", "ci")).await?;
        repo.add_scope_entry("u1", &[scope("p1", &["t1", "t2"])]).await?;

        repo.remove_scope_entry("u1", &[scope("p1", &["t1"])]).await?;
        assert_eq!(repo.retrieve_scope("p1", 0, 0).await?.scopes[0].entity_ids, vec!["t2"]);

        repo.remove_scope_entry("u1", &[scope("p1", &["t2"])]).await?;
        assert_eq!(repo.retrieve_scope("p1", 0, 0).await?.total, 0);

        let err = repo
            .add_scope_entry("u2", &[scope("p1", &["t1"])])
            .await
            .unwrap_err();
        assert!(err.contains(ErrorKind::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_names_unique_per_user() -> Result<(), anyhow::Error> {
        let repo = InMemoryPatsRepository::new();
        repo.save(&pat("p1", "u1", "ci")).await?;
        assert!(repo.save(&pat("p2", "u1", "ci")).await.unwrap_err().contains(ErrorKind::Conflict));
        repo.save(&pat("p3", "u2", "ci")).await?;

        let page = repo.retrieve_all("u1", &PatsPageMeta::default()).await?;
        assert_eq!(page.total, 1);

        repo.remove_all_pat("u1").await?;
        assert!(repo.retrieve("u1", "p1").await.is_err());
        assert!(repo.retrieve("u2", "p3").await.is_ok());
        Ok(())
    }
}
