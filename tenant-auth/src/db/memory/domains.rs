use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;

use crate::db::DomainsRepository;
use crate::error::{Error, ErrorKind};
use crate::models::domain::{DomainOrder, SortDir};
use crate::models::{Domain, DomainReq, DomainStatus, DomainsPage, Page};

#[derive(Debug, Default)]
pub struct InMemoryDomainsRepository {
    domains: DashMap<String, Domain>,
    /// Lowercased alias to owning domain id.
    aliases: DashMap<String, String>,
}

impl InMemoryDomainsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim_alias(&self, alias: &str, id: &str, kind: ErrorKind) -> Result<(), Error> {
        match self.aliases.entry(alias.to_string()) {
            Entry::Occupied(owner) if owner.get() != id => {
                Err(Error::wrap(kind, Error::new(ErrorKind::Conflict)))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(id.to_string());
                Ok(())
            }
        }
    }

    fn page(&self, page: &Page, by_ids: bool) -> DomainsPage {
        let limit = page.effective_limit();

        let mut matched: Vec<Domain> = self
            .domains
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|domain| matches(domain, page, by_ids))
            .collect();

        matched.sort_by(|a, b| {
            let ord = compare(a, b, page.order);
            match page.dir {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as u64;
        let domains = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(limit as usize)
            .collect();

        DomainsPage {
            total,
            offset: page.offset,
            limit,
            domains,
        }
    }
}

fn matches(domain: &Domain, page: &Page, by_ids: bool) -> bool {
    if by_ids && !page.ids.contains(&domain.id) {
        return false;
    }
    if !by_ids {
        if let Some(subject) = &page.subject_id {
            if &domain.created_by != subject && !page.ids.contains(&domain.id) {
                return false;
            }
        }
    }
    if let Some(name) = &page.name {
        if !domain.name.to_lowercase().contains(&name.to_lowercase()) {
            return false;
        }
    }
    if let Some(tag) = &page.tag {
        if !domain.tags.contains(tag) {
            return false;
        }
    }
    if let Some(metadata) = &page.metadata {
        if metadata
            .iter()
            .any(|(k, v)| domain.metadata.get(k) != Some(v))
        {
            return false;
        }
    }
    page.status == DomainStatus::All || page.status == domain.status
}

fn compare(a: &Domain, b: &Domain, order: DomainOrder) -> Ordering {
    let primary = match order {
        DomainOrder::Name => a.name.cmp(&b.name),
        DomainOrder::CreatedAt => a.created_at.cmp(&b.created_at),
        DomainOrder::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl DomainsRepository for InMemoryDomainsRepository {
    async fn save(&self, domain: &Domain) -> Result<Domain, Error> {
        if !domain.status.is_storable() {
            return Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::InvalidStatus),
            ));
        }
        if self.domains.contains_key(&domain.id) {
            return Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::Conflict),
            ));
        }

        let mut stored = domain.clone();
        stored.alias = domain.alias.as_ref().map(|a| a.to_lowercase());
        if let Some(alias) = &stored.alias {
            self.claim_alias(alias, &stored.id, ErrorKind::CreateEntity)?;
        }

        self.domains.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn retrieve_by_id(&self, id: &str) -> Result<Domain, Error> {
        self.domains
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::wrap(ErrorKind::ViewEntity, Error::new(ErrorKind::NotFound)))
    }

    async fn retrieve_all_by_ids(&self, page: &Page) -> Result<DomainsPage, Error> {
        Ok(self.page(page, true))
    }

    async fn update(&self, id: &str, user_id: &str, req: &DomainReq) -> Result<Domain, Error> {
        if req.status == Some(DomainStatus::All) {
            return Err(Error::wrap(
                ErrorKind::UpdateEntity,
                Error::new(ErrorKind::InvalidStatus),
            ));
        }

        let new_alias = req.alias.as_ref().map(|a| a.to_lowercase());
        if let Some(alias) = &new_alias {
            if !self.domains.contains_key(id) {
                return Err(Error::wrap(
                    ErrorKind::UpdateEntity,
                    Error::new(ErrorKind::NotFound),
                ));
            }
            self.claim_alias(alias, id, ErrorKind::UpdateEntity)?;
        }

        let mut entry = self.domains.get_mut(id).ok_or_else(|| {
            Error::wrap(ErrorKind::UpdateEntity, Error::new(ErrorKind::NotFound))
        })?;
        let domain = entry.value_mut();

        if let Some(name) = &req.name {
            domain.name = name.clone();
        }
        if let Some(alias) = new_alias {
            if let Some(old) = domain.alias.replace(alias.clone()) {
                if old != alias {
                    self.aliases.remove(&old);
                }
            }
        }
        if let Some(tags) = &req.tags {
            domain.tags = tags.clone();
        }
        if let Some(metadata) = &req.metadata {
            domain.metadata = metadata.clone();
        }
        if let Some(status) = req.status {
            domain.status = status;
        }
        domain.updated_by = Some(user_id.to_string());
        domain.updated_at = Some(Utc::now());

        Ok(domain.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let (_, domain) = self.domains.remove(id).ok_or_else(|| {
            Error::wrap(ErrorKind::RemoveEntity, Error::new(ErrorKind::NotFound))
        })?;
        if let Some(alias) = domain.alias {
            self.aliases.remove(&alias);
        }
        Ok(())
    }

    async fn list_domains(&self, page: &Page) -> Result<DomainsPage, Error> {
        Ok(self.page(page, false))
    }
}
