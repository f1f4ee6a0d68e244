use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::db::KeyRepository;
use crate::error::{Error, ErrorKind};
use crate::models::Key;

#[derive(Debug, Default)]
pub struct InMemoryKeyRepository {
    keys: DashMap<(String, String), Key>,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyRepository for InMemoryKeyRepository {
    async fn save(&self, key: &Key) -> Result<String, Error> {
        let mut key = key.clone();
        if key.id.is_empty() {
            key.id = Uuid::new_v4().to_string();
        }

        match self.keys.entry((key.issuer.clone(), key.id.clone())) {
            Entry::Occupied(_) => Err(Error::wrap(
                ErrorKind::CreateEntity,
                Error::new(ErrorKind::Conflict),
            )),
            Entry::Vacant(slot) => {
                let id = key.id.clone();
                slot.insert(key);
                Ok(id)
            }
        }
    }

    async fn retrieve(&self, issuer: &str, id: &str) -> Result<Key, Error> {
        self.keys
            .get(&(issuer.to_string(), id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::wrap(ErrorKind::ViewEntity, Error::new(ErrorKind::NotFound)))
    }

    async fn remove(&self, issuer: &str, id: &str) -> Result<(), Error> {
        self.keys
            .remove(&(issuer.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::wrap(ErrorKind::RemoveEntity, Error::new(ErrorKind::NotFound)))
    }
}
