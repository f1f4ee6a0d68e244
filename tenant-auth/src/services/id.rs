use uuid::Uuid;

use crate::error::Error;

/// Source of entity identifiers.
pub trait IdProvider: Send + Sync {
    fn id(&self) -> Result<String, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn id(&self) -> Result<String, Error> {
        Ok(Uuid::new_v4().to_string())
    }
}
