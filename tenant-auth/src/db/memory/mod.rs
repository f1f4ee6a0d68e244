//! In-process stores backed by concurrent maps.

mod domains;
mod keys;
mod pats;
mod roles;

pub use domains::InMemoryDomainsRepository;
pub use keys::InMemoryKeyRepository;
pub use pats::InMemoryPatsRepository;
pub use roles::InMemoryRolesRepository;
