//! PostgreSQL-backed stores (sqlx).

mod domains;
mod keys;
mod pats;
mod roles;

pub use domains::PgDomainsRepository;
pub use keys::PgKeyRepository;
pub use pats::PgPatsRepository;
pub use roles::PgRolesRepository;
