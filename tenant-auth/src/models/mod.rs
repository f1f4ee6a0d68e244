pub mod domain;
pub mod key;
pub mod pat;
pub mod policy;
pub mod role;

pub use domain::{Domain, DomainReq, DomainStatus, DomainsPage, Metadata, Page};
pub use key::{AccessType, Key, KeyKind, PublicKeyInfo, PublicKeySet, Role, Token};
pub use pat::{
    DomainEntityType, OperationType, Pat, PatAuthzRequest, PatStatus, PatsPage, PatsPageMeta,
    PlatformEntityType, Scope, ScopesPage, SecretStatus,
};
pub use policy::{EntityType, Permissions, PolicyPage, PolicyRequest, SubjectKind};
pub use role::{DomainRole, MembersPage, RolePage, RoleProvision};
