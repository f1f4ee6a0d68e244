//! Named capability bundles held by domain members.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::domain::Capability;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DomainRole {
    pub id: String,
    #[validate(length(min = 1, max = 254))]
    pub name: String,
    /// Domain the role belongs to.
    pub entity_id: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A role together with what it is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleProvision {
    #[serde(flatten)]
    pub role: DomainRole,
    pub optional_capabilities: Vec<Capability>,
    pub optional_members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolePage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub roles: Vec<DomainRole>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembersPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub members: Vec<String>,
}
