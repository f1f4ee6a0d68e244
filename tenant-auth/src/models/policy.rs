//! Policy requests exchanged with the relation store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

/// Identifier of the platform object every platform-scoped tuple uses.
pub const PLATFORM_OBJECT: &str = "platform";

pub const ADMIN_PERMISSION: &str = "admin";
pub const DELETE_PERMISSION: &str = "delete";
pub const EDIT_PERMISSION: &str = "edit";
pub const VIEW_PERMISSION: &str = "view";
pub const SHARE_PERMISSION: &str = "share";
pub const PUBLISH_PERMISSION: &str = "publish";
pub const SUBSCRIBE_PERMISSION: &str = "subscribe";
pub const MEMBERSHIP_PERMISSION: &str = "membership";

pub const ADMINISTRATOR_RELATION: &str = "administrator";
pub const EDITOR_RELATION: &str = "editor";
pub const CONTRIBUTOR_RELATION: &str = "contributor";
pub const MEMBER_RELATION: &str = "member";
pub const GUEST_RELATION: &str = "guest";
pub const DOMAIN_RELATION: &str = "domain";
pub const PARENT_GROUP_RELATION: &str = "parent_group";
pub const GROUP_RELATION: &str = "group";
pub const PLATFORM_RELATION: &str = "platform";

/// Object and subject namespaces known to the relation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Group,
    Thing,
    Channel,
    Domain,
    Platform,
    Role,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::User,
        EntityType::Group,
        EntityType::Thing,
        EntityType::Channel,
        EntityType::Domain,
        EntityType::Platform,
        EntityType::Role,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Group => "group",
            EntityType::Thing => "thing",
            EntityType::Channel => "channel",
            EntityType::Domain => "domain",
            EntityType::Platform => "platform",
            EntityType::Role => "role",
        }
    }

    /// Object types whose access goes through the domain membership gate.
    pub fn is_domain_scoped(self) -> bool {
        matches!(self, EntityType::Group | EntityType::Thing | EntityType::Domain)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidEntityType).with_context(format!("unknown type {s}"))
            })
    }
}

/// How the subject of a request was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Token,
    Users,
    Group,
    Things,
    Platform,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Token => "token",
            SubjectKind::Users => "users",
            SubjectKind::Group => "group",
            SubjectKind::Things => "things",
            SubjectKind::Platform => "platform",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub subject: String,
    pub subject_type: Option<EntityType>,
    pub subject_kind: Option<SubjectKind>,
    pub subject_relation: String,
    pub object: String,
    pub object_type: Option<EntityType>,
    pub object_kind: String,
    pub relation: String,
    pub permission: String,
    pub domain: String,
}

impl PolicyRequest {
    /// The right being asked about: the permission, or the relation when no
    /// permission is set.
    pub fn action(&self) -> &str {
        if self.permission.is_empty() {
            &self.relation
        } else {
            &self.permission
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPage {
    pub policies: Vec<String>,
    pub next_page_token: String,
}

pub type Permissions = Vec<String>;

/// Map a stored relation onto the permission it confers.
pub fn switch_to_permission(relation: &str) -> &str {
    match relation {
        ADMINISTRATOR_RELATION => ADMIN_PERMISSION,
        EDITOR_RELATION => EDIT_PERMISSION,
        CONTRIBUTOR_RELATION => VIEW_PERMISSION,
        MEMBER_RELATION => MEMBERSHIP_PERMISSION,
        GUEST_RELATION => VIEW_PERMISSION,
        other => other,
    }
}

/// Effective subject of a user acting inside a domain.
pub fn encode_domain_user_id(domain_id: &str, user_id: &str) -> String {
    if domain_id.is_empty() || user_id.is_empty() {
        return String::new();
    }
    format!("{domain_id}_{user_id}")
}

/// Split a domain-user subject. A one-part input lands in the domain slot;
/// anything with more than two parts decodes to empty strings.
pub fn decode_domain_user_id(domain_user_id: &str) -> (String, String) {
    if domain_user_id.is_empty() {
        return (String::new(), String::new());
    }
    let parts: Vec<&str> = domain_user_id.split('_').collect();
    match parts.as_slice() {
        [domain] => ((*domain).to_string(), String::new()),
        [domain, user] => ((*domain).to_string(), (*user).to_string()),
        _ => (String::new(), String::new()),
    }
}
