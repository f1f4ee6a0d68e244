//! Tenants ("domains"), their status and the built-in role table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::error::{Error, ErrorKind};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_LIMIT: u64 = 100;

pub const UPDATE_PERMISSION: &str = "update_permission";
pub const READ_PERMISSION: &str = "read_permission";
pub const DELETE_PERMISSION: &str = "delete_permission";

pub const BUILTIN_ROLE_ADMIN: &str = "admin";
pub const BUILTIN_ROLE_MEMBERSHIP: &str = "membership";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DomainStatus {
    #[default]
    Enabled,
    Disabled,
    Freeze,
    /// Query-only; never stored.
    All,
}

impl DomainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainStatus::Enabled => "enabled",
            DomainStatus::Disabled => "disabled",
            DomainStatus::Freeze => "freezed",
            DomainStatus::All => "all",
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            DomainStatus::Enabled => 0,
            DomainStatus::Disabled => 1,
            DomainStatus::Freeze => 2,
            DomainStatus::All => 3,
        }
    }

    /// Decode a stored status. `All` is never stored, so its code is rejected.
    pub fn from_i16(value: i16) -> Result<Self, Error> {
        match value {
            0 => Ok(DomainStatus::Enabled),
            1 => Ok(DomainStatus::Disabled),
            2 => Ok(DomainStatus::Freeze),
            other => Err(Error::new(ErrorKind::InvalidStatus)
                .with_context(format!("stored status {other}"))),
        }
    }

    /// Name used in external representations; out-of-range values render as `unknown`.
    pub fn label(value: i16) -> &'static str {
        DomainStatus::from_i16(value).map_or("unknown", DomainStatus::as_str)
    }

    /// Whether the status may be written to the store.
    pub fn is_storable(self) -> bool {
        self != DomainStatus::All
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "enabled" => Ok(DomainStatus::Enabled),
            "disabled" => Ok(DomainStatus::Disabled),
            "freezed" => Ok(DomainStatus::Freeze),
            "all" => Ok(DomainStatus::All),
            other => {
                Err(Error::new(ErrorKind::InvalidStatus).with_context(format!("status {other}")))
            }
        }
    }
}

impl Serialize for DomainStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DomainStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Domain {
    pub id: String,
    #[validate(length(min = 1, max = 1024))]
    pub name: String,
    #[validate(length(max = 254))]
    pub alias: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub status: DomainStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            alias: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
            status: DomainStatus::Enabled,
            created_by: String::new(),
            created_at: Utc::now(),
            updated_by: None,
            updated_at: None,
        }
    }
}

/// Partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct DomainReq {
    #[validate(length(min = 1, max = 1024))]
    pub name: Option<String>,
    pub metadata: Option<Metadata>,
    pub tags: Option<Vec<String>>,
    #[validate(length(max = 254))]
    pub alias: Option<String>,
    pub status: Option<DomainStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainOrder {
    Name,
    #[default]
    CreatedAt,
    UpdatedAt,
}

impl DomainOrder {
    pub fn column(self) -> &'static str {
        match self {
            DomainOrder::Name => "name",
            DomainOrder::CreatedAt => "created_at",
            DomainOrder::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Listing filters for domains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
    pub name: Option<String>,
    pub tag: Option<String>,
    pub metadata: Option<Metadata>,
    pub permission: Option<String>,
    pub status: DomainStatus,
    pub order: DomainOrder,
    pub dir: SortDir,
    /// Explicit id set the listing is restricted to.
    pub ids: Vec<String>,
    /// When set, only domains visible to this user are listed.
    pub subject_id: Option<String>,
}

impl Page {
    pub fn effective_limit(&self) -> u64 {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainsPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub domains: Vec<Domain>,
}

/// Capabilities a domain role may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Update,
    Read,
    Delete,
    Membership,
    ManageRole,
    AddRoleUsers,
    RemoveRoleUsers,
    ViewRoleUsers,
    ThingCreate,
    ThingUpdate,
    ThingRead,
    ThingDelete,
    ThingSetParentGroup,
    ThingConnectToChannel,
    ChannelCreate,
    ChannelUpdate,
    ChannelRead,
    ChannelDelete,
    ChannelSetParentGroup,
    ChannelConnectToThing,
    ChannelPublish,
    ChannelSubscribe,
    GroupCreate,
    GroupUpdate,
    GroupRead,
    GroupDelete,
    GroupSetChild,
    GroupSetParent,
}

impl Capability {
    pub const ALL: [Capability; 28] = [
        Capability::Update,
        Capability::Read,
        Capability::Delete,
        Capability::Membership,
        Capability::ManageRole,
        Capability::AddRoleUsers,
        Capability::RemoveRoleUsers,
        Capability::ViewRoleUsers,
        Capability::ThingCreate,
        Capability::ThingUpdate,
        Capability::ThingRead,
        Capability::ThingDelete,
        Capability::ThingSetParentGroup,
        Capability::ThingConnectToChannel,
        Capability::ChannelCreate,
        Capability::ChannelUpdate,
        Capability::ChannelRead,
        Capability::ChannelDelete,
        Capability::ChannelSetParentGroup,
        Capability::ChannelConnectToThing,
        Capability::ChannelPublish,
        Capability::ChannelSubscribe,
        Capability::GroupCreate,
        Capability::GroupUpdate,
        Capability::GroupRead,
        Capability::GroupDelete,
        Capability::GroupSetChild,
        Capability::GroupSetParent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Update => "update",
            Capability::Read => "read",
            Capability::Delete => "delete",
            Capability::Membership => "membership",
            Capability::ManageRole => "manage_role",
            Capability::AddRoleUsers => "add_role_users",
            Capability::RemoveRoleUsers => "remove_role_users",
            Capability::ViewRoleUsers => "view_role_users",
            Capability::ThingCreate => "thing_create",
            Capability::ThingUpdate => "thing_update",
            Capability::ThingRead => "thing_read",
            Capability::ThingDelete => "thing_delete",
            Capability::ThingSetParentGroup => "thing_set_parent_group",
            Capability::ThingConnectToChannel => "thing_connect_to_channel",
            Capability::ChannelCreate => "channel_create",
            Capability::ChannelUpdate => "channel_update",
            Capability::ChannelRead => "channel_read",
            Capability::ChannelDelete => "channel_delete",
            Capability::ChannelSetParentGroup => "channel_set_parent_group",
            Capability::ChannelConnectToThing => "channel_connect_to_thing",
            Capability::ChannelPublish => "channel_publish",
            Capability::ChannelSubscribe => "channel_subscribe",
            Capability::GroupCreate => "group_create",
            Capability::GroupUpdate => "group_update",
            Capability::GroupRead => "group_read",
            Capability::GroupDelete => "group_delete",
            Capability::GroupSetChild => "group_set_child",
            Capability::GroupSetParent => "group_set_parent",
        }
    }

    /// Permission name the relation store computes for this capability.
    pub fn permission(self) -> String {
        format!("{}_permission", self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                Error::new(ErrorKind::MalformedEntity)
                    .with_context(format!("unknown capability {s}"))
            })
    }
}

pub fn available_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

/// Roles present on every domain.
pub fn built_in_roles() -> BTreeMap<&'static str, Vec<Capability>> {
    BTreeMap::from([
        (BUILTIN_ROLE_ADMIN, available_capabilities()),
        (BUILTIN_ROLE_MEMBERSHIP, vec![Capability::Membership]),
    ])
}
