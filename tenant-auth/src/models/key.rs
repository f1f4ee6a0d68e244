//! Credential keys and the token envelope handed back to callers.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Purpose of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Access,
    Refresh,
    Recovery,
    Api,
    Pat,
    Invitation,
}

impl KeyKind {
    pub fn as_u32(self) -> u32 {
        match self {
            KeyKind::Access => 0,
            KeyKind::Refresh => 1,
            KeyKind::Recovery => 2,
            KeyKind::Api => 3,
            KeyKind::Pat => 4,
            KeyKind::Invitation => 5,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(KeyKind::Access),
            1 => Some(KeyKind::Refresh),
            2 => Some(KeyKind::Recovery),
            3 => Some(KeyKind::Api),
            4 => Some(KeyKind::Pat),
            5 => Some(KeyKind::Invitation),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Access => "access",
            KeyKind::Refresh => "refresh",
            KeyKind::Recovery => "recovery",
            KeyKind::Api => "api",
            KeyKind::Pat => "pat",
            KeyKind::Invitation => "invitation",
        }
    }

    /// Only API keys and PATs are persisted and revocable.
    pub fn is_stored(self) -> bool {
        matches!(self, KeyKind::Api | KeyKind::Pat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_u32(self) -> u32 {
        match self {
            Role::User => 1,
            Role::Admin => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Role::User),
            2 => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Claims carried by every credential.
///
/// `expires_at = None` is the zero expiry: only API keys treat it as "never".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub kind: KeyKind,
    pub issuer: String,
    pub subject: String,
    pub user: String,
    pub domain: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Key {
    pub fn new(kind: KeyKind) -> Self {
        Self {
            id: String::new(),
            kind,
            issuer: String::new(),
            subject: String::new(),
            user: String::new(),
            domain: String::new(),
            role: Role::User,
            issued_at: now_utc(),
            expires_at: None,
        }
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => self.kind != KeyKind::Api,
            Some(expires_at) => expires_at <= now,
        }
    }
}

/// Current UTC time at token resolution (whole seconds).
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Bearer,
    Client,
    Basic,
}

impl AccessType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::Bearer => "Bearer",
            AccessType::Client => "Client",
            AccessType::Basic => "Basic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub access_type: AccessType,
}

impl Token {
    pub fn bearer(access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
            access_type: AccessType::Bearer,
        }
    }
}

/// JWKS entry for an asymmetric signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub kid: String,
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub crv: String,
    pub x: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeySet {
    pub keys: Vec<PublicKeyInfo>,
}
