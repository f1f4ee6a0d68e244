//! Personal access tokens and their scope entries.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use subtle::ConstantTimeEq;

use crate::error::{Error, ErrorKind};

/// Entity-id marker granting every entity of the scope's type.
pub const ANY_IDS: &str = "*";

/// Leading segment of every PAT bearer.
pub const PAT_PREFIX: &str = "pat";

const SECRET_BYTES: usize = 32;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(Error::new(ErrorKind::MalformedEntity)
                        .with_context(format!("invalid {} {other}", stringify!($name)))),
                }
            }
        }
    };
}

string_enum!(PlatformEntityType {
    Users => "users",
    Dashboard => "dashboard",
    Messages => "messages",
    Domains => "domains",
    Groups => "groups",
    Channels => "channels",
    Things => "things",
});

string_enum!(DomainEntityType {
    Management => "management",
    Groups => "groups",
    Channels => "channels",
    Things => "things",
});

string_enum!(OperationType {
    Create => "create",
    Read => "read",
    List => "list",
    Update => "update",
    Delete => "delete",
    Share => "share",
    Unshare => "unshare",
    Publish => "publish",
    Subscribe => "subscribe",
});

/// A grant of `operation` on `entity_ids` of one entity type, optionally
/// narrowed to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub pat_id: String,
    pub platform_entity_type: PlatformEntityType,
    pub domain_id: Option<String>,
    pub domain_entity_type: Option<DomainEntityType>,
    pub operation: OperationType,
    pub entity_ids: Vec<String>,
}

impl Scope {
    pub fn new(
        platform_entity_type: PlatformEntityType,
        operation: OperationType,
        entity_ids: Vec<String>,
    ) -> Self {
        Self {
            id: String::new(),
            pat_id: String::new(),
            platform_entity_type,
            domain_id: None,
            domain_entity_type: None,
            operation,
            entity_ids,
        }
    }

    pub fn in_domain(mut self, domain_id: impl Into<String>, entity_type: DomainEntityType) -> Self {
        self.domain_id = Some(domain_id.into());
        self.domain_entity_type = Some(entity_type);
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.entity_ids.iter().any(|id| id == ANY_IDS)
    }

    /// Entries sharing a key collapse into one wildcard.
    pub fn same_key(&self, other: &Scope) -> bool {
        self.pat_id == other.pat_id
            && self.platform_entity_type == other.platform_entity_type
            && self.domain_id == other.domain_id
            && self.domain_entity_type == other.domain_entity_type
            && self.operation == other.operation
    }

    /// Entry-level match rule for a scope check.
    pub fn authorizes(
        &self,
        platform_entity_type: PlatformEntityType,
        domain_id: Option<&str>,
        operation: OperationType,
        entity_id: &str,
    ) -> bool {
        if self.platform_entity_type != platform_entity_type || self.operation != operation {
            return false;
        }
        if let Some(scoped) = &self.domain_id {
            if domain_id != Some(scoped.as_str()) {
                return false;
            }
        }
        self.entity_ids
            .iter()
            .any(|id| id == ANY_IDS || id == entity_id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.entity_ids.is_empty() || self.entity_ids.iter().any(|id| id.is_empty()) {
            return Err(Error::new(ErrorKind::MalformedEntity).with_context("empty entity id"));
        }
        if self.domain_entity_type.is_some() && self.domain_id.is_none() {
            return Err(Error::new(ErrorKind::MalformedEntity)
                .with_context("domain entity type without domain"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopesPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pat {
    pub id: String,
    pub user: String,
    pub name: String,
    pub description: String,
    /// Hash at rest; the plaintext bearer only on create and reset.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub secret: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Pat {
    pub fn status(&self) -> PatStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> PatStatus {
        if self.revoked {
            PatStatus::Revoked
        } else if self.expires_at <= now {
            PatStatus::Expired
        } else {
            PatStatus::Active
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatsPageMeta {
    pub offset: u64,
    pub limit: u64,
    pub name: Option<String>,
    pub id: Option<String>,
    pub status: Option<PatStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatsPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub pats: Vec<Pat>,
}

/// Stored secret state read on the PAT authentication path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStatus {
    pub hash: String,
    pub revoked: bool,
    pub expired: bool,
}

/// The caller context a PAT is presented under and the use it is put to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatAuthzRequest {
    pub user_id: String,
    pub pat_id: String,
    pub platform_entity_type: PlatformEntityType,
    pub domain_id: Option<String>,
    pub operation: OperationType,
    pub entity_ids: Vec<String>,
}

/// Components embedded in a PAT bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatToken {
    pub user_id: String,
    pub pat_id: String,
    pub secret: String,
}

pub fn is_pat_token(token: &str) -> bool {
    token
        .split_once('.')
        .is_some_and(|(prefix, _)| prefix == PAT_PREFIX)
}

/// `pat.<b64(user:pat)>.<b64(secret)>`
pub fn encode_pat_token(user_id: &str, pat_id: &str, secret: &str) -> String {
    format!(
        "{PAT_PREFIX}.{}.{}",
        URL_SAFE_NO_PAD.encode(format!("{user_id}:{pat_id}")),
        URL_SAFE_NO_PAD.encode(secret)
    )
}

pub fn parse_pat_token(token: &str) -> Result<PatToken, Error> {
    let malformed = || Error::new(ErrorKind::Authentication).with_context("malformed PAT");

    let mut parts = token.split('.');
    let (Some(PAT_PREFIX), Some(ids), Some(secret), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    let ids = URL_SAFE_NO_PAD
        .decode(ids)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(malformed)?;
    let (user_id, pat_id) = ids.split_once(':').ok_or_else(malformed)?;
    let secret = URL_SAFE_NO_PAD
        .decode(secret)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(malformed)?;

    if user_id.is_empty() || pat_id.is_empty() || secret.is_empty() {
        return Err(malformed());
    }

    Ok(PatToken {
        user_id: user_id.to_string(),
        pat_id: pat_id.to_string(),
        secret,
    })
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Constant-time comparison of a presented secret with its stored hash.
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    let computed = hash_secret(secret);
    computed.as_bytes().ct_eq(hash.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard_scope() -> Scope {
        Scope::new(
            PlatformEntityType::Things,
            OperationType::Create,
            vec![ANY_IDS.to_string()],
        )
    }

    #[test]
    fn test_wildcard_matches_any_entity() {
        let scope = wildcard_scope();
        assert!(scope.authorizes(PlatformEntityType::Things, None, OperationType::Create, "t1"));
        assert!(scope.authorizes(
            PlatformEntityType::Things,
            Some("d1"),
            OperationType::Create,
            "t2"
        ));
        assert!(!scope.authorizes(PlatformEntityType::Things, None, OperationType::Delete, "t1"));
        assert!(!scope.authorizes(PlatformEntityType::Groups, None, OperationType::Create, "t1"));
    }

    #[test]
    fn test_domain_bound_entry_requires_same_domain() {
        let scope = Scope::new(
            PlatformEntityType::Domains,
            OperationType::Read,
            vec!["g1".to_string()],
        )
        .in_domain("d1", DomainEntityType::Groups);

        assert!(scope.authorizes(PlatformEntityType::Domains, Some("d1"), OperationType::Read, "g1"));
        assert!(!scope.authorizes(PlatformEntityType::Domains, Some("d2"), OperationType::Read, "g1"));
        assert!(!scope.authorizes(PlatformEntityType::Domains, None, OperationType::Read, "g1"));
        assert!(!scope.authorizes(PlatformEntityType::Domains, Some("d1"), OperationType::Read, "g2"));
    }

    #[test]
    fn test_token_encoding() {
        let token = encode_pat_token("user-1", "pat-1", "s3cr3t");
        assert!(is_pat_token(&token));
        assert!(!is_pat_token("eyJhbGciOiJIUzI1NiJ9.e30.sig"));

        let parsed = parse_pat_token(&token).unwrap();
        assert_eq!(parsed.user_id, "user-1");
        assert_eq!(parsed.pat_id, "pat-1");
        assert_eq!(parsed.secret, "s3cr3t");

        let err = parse_pat_token("pat.bm90LWEtcGFpcg.c2VjcmV0").unwrap_err();
        assert!(err.contains(ErrorKind::Authentication));
        assert!(parse_pat_token("pat.only-two").is_err());
    }

    #[test]
    fn test_secret_hashing() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        let hash = hash_secret(&secret);
        assert_ne!(hash, secret);
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret("other", &hash));
    }

    #[test]
    fn test_scope_validation() {
        let mut scope = wildcard_scope();
        assert!(scope.validate().is_ok());
        scope.entity_ids.clear();
        assert!(scope.validate().unwrap_err().contains(ErrorKind::MalformedEntity));
    }

    #[test]
    fn test_enum_labels_parse() {
        assert_eq!(
            "things".parse::<PlatformEntityType>().unwrap(),
            PlatformEntityType::Things
        );
        assert_eq!(
            "management".parse::<DomainEntityType>().unwrap(),
            DomainEntityType::Management
        );
        assert!("fly".parse::<OperationType>().is_err());
    }
}
