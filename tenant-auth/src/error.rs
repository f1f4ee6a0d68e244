//! Crate-wide error type.
//!
//! Errors are wrapped, never replaced: every layer adds its own [`ErrorKind`]
//! on top of the cause it received, and [`Error::contains`] walks the whole
//! chain so callers can test for any kind along the way.

use service_core::error::AppError;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("failed to perform authentication over the entity")]
    Authentication,
    #[error("the key is expired")]
    KeyExpired,
    #[error("failed to perform authorization over the entity")]
    Authorization,
    #[error("failed to perform authorization over the domain")]
    DomainAuthorization,
    #[error("invalid policy")]
    InvalidPolicy,
    #[error("malformed entity specification")]
    MalformedEntity,
    #[error("invalid status")]
    InvalidStatus,
    #[error("failed to create entity in the db")]
    CreateEntity,
    #[error("update entity failed")]
    UpdateEntity,
    #[error("view entity failed")]
    ViewEntity,
    #[error("failed to remove entity")]
    RemoveEntity,
    #[error("entity not found")]
    NotFound,
    #[error("entity already exists")]
    Conflict,
    #[error("invalid entity type")]
    InvalidEntityType,
    #[error("failed to validate access key token")]
    Identify,
    #[error("failed to issue new login key")]
    IssueUser,
    #[error("failed to issue new temporary key")]
    IssueTmp,
    #[error("failed to remove key")]
    Revoke,
    #[error("failed to retrieve key data")]
    Retrieve,
    #[error("invalid platform id")]
    Platform,
    #[error("failed to create domain policy")]
    CreateDomainPolicy,
    #[error("failed to rollback policy")]
    RollbackPolicy,
    #[error("failed to add policies")]
    AddPolicies,
    #[error("failed to remove policies")]
    RemovePolicies,
    #[error("token is expired")]
    ExpiredToken,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("malformed token")]
    MalformedToken,
    #[error("unsupported token signing algorithm")]
    UnsupportedAlgorithm,
    #[error("unsupported key algorithm")]
    UnsupportedKeyAlgorithm,
    #[error("public keys are not supported in symmetric mode")]
    PublicKeysNotSupported,
    #[error("invalid symmetric key")]
    InvalidSymmetricKey,
    #[error("failed to communicate with the policy engine")]
    PolicyEngine,
    #[error("callout request failed")]
    Callout,
    #[error("operation canceled")]
    Canceled,
    #[error("database operation failed")]
    Database,
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// Stable external code for the kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::KeyExpired => "key_expired",
            ErrorKind::Authorization => "authorization",
            ErrorKind::DomainAuthorization => "domain_authorization",
            ErrorKind::InvalidPolicy => "invalid_policy",
            ErrorKind::MalformedEntity => "malformed_entity",
            ErrorKind::InvalidStatus => "invalid_status",
            ErrorKind::CreateEntity => "create_entity",
            ErrorKind::UpdateEntity => "update_entity",
            ErrorKind::ViewEntity => "view_entity",
            ErrorKind::RemoveEntity => "remove_entity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidEntityType => "invalid_entity_type",
            ErrorKind::Identify => "identify",
            ErrorKind::IssueUser => "issue_user",
            ErrorKind::IssueTmp => "issue_tmp",
            ErrorKind::Revoke => "revoke",
            ErrorKind::Retrieve => "retrieve",
            ErrorKind::Platform => "platform",
            ErrorKind::CreateDomainPolicy => "create_domain_policy",
            ErrorKind::RollbackPolicy => "rollback_policy",
            ErrorKind::AddPolicies => "add_policies",
            ErrorKind::RemovePolicies => "remove_policies",
            ErrorKind::ExpiredToken => "expired_token",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::MalformedToken => "malformed_token",
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::UnsupportedKeyAlgorithm => "unsupported_key_algorithm",
            ErrorKind::PublicKeysNotSupported => "public_keys_not_supported",
            ErrorKind::InvalidSymmetricKey => "invalid_symmetric_key",
            ErrorKind::PolicyEngine => "policy_engine",
            ErrorKind::Callout => "callout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<BoxError>,
    secondary: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            secondary: None,
        }
    }

    /// Wrap `cause` under `kind`, keeping the cause reachable through `source()`.
    pub fn wrap<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            context: None,
            source: Some(cause.into()),
            secondary: None,
        }
    }

    /// Attach both errors of a failed operation and its failed compensation.
    pub fn compose(primary: Error, secondary: Error) -> Self {
        let mut primary = primary;
        match primary.secondary.take() {
            Some(existing) => {
                primary.secondary = Some(Box::new(Error::compose(*existing, secondary)));
            }
            None => primary.secondary = Some(Box::new(secondary)),
        }
        primary
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn secondary(&self) -> Option<&Error> {
        self.secondary.as_deref()
    }

    /// Whether `kind` appears anywhere in this error's chain.
    pub fn contains(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        if let Some(secondary) = &self.secondary {
            if secondary.contains(kind) {
                return true;
            }
        }

        let mut next = self
            .source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = next {
            if let Some(inner) = err.downcast_ref::<Error>() {
                return inner.contains(kind);
            }
            if let Some(inner) = err.downcast_ref::<ErrorKind>() {
                if *inner == kind {
                    return true;
                }
            }
            next = err.source();
        }
        false
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(context) = &self.context {
            write!(f, ": {}", context)?;
        }
        if let Some(source) = &self.source {
            write!(f, " : {}", source)?;
        }
        if let Some(secondary) = &self.secondary {
            write!(f, " : {}", secondary)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status_kind = [
            ErrorKind::Canceled,
            ErrorKind::KeyExpired,
            ErrorKind::Authentication,
            ErrorKind::DomainAuthorization,
            ErrorKind::Authorization,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::InvalidPolicy,
            ErrorKind::MalformedEntity,
            ErrorKind::InvalidStatus,
            ErrorKind::InvalidEntityType,
            ErrorKind::PublicKeysNotSupported,
        ]
        .into_iter()
        .find(|kind| err.contains(*kind));

        match status_kind {
            Some(ErrorKind::Canceled) => AppError::ServiceUnavailable,
            Some(ErrorKind::KeyExpired | ErrorKind::Authentication) => {
                AppError::Unauthorized(anyhow::Error::new(err))
            }
            Some(ErrorKind::DomainAuthorization | ErrorKind::Authorization) => {
                AppError::Forbidden(anyhow::Error::new(err))
            }
            Some(ErrorKind::NotFound | ErrorKind::PublicKeysNotSupported) => {
                AppError::NotFound(anyhow::Error::new(err))
            }
            Some(ErrorKind::Conflict) => AppError::Conflict(anyhow::Error::new(err)),
            Some(_) => AppError::BadRequest(anyhow::Error::new(err)),
            None if err.contains(ErrorKind::Database) => {
                AppError::DatabaseError(anyhow::Error::new(err))
            }
            None => AppError::InternalError(anyhow::Error::new(err)),
        }
    }
}

/// Map a `sqlx` failure into the store taxonomy under the operation `kind`.
pub(crate) fn from_sqlx(kind: ErrorKind, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::wrap(kind, Error::wrap(ErrorKind::NotFound, err)),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::wrap(kind, Error::wrap(ErrorKind::Conflict, err))
        }
        _ => Error::wrap(kind, Error::wrap(ErrorKind::Database, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_wrap_keeps_inner_kind() {
        let err = Error::wrap(
            ErrorKind::Authentication,
            Error::new(ErrorKind::KeyExpired),
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.contains(ErrorKind::Authentication));
        assert!(err.contains(ErrorKind::KeyExpired));
        assert!(!err.contains(ErrorKind::Authorization));
    }

    #[test]
    fn test_contains_walks_foreign_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = Error::wrap(ErrorKind::ViewEntity, Error::wrap(ErrorKind::Database, io));
        assert!(err.contains(ErrorKind::Database));
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn test_compose_keeps_both_messages() {
        let primary = Error::wrap(
            ErrorKind::CreateEntity,
            Error::new(ErrorKind::MalformedEntity),
        );
        let rollback = Error::wrap(
            ErrorKind::RollbackPolicy,
            Error::new(ErrorKind::PolicyEngine).with_context("connection reset"),
        );
        let err = Error::compose(primary, rollback);

        assert!(err.contains(ErrorKind::MalformedEntity));
        assert!(err.contains(ErrorKind::RollbackPolicy));
        assert!(err.contains(ErrorKind::PolicyEngine));
        let msg = err.to_string();
        assert!(msg.contains("malformed entity specification"));
        assert!(msg.contains("failed to rollback policy"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_app_error_mapping() {
        let expired = Error::wrap(ErrorKind::Authentication, Error::new(ErrorKind::KeyExpired));
        assert_eq!(AppError::from(expired).status(), StatusCode::UNAUTHORIZED);

        let gate = Error::new(ErrorKind::DomainAuthorization);
        assert_eq!(AppError::from(gate).status(), StatusCode::FORBIDDEN);

        let invalid = Error::wrap(ErrorKind::InvalidPolicy, Error::new(ErrorKind::Platform));
        assert_eq!(AppError::from(invalid).status(), StatusCode::BAD_REQUEST);

        let missing = Error::wrap(ErrorKind::ViewEntity, Error::new(ErrorKind::NotFound));
        assert_eq!(AppError::from(missing).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_codes_are_snake_case() {
        assert_eq!(ErrorKind::DomainAuthorization.code(), "domain_authorization");
        assert_eq!(Error::new(ErrorKind::KeyExpired).code(), "key_expired");
    }
}
