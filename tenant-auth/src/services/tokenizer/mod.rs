//! Signing and verification of credential keys.
//!
//! Two implementations share the claim layout: [`SymmetricTokenizer`] for the
//! HMAC family and [`AsymmetricTokenizer`] for EdDSA, which also publishes its
//! verifying key as a JWKS entry.

mod asymmetric;
mod symmetric;

pub use asymmetric::AsymmetricTokenizer;
pub use symmetric::SymmetricTokenizer;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::TokenizerConfig;
use crate::error::{Error, ErrorKind};
use crate::models::{Key, KeyKind, PublicKeyInfo, Role};

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    /// Signature verified but the key is past its expiry; carries the claims.
    #[error("token is expired")]
    Expired(Box<Key>),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token signing algorithm")]
    UnsupportedAlgorithm,
    #[error("unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error("public keys are not supported in symmetric mode")]
    PublicKeysNotSupported,
    #[error("invalid symmetric key")]
    InvalidSymmetricKey,
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl TokenizerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenizerError::Expired(_) => ErrorKind::ExpiredToken,
            TokenizerError::InvalidSignature => ErrorKind::InvalidSignature,
            TokenizerError::Malformed(_) => ErrorKind::MalformedToken,
            TokenizerError::UnsupportedAlgorithm => ErrorKind::UnsupportedAlgorithm,
            TokenizerError::UnsupportedKeyAlgorithm(_) => ErrorKind::UnsupportedKeyAlgorithm,
            TokenizerError::PublicKeysNotSupported => ErrorKind::PublicKeysNotSupported,
            TokenizerError::InvalidSymmetricKey => ErrorKind::InvalidSymmetricKey,
            TokenizerError::InvalidKey(_) | TokenizerError::Signing(_) => ErrorKind::Internal,
        }
    }
}

impl From<TokenizerError> for Error {
    fn from(err: TokenizerError) -> Self {
        Error::wrap(err.kind(), err)
    }
}

pub trait Tokenizer: Send + Sync {
    /// Sign `key` into an opaque bearer.
    fn issue(&self, key: &Key) -> Result<String, TokenizerError>;

    /// Verify signature and expiry, returning the claims.
    fn parse(&self, token: &str) -> Result<Key, TokenizerError>;

    /// JWKS entries for verifying issued tokens.
    fn public_keys(&self) -> Result<Vec<PublicKeyInfo>, TokenizerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Hs256,
    Hs384,
    Hs512,
    EdDsa,
}

impl KeyAlgorithm {
    pub fn is_symmetric(self) -> bool {
        !matches!(self, KeyAlgorithm::EdDsa)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Hs256 => "HS256",
            KeyAlgorithm::Hs384 => "HS384",
            KeyAlgorithm::Hs512 => "HS512",
            KeyAlgorithm::EdDsa => "EdDSA",
        }
    }

    fn jwt(self) -> Algorithm {
        match self {
            KeyAlgorithm::Hs256 => Algorithm::HS256,
            KeyAlgorithm::Hs384 => Algorithm::HS384,
            KeyAlgorithm::Hs512 => Algorithm::HS512,
            KeyAlgorithm::EdDsa => Algorithm::EdDSA,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = TokenizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HS256" => Ok(KeyAlgorithm::Hs256),
            "HS384" => Ok(KeyAlgorithm::Hs384),
            "HS512" => Ok(KeyAlgorithm::Hs512),
            "EdDSA" => Ok(KeyAlgorithm::EdDsa),
            other => Err(TokenizerError::UnsupportedKeyAlgorithm(other.to_string())),
        }
    }
}

/// Whether `alg` names a supported symmetric algorithm.
pub fn is_symmetric(alg: &str) -> Result<bool, TokenizerError> {
    alg.parse::<KeyAlgorithm>().map(KeyAlgorithm::is_symmetric)
}

/// Build the tokenizer selected by configuration.
pub fn from_config(config: &TokenizerConfig) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
    let algorithm: KeyAlgorithm = config.algorithm.parse()?;
    if algorithm.is_symmetric() {
        let tokenizer = SymmetricTokenizer::new(
            algorithm,
            config.secret_key.as_bytes(),
            config.key_id.clone(),
        )?;
        return Ok(Arc::new(tokenizer));
    }

    let kid = config
        .key_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let tokenizer = match &config.private_key_path {
        Some(path) => AsymmetricTokenizer::from_file(kid, path)?,
        None => {
            return Err(TokenizerError::InvalidKey(
                "EdDSA requires a private key path".to_string(),
            ))
        }
    };
    Ok(Arc::new(tokenizer))
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    iss: String,
    iat: i64,
    #[serde(default)]
    exp: i64,
    #[serde(rename = "type")]
    kind: u32,
    role: u32,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    id: String,
}

impl Claims {
    fn from_key(key: &Key) -> Self {
        Self {
            sub: key.subject.clone(),
            iss: key.issuer.clone(),
            iat: key.issued_at.timestamp(),
            exp: key.expires_at.map_or(0, |t| t.timestamp()),
            kind: key.kind.as_u32(),
            role: key.role.as_u32(),
            domain: key.domain.clone(),
            user: key.user.clone(),
            id: key.id.clone(),
        }
    }

    fn into_key(self) -> Result<Key, TokenizerError> {
        let kind = KeyKind::from_u32(self.kind)
            .ok_or_else(|| TokenizerError::Malformed(format!("unknown key type {}", self.kind)))?;
        let role = Role::from_u32(self.role)
            .ok_or_else(|| TokenizerError::Malformed(format!("unknown role {}", self.role)))?;
        let expires_at = match self.exp {
            0 => None,
            exp => Some(timestamp(exp)?),
        };

        Ok(Key {
            id: self.id,
            kind,
            issuer: self.iss,
            subject: self.sub,
            user: self.user,
            domain: self.domain,
            role,
            issued_at: timestamp(self.iat)?,
            expires_at,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, TokenizerError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| TokenizerError::Malformed(format!("timestamp {secs} out of range")))
}

fn sign(header: &Header, key: &Key, encoding: &EncodingKey) -> Result<String, TokenizerError> {
    if key.expires_at.is_none() && key.kind != KeyKind::Api {
        return Err(TokenizerError::Malformed(
            "zero expiry is reserved for API keys".to_string(),
        ));
    }
    encode(header, &Claims::from_key(key), encoding)
        .map_err(|e| TokenizerError::Signing(e.to_string()))
}

/// Verify `token` under `algorithm` and enforce expiry.
fn verify(
    token: &str,
    algorithm: KeyAlgorithm,
    decoding: &DecodingKey,
) -> Result<Key, TokenizerError> {
    let mut validation = Validation::new(algorithm.jwt());
    // Expiry is enforced below so the expired claims can be returned.
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    validation.leeway = 0;

    let data = decode::<Claims>(token, decoding, &validation).map_err(map_jwt_error)?;
    let key = data.claims.into_key()?;
    if key.expired() {
        return Err(TokenizerError::Expired(Box::new(key)));
    }
    Ok(key)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenizerError {
    match err.kind() {
        JwtErrorKind::InvalidSignature => TokenizerError::InvalidSignature,
        JwtErrorKind::InvalidAlgorithm
        | JwtErrorKind::InvalidAlgorithmName
        | JwtErrorKind::MissingAlgorithm => TokenizerError::UnsupportedAlgorithm,
        _ => TokenizerError::Malformed(err.to_string()),
    }
}
