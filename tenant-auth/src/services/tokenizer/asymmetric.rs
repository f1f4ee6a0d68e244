use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{decode_header, DecodingKey, EncodingKey, Header};
use std::fs;
use std::path::Path;

use super::{map_jwt_error, sign, verify, KeyAlgorithm, Tokenizer, TokenizerError};
use crate::models::{Key, PublicKeyInfo};

/// EdDSA (Ed25519) tokenizer identified by a key id.
pub struct AsymmetricTokenizer {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_key: PublicKeyInfo,
}

impl AsymmetricTokenizer {
    pub fn new(kid: impl Into<String>, signing_key: &SigningKey) -> Result<Self, TokenizerError> {
        let kid = kid.into();
        if kid.is_empty() {
            return Err(TokenizerError::InvalidKey(
                "key id is required for asymmetric keys".to_string(),
            ));
        }

        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| TokenizerError::InvalidKey(e.to_string()))?;
        let encoding = EncodingKey::from_ed_der(der.as_bytes());

        let x = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes());
        let decoding = DecodingKey::from_ed_components(&x)
            .map_err(|e| TokenizerError::InvalidKey(e.to_string()))?;

        let public_key = PublicKeyInfo {
            kid: kid.clone(),
            kty: "OKP".to_string(),
            alg: KeyAlgorithm::EdDsa.to_string(),
            key_use: "sig".to_string(),
            crv: "Ed25519".to_string(),
            x,
        };

        Ok(Self {
            kid,
            encoding,
            decoding,
            public_key,
        })
    }

    /// Load the signing key from a PKCS#8 PEM or DER file, or from raw
    /// 32-byte seed / 64-byte keypair bytes.
    pub fn from_file(kid: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            TokenizerError::InvalidKey(format!(
                "failed to read private key from {}: {}",
                path.display(),
                e
            ))
        })?;

        let signing_key = parse_signing_key(&bytes)?;
        tracing::info!(path = %path.display(), "EdDSA signing key loaded");
        Self::new(kid, &signing_key)
    }

    /// Fresh random key, for development and tests.
    pub fn generate(kid: impl Into<String>) -> Result<Self, TokenizerError> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::new(kid, &signing_key)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

fn parse_signing_key(bytes: &[u8]) -> Result<SigningKey, TokenizerError> {
    let invalid = |e: String| TokenizerError::InvalidKey(format!("failed to parse private key: {e}"));

    if let Ok(pem) = std::str::from_utf8(bytes) {
        if pem.trim_start().starts_with("-----BEGIN") {
            return SigningKey::from_pkcs8_pem(pem).map_err(|e| invalid(e.to_string()));
        }
    }

    match bytes.len() {
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(bytes);
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut pair = [0u8; 64];
            pair.copy_from_slice(bytes);
            SigningKey::from_keypair_bytes(&pair).map_err(|e| invalid(e.to_string()))
        }
        _ => SigningKey::from_pkcs8_der(bytes).map_err(|e| invalid(e.to_string())),
    }
}

impl Tokenizer for AsymmetricTokenizer {
    fn issue(&self, key: &Key) -> Result<String, TokenizerError> {
        let mut header = Header::new(KeyAlgorithm::EdDsa.jwt());
        header.kid = Some(self.kid.clone());
        sign(&header, key, &self.encoding)
    }

    fn parse(&self, token: &str) -> Result<Key, TokenizerError> {
        let header = decode_header(token).map_err(map_jwt_error)?;
        if let Some(kid) = &header.kid {
            if kid != &self.kid {
                return Err(TokenizerError::InvalidSignature);
            }
        }
        verify(token, KeyAlgorithm::EdDsa, &self.decoding)
    }

    fn public_keys(&self) -> Result<Vec<PublicKeyInfo>, TokenizerError> {
        Ok(vec![self.public_key.clone()])
    }
}
