use jsonwebtoken::{DecodingKey, EncodingKey, Header};

use super::{sign, verify, KeyAlgorithm, Tokenizer, TokenizerError};
use crate::models::{Key, PublicKeyInfo};

/// HMAC tokenizer. The shared secret never leaves the process, so there is
/// nothing to publish.
pub struct SymmetricTokenizer {
    algorithm: KeyAlgorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    kid: Option<String>,
}

impl SymmetricTokenizer {
    pub fn new(
        algorithm: KeyAlgorithm,
        secret: &[u8],
        kid: Option<String>,
    ) -> Result<Self, TokenizerError> {
        if !algorithm.is_symmetric() {
            return Err(TokenizerError::UnsupportedKeyAlgorithm(
                algorithm.to_string(),
            ));
        }
        if secret.is_empty() {
            return Err(TokenizerError::InvalidSymmetricKey);
        }

        tracing::info!(algorithm = %algorithm, "Symmetric tokenizer initialized");

        Ok(Self {
            algorithm,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            kid,
        })
    }
}

impl Tokenizer for SymmetricTokenizer {
    fn issue(&self, key: &Key) -> Result<String, TokenizerError> {
        let mut header = Header::new(self.algorithm.jwt());
        header.kid = self.kid.clone();
        sign(&header, key, &self.encoding)
    }

    fn parse(&self, token: &str) -> Result<Key, TokenizerError> {
        verify(token, self.algorithm, &self.decoding)
    }

    fn public_keys(&self) -> Result<Vec<PublicKeyInfo>, TokenizerError> {
        Err(TokenizerError::PublicKeysNotSupported)
    }
}
