//! Compliance transforms applied to message payloads in transit.
//!
//! A payload is concealed by encrypting then encoding, and revealed by the
//! reverse: decoding then decrypting. Encryption backends live outside
//! achgate and plug in through [`Decryptor`].

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Text encoding applied after encryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes.
    #[default]
    None,
    /// Standard base64 with padding.
    Base64,
}

impl Encoding {
    fn encode(self, bytes: Vec<u8>) -> Vec<u8> {
        match self {
            Self::None => bytes,
            Self::Base64 => STANDARD.encode(bytes).into_bytes(),
        }
    }

    fn decode(self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(bytes),
            Self::Base64 => {
                let trimmed = bytes.trim_ascii();
                STANDARD
                    .decode(trimmed)
                    .map_err(|e| Error::serialization(format!("base64 decode: {e}")))
            }
        }
    }
}

/// Encryption collaborator.
pub trait Decryptor: Send + Sync + fmt::Debug {
    /// Reverses [`Decryptor::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error when the ciphertext cannot be decrypted.
    fn decrypt(&self, ciphertext: Vec<u8>) -> Result<Vec<u8>>;

    /// Encrypts a plaintext payload.
    ///
    /// # Errors
    ///
    /// Returns an error when encryption fails.
    fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>>;
}

/// Passthrough used when no encryption is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecryption;

impl Decryptor for NoDecryption {
    fn decrypt(&self, ciphertext: Vec<u8>) -> Result<Vec<u8>> {
        Ok(ciphertext)
    }

    fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        Ok(plaintext)
    }
}

/// Encoding plus encryption, applied as a unit.
#[derive(Debug, Clone)]
pub struct Transformer {
    encoding: Encoding,
    decryptor: Arc<dyn Decryptor>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(Encoding::None)
    }
}

impl Transformer {
    /// Creates a transformer without encryption.
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            decryptor: Arc::new(NoDecryption),
        }
    }

    /// Replaces the encryption collaborator.
    #[must_use]
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    /// The configured encoding.
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decodes then decrypts a received payload.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    pub fn reveal(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let decoded = self.encoding.decode(payload)?;
        self.decryptor.decrypt(decoded)
    }

    /// Encrypts then encodes a payload for transport.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn conceal(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let encrypted = self.decryptor.encrypt(payload)?;
        Ok(self.encoding.encode(encrypted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// XOR "cipher" that makes ordering observable.
    #[derive(Debug)]
    struct Xor(u8);

    impl Decryptor for Xor {
        fn decrypt(&self, ciphertext: Vec<u8>) -> Result<Vec<u8>> {
            Ok(ciphertext.into_iter().map(|b| b ^ self.0).collect())
        }

        fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
            self.decrypt(plaintext)
        }
    }

    #[test]
    fn base64_reveal_reverses_conceal() {
        let transformer = Transformer::new(Encoding::Base64).with_decryptor(Arc::new(Xor(0x5a)));
        let concealed = transformer.conceal(b"{\"type\":\"x\"}".to_vec()).unwrap();
        assert!(concealed.iter().all(u8::is_ascii));
        assert_eq!(
            transformer.reveal(concealed).unwrap(),
            b"{\"type\":\"x\"}".to_vec()
        );
    }

    #[test]
    fn base64_tolerates_trailing_newline_and_rejects_garbage() {
        let transformer = Transformer::new(Encoding::Base64);
        assert_eq!(transformer.reveal(b"aGk=\n".to_vec()).unwrap(), b"hi".to_vec());
        assert!(transformer.reveal(b"***".to_vec()).is_err());
    }

    #[test]
    fn default_is_passthrough() {
        let transformer = Transformer::default();
        assert_eq!(transformer.reveal(b"raw".to_vec()).unwrap(), b"raw".to_vec());
    }
}
