//! Masking of message bodies at rest.
//!
//! Job payloads sit in the database until delivery, so the text and HTML
//! bodies are sealed before they are persisted and opened by the worker right
//! before composing the outbound mail.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key: {0}")]
    Key(String),

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed: {0}")]
    Open(String),
}

/// Opaque encrypt/decrypt capability. Ciphertexts are printable strings so
/// they can live inside a JSON payload.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-GCM with a fresh random nonce per seal; output is
/// `hex(nonce || ciphertext || tag)`.
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; 32]) -> Result<Self, CipherError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CipherError::Key("failed to create AES-256-GCM key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from the hex-encoded `ENCRYPTION_KEY` setting.
    pub fn from_hex(key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(key.trim()).map_err(|e| CipherError::Key(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CipherError::Key("key must be 32 bytes".to_string()))?;
        Self::new(&key)
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Seal)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(hex::encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError> {
        let sealed = hex::decode(ciphertext).map_err(|e| CipherError::Open(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::Open("ciphertext too short".to_string()));
        }

        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CipherError::Open("bad nonce".to_string()))?;

        let mut in_out = body.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Open("wrong key or corrupted data".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_open_recovers_sealed_body() {
        let cipher = AesGcmCipher::new(&KEY).unwrap();
        let sealed = cipher.encrypt(b"<p>hello</p>").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"<p>hello</p>");
    }

    #[test]
    fn test_same_plaintext_seals_differently() {
        let cipher = AesGcmCipher::new(&KEY).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let sealed = AesGcmCipher::new(&KEY).unwrap().encrypt(b"secret").unwrap();
        let other = AesGcmCipher::new(&[9u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(CipherError::Open(_))));
    }

    #[test]
    fn test_garbage_ciphertext_rejected() {
        let cipher = AesGcmCipher::new(&KEY).unwrap();
        assert!(cipher.decrypt("not-hex").is_err());
        assert!(cipher.decrypt("abcd").is_err());
    }

    #[test]
    fn test_from_hex_validates_length() {
        assert!(AesGcmCipher::from_hex(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            AesGcmCipher::from_hex("abcd"),
            Err(CipherError::Key(_))
        ));
    }
}
