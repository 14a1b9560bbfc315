//! At-rest encryption of turn contents: AES-256-GCM, stored as
//! base64(nonce || ciphertext).

use crate::types::{ParleyError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ParleyError::Crypto(format!("Encryption key is not valid base64: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(ParleyError::Crypto(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
            .into());
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| ParleyError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(envelope))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>> {
        let bytes = STANDARD
            .decode(envelope.trim())
            .map_err(|e| ParleyError::Crypto(format!("Envelope is not valid base64: {}", e)))?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(ParleyError::Crypto("Envelope too short".to_string()).into());
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ParleyError::Crypto(format!("Decryption failed: {}", e)).into())
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        self.encrypt(plaintext.as_bytes())
    }
}
