//! Encryption of secret material at rest
//!
//! AES-256-GCM with a key derived as SHA-256 of the operator's master key.
//! Stored form is `base64(nonce || ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AppError;

const AES_GCM_NONCE_BYTES: usize = 12;

/// Symmetric cipher for secrets written to the federation data tree
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    /// Derive the cipher key from an operator-supplied secret
    pub fn from_master_key(master_key: &str) -> Result<Self, AppError> {
        if master_key.is_empty() {
            return Err(AppError::Config("master key must not be empty".to_string()));
        }

        let key = Sha256::digest(master_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| AppError::Encryption("invalid derived key length".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt raw bytes into nonce-prefixed ciphertext
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut nonce = [0_u8; AES_GCM_NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| AppError::Encryption("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(AES_GCM_NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt nonce-prefixed ciphertext; fails on any tampering or wrong key
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        if data.len() < AES_GCM_NONCE_BYTES {
            return Err(AppError::Encryption("ciphertext is too short".to_string()));
        }

        let (nonce, ciphertext) = data.split_at(AES_GCM_NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Encryption("decryption failed".to_string()))
    }

    /// Encrypt and base64-encode, ready to be written to disk
    pub fn seal(&self, data: &[u8]) -> Result<String, AppError> {
        Ok(BASE64_STANDARD.encode(self.encrypt(data)?))
    }

    /// Reverse of [`SecretBox::seal`]
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>, AppError> {
        let raw = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| AppError::Encryption("ciphertext is not valid base64".to_string()))?;
        self.decrypt(&raw)
    }
}
