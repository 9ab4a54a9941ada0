//! Symmetric encryption for `upstreams.api_key_encrypted` (§6.5
//! `encryption_key`). AES-256-GCM with the key derived from the configured
//! secret string via SHA-256, storing the nonce alongside the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is too short to contain a nonce")]
    Truncated,
    #[error("decryption failed, wrong key or corrupted ciphertext")]
    Aead,
    #[error("decrypted plaintext is not valid UTF-8")]
    NotUtf8,
}

fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Encrypts `plaintext` with `encryption_key`, returning `nonce || ciphertext`.
pub fn encrypt(encryption_key: &str, plaintext: &str) -> Vec<u8> {
    let key = derive_key(encryption_key);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key is always 32 bytes");
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .expect("AES-GCM encryption does not fail for valid inputs");
    let mut out = nonce_bytes.to_vec();
    out.append(&mut ciphertext);
    out
}

/// Inverse of [`encrypt`]. `stored` must be `nonce || ciphertext` as produced
/// there; an empty slice decrypts to an empty string (an upstream with no
/// configured secret, e.g. during local testing).
pub fn decrypt(encryption_key: &str, stored: &[u8]) -> Result<String, CryptoError> {
    if stored.is_empty() {
        return Ok(String::new());
    }
    if stored.len() < 12 {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = stored.split_at(12);
    let key = derive_key(encryption_key);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key is always 32 bytes");
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Aead)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
}
